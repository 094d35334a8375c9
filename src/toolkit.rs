//! The seam between the handshake and the SAML/XML crypto backend.
//!
//! Backends only have to turn raw messages into [`ResponseFacts`]; the
//! checks that decide whether those facts are acceptable for an IdP live in
//! [`enforce_response_policy`] and are shared by every backend.

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    assertion::{Assertion, Conditions, NameId},
    attributes::Attributes,
    authn_request::{AuthnRequestBuilder, ProtocolBinding, RequestedAuthnContext},
    logout::{LogoutRequestBuilder, LogoutStatus},
    redirect::{redirect_url, RedirectSigner},
    settings::SpSettings,
    sp_metadata::SpMetadataBuilder,
    ToolkitError, ValidationFailure, STATUS_SUCCESS,
};

/// Published metadata stays valid this long unless configured otherwise.
const METADATA_VALIDITY: Duration = Duration::days(2);
const METADATA_CACHE_DURATION: Duration = Duration::days(7);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnRedirect {
    pub url: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRedirect {
    pub url: String,
    pub request_id: String,
}

pub trait SamlToolkit: Send + Sync {
    fn build_authn_request(
        &self,
        settings: &SpSettings,
        requested_context: Option<&RequestedAuthnContext>,
        now: OffsetDateTime,
    ) -> Result<AuthnRedirect, ToolkitError>;

    /// `raw_response` is the `SAMLResponse` form value as posted to the ACS.
    fn validate_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        expected_request_id: &str,
        now: OffsetDateTime,
    ) -> Result<Assertion, ValidationFailure>;

    fn build_logout_request(
        &self,
        settings: &SpSettings,
        name_id: &NameId,
        session_index: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<LogoutRedirect, ToolkitError>;

    fn validate_logout_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        binding: ProtocolBinding,
        expected_request_id: &str,
        now: OffsetDateTime,
    ) -> Result<LogoutStatus, ValidationFailure>;

    fn metadata_xml(&self, settings: &SpSettings, now: OffsetDateTime)
        -> Result<Vec<u8>, ToolkitError>;
}

/// Builds the redirect that starts a login at the IdP. The request ID doubles
/// as RelayState.
pub fn authn_request_redirect(
    settings: &SpSettings,
    requested_context: Option<&RequestedAuthnContext>,
    now: OffsetDateTime,
    signer: Option<&dyn RedirectSigner>,
) -> Result<AuthnRedirect, ToolkitError> {
    let builder = AuthnRequestBuilder::new()
        .auto_id()
        .issue_instant(now)
        .issuer(&settings.sp.entity_id)
        .destination(&settings.idp.sso_url)
        .protocol_binding(ProtocolBinding::Post)
        .consumer_url(&settings.sp.acs_url)
        .name_format(&settings.sp.name_id_format)
        .requested_context(requested_context.cloned())
        .force_authn(settings.security.force_authn)
        .is_passive(settings.security.is_passive);
    let request_id = builder
        .request_id()
        .ok_or(ToolkitError::MissingField("ID"))?
        .to_string();
    let encoded = builder.build_and_encode()?;
    let url = redirect_url(
        &settings.idp.sso_url,
        &encoded,
        Some(&request_id),
        signer,
    )?;
    debug!(idp = %settings.idp_key, request_id = %request_id, signed = signer.is_some(), "built AuthnRequest");
    Ok(AuthnRedirect { url, request_id })
}

pub fn logout_request_redirect(
    settings: &SpSettings,
    name_id: &NameId,
    session_index: Option<&str>,
    now: OffsetDateTime,
    signer: Option<&dyn RedirectSigner>,
) -> Result<LogoutRedirect, ToolkitError> {
    let slo_url = settings
        .idp
        .slo_url
        .as_deref()
        .ok_or(ToolkitError::NoLogoutEndpoint)?;
    let builder = LogoutRequestBuilder::new()
        .auto_id()
        .issue_instant(now)
        .issuer(&settings.sp.entity_id)
        .destination(slo_url)
        .name_id(&name_id.value, name_id.format.as_deref())
        .session_index(session_index);
    let request_id = builder
        .request_id()
        .ok_or(ToolkitError::MissingField("ID"))?
        .to_string();
    let encoded = builder.build_and_encode()?;
    let url = redirect_url(
        slo_url,
        &encoded,
        Some(&request_id),
        signer,
    )?;
    debug!(idp = %settings.idp_key, request_id = %request_id, "built LogoutRequest");
    Ok(LogoutRedirect { url, request_id })
}

/// SP metadata for `settings`. With an `id` and `signMetadata` set, the
/// document carries a signature template for the backend to fill in.
pub fn metadata_document(
    settings: &SpSettings,
    id: Option<&str>,
    now: OffsetDateTime,
) -> Result<String, ToolkitError> {
    let security = &settings.security;
    let mut builder = SpMetadataBuilder::new()
        .entity_id(&settings.sp.entity_id)
        .acs_url(&settings.sp.acs_url)
        .sls_url(settings.sp.sls_url.as_deref())
        .name_id_format(&settings.sp.name_id_format)
        .authn_requests_signed(security.authn_requests_signed)
        .want_assertions_signed(security.want_assertions_signed)
        .signing_certificate(settings.sp.certificate.as_deref())
        .encryption_certificate(settings.sp.certificate.as_deref())
        .valid_until(
            security
                .metadata_valid_until
                .unwrap_or(now + METADATA_VALIDITY),
        )
        .cache_duration(
            security
                .metadata_cache_duration
                .unwrap_or(METADATA_CACHE_DURATION),
        )
        .organization(settings.sp.organization.clone())
        .contacts(settings.sp.contacts.clone());
    if let Some(id) = id {
        builder = builder.id(id);
        if security.sign_metadata {
            builder =
                builder.signature_template(security.signature_algorithm, security.digest_algorithm);
        }
    }
    builder.build()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmation {
    pub method: String,
    pub recipient: Option<String>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub in_response_to: Option<String>,
}

pub const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// What a backend extracted from one assertion. Signatures have already been
/// verified cryptographically; `signed` only records whether one was present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFacts {
    pub id: String,
    pub issuer: String,
    pub signed: bool,
    pub encrypted: bool,
    pub name_id: Option<NameId>,
    pub name_id_encrypted: bool,
    pub session_index: Option<String>,
    pub authn_instant: Option<OffsetDateTime>,
    pub authn_context_class: Option<String>,
    /// `None` when the assertion has no AttributeStatement.
    pub attributes: Option<Attributes>,
    pub conditions: Conditions,
    pub confirmations: Vec<SubjectConfirmation>,
}

/// What a backend extracted from a Response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFacts {
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub status_code: String,
    pub signed: bool,
    pub assertion: Option<AssertionFacts>,
}

fn check_issuer(expected: &str, found: &str) -> Result<(), ValidationFailure> {
    if expected != found {
        return Err(ValidationFailure::IssuerMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// Applies the IdP's security policy to a parsed response.
pub fn enforce_response_policy(
    settings: &SpSettings,
    facts: ResponseFacts,
    expected_request_id: &str,
    now: OffsetDateTime,
) -> Result<Assertion, ValidationFailure> {
    let security = &settings.security;
    let skew = security.allowed_clock_skew;

    if facts.status_code != STATUS_SUCCESS {
        return Err(ValidationFailure::Status(facts.status_code));
    }

    match facts.destination.as_deref() {
        Some(destination) if destination != settings.sp.acs_url => {
            return Err(ValidationFailure::DestinationMismatch)
        }
        None if security.strict && facts.signed => {
            return Err(ValidationFailure::DestinationMismatch)
        }
        _ => {}
    }

    match facts.in_response_to.as_deref() {
        Some(in_response_to) if in_response_to == expected_request_id => {}
        None if !security.strict => {}
        _ => return Err(ValidationFailure::InResponseToMismatch),
    }

    if let Some(issuer) = facts.issuer.as_deref() {
        check_issuer(&settings.idp.entity_id, issuer)?;
    }

    let assertion = facts
        .assertion
        .ok_or_else(|| ValidationFailure::Malformed("response has no assertion".into()))?;

    if !facts.signed && !assertion.signed {
        return Err(ValidationFailure::SignatureMissing);
    }
    if security.want_messages_signed && !facts.signed {
        return Err(ValidationFailure::MessageNotSigned);
    }
    if security.want_assertions_signed && !assertion.signed {
        return Err(ValidationFailure::AssertionNotSigned);
    }
    if security.want_assertions_encrypted && !assertion.encrypted {
        return Err(ValidationFailure::AssertionNotEncrypted);
    }

    check_issuer(&settings.idp.entity_id, &assertion.issuer)?;
    assertion
        .conditions
        .check(now, skew, &settings.sp.entity_id)?;

    if security.strict {
        let bearer = assertion
            .confirmations
            .iter()
            .find(|confirmation| confirmation.method == BEARER)
            .ok_or_else(|| ValidationFailure::Malformed("no bearer subject confirmation".into()))?;
        if bearer.recipient.as_deref() != Some(settings.sp.acs_url.as_str()) {
            return Err(ValidationFailure::RecipientMismatch);
        }
        if let Some(in_response_to) = bearer.in_response_to.as_deref() {
            if in_response_to != expected_request_id {
                return Err(ValidationFailure::InResponseToMismatch);
            }
        }
        match bearer.not_on_or_after {
            Some(not_on_or_after) if now - skew >= not_on_or_after => {
                return Err(ValidationFailure::Expired)
            }
            Some(_) => {}
            None => {
                return Err(ValidationFailure::Malformed(
                    "subject confirmation without NotOnOrAfter".into(),
                ))
            }
        }
    }

    let name_id = assertion.name_id.ok_or(ValidationFailure::MissingNameId)?;
    if name_id.value.trim().is_empty() {
        return Err(ValidationFailure::MissingNameId);
    }
    if security.want_name_id_encrypted && !assertion.name_id_encrypted {
        return Err(ValidationFailure::NameIdNotEncrypted);
    }
    if security.want_attribute_statement && assertion.attributes.is_none() {
        return Err(ValidationFailure::Malformed(
            "assertion has no AttributeStatement".into(),
        ));
    }

    Ok(Assertion {
        id: assertion.id,
        issuer: assertion.issuer,
        name_id,
        session_index: assertion.session_index,
        authn_instant: assertion.authn_instant,
        authn_context_class: assertion.authn_context_class,
        attributes: assertion.attributes.unwrap_or_default(),
        conditions: assertion.conditions,
    })
}

/// Checks a parsed LogoutResponse against the outstanding LogoutRequest.
pub fn enforce_logout_policy(
    settings: &SpSettings,
    in_response_to: Option<&str>,
    issuer: Option<&str>,
    destination: Option<&str>,
    status_code: String,
    expected_request_id: &str,
) -> Result<LogoutStatus, ValidationFailure> {
    if let Some(issuer) = issuer {
        check_issuer(&settings.idp.entity_id, issuer)?;
    }
    if let (Some(destination), Some(sls_url)) = (destination, settings.sp.sls_url.as_deref()) {
        if settings.security.strict && destination != sls_url {
            return Err(ValidationFailure::DestinationMismatch);
        }
    }
    let in_response_to = in_response_to.ok_or(ValidationFailure::InResponseToMismatch)?;
    if in_response_to != expected_request_id {
        return Err(ValidationFailure::InResponseToMismatch);
    }
    Ok(LogoutStatus {
        in_response_to: in_response_to.to_string(),
        status_code,
    })
}

#[cfg(test)]
mod tests {
    use url::Url;

    use crate::{
        redirect::decode_redirect_payload,
        testing::{sample_settings, FakeResponse},
    };

    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn facts(request_id: &str) -> ResponseFacts {
        FakeResponse::for_request(&sample_settings(), request_id, "user@example.org", now())
            .into_facts()
    }

    #[test]
    fn can_build_authn_redirect() {
        let settings = sample_settings();
        let redirect = authn_request_redirect(&settings, None, now(), None).unwrap();
        assert!(redirect.request_id.starts_with("_id"));

        let url = Url::parse(&redirect.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[1], ("RelayState".into(), redirect.request_id.clone()));
        let xml = String::from_utf8(decode_redirect_payload(&pairs[0].1).unwrap()).unwrap();
        assert!(xml.contains(&redirect.request_id));
        assert!(xml.contains(&settings.sp.acs_url));
    }

    #[test]
    fn logout_needs_an_slo_endpoint() {
        let mut settings = sample_settings();
        settings.idp.slo_url = None;
        let result = logout_request_redirect(&settings, &NameId::new("u"), None, now(), None);
        assert_eq!(result, Err(ToolkitError::NoLogoutEndpoint));
    }

    #[test]
    fn metadata_defaults_validity_and_cache() {
        let xml = metadata_document(&sample_settings(), None, now()).unwrap();
        assert!(xml.contains("validUntil="));
        assert!(xml.contains(r#"cacheDuration="PT604800S""#));
        assert!(xml.contains("AssertionConsumerService"));
    }

    #[test]
    fn accepts_a_well_formed_response() {
        let assertion =
            enforce_response_policy(&sample_settings(), facts("_id1"), "_id1", now()).unwrap();
        assert_eq!(assertion.name_id.value, "user@example.org");
    }

    #[test]
    fn rejects_response_for_another_request() {
        assert_eq!(
            enforce_response_policy(&sample_settings(), facts("_id1"), "_id2", now()),
            Err(ValidationFailure::InResponseToMismatch)
        );
    }

    #[test]
    fn rejects_failed_status() {
        let mut facts = facts("_id1");
        facts.status_code = "urn:oasis:names:tc:SAML:2.0:status:Responder".into();
        assert!(matches!(
            enforce_response_policy(&sample_settings(), facts, "_id1", now()),
            Err(ValidationFailure::Status(_))
        ));
    }

    #[test]
    fn rejects_unsigned_assertion_when_required() {
        let mut facts = facts("_id1");
        facts.signed = true;
        facts.assertion.as_mut().unwrap().signed = false;
        assert_eq!(
            enforce_response_policy(&sample_settings(), facts, "_id1", now()),
            Err(ValidationFailure::AssertionNotSigned)
        );
    }

    #[test]
    fn rejects_foreign_issuer_and_audience() {
        let mut foreign = facts("_id1");
        foreign.assertion.as_mut().unwrap().issuer = "https://evil.example".into();
        assert!(matches!(
            enforce_response_policy(&sample_settings(), foreign, "_id1", now()),
            Err(ValidationFailure::IssuerMismatch { .. })
        ));

        let mut audience = facts("_id1");
        audience.assertion.as_mut().unwrap().conditions.audiences = vec!["other-sp".into()];
        assert_eq!(
            enforce_response_policy(&sample_settings(), audience, "_id1", now()),
            Err(ValidationFailure::AudienceMismatch)
        );
    }

    #[test]
    fn rejects_wrong_recipient() {
        let mut facts = facts("_id1");
        facts.assertion.as_mut().unwrap().confirmations[0].recipient =
            Some("https://evil.example/acs".into());
        assert_eq!(
            enforce_response_policy(&sample_settings(), facts, "_id1", now()),
            Err(ValidationFailure::RecipientMismatch)
        );
    }

    #[test]
    fn logout_response_must_answer_our_request() {
        let settings = sample_settings();
        let status = enforce_logout_policy(
            &settings,
            Some("_id9"),
            Some(&settings.idp.entity_id),
            None,
            STATUS_SUCCESS.into(),
            "_id9",
        )
        .unwrap();
        assert!(status.is_success());

        assert_eq!(
            enforce_logout_policy(&settings, None, None, None, STATUS_SUCCESS.into(), "_id9"),
            Err(ValidationFailure::InResponseToMismatch)
        );
    }
}
