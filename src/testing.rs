//! In-memory stand-ins for the crypto backend and the clock, plus a sample
//! IdP configuration, for tests of code that embeds the handshake.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use dashmap::DashMap;
use time::{Duration, OffsetDateTime};

use crate::{
    assertion::{Assertion, Conditions, NameId},
    attributes::{AttributeMapping, Attributes, LocalField},
    authn_request::{ProtocolBinding, RequestedAuthnContext, PASSWORD_PROTECTED_TRANSPORT},
    binder::AccountPolicy,
    logout::LogoutStatus,
    redirect_guard::RedirectGuard,
    settings::{
        IdentityProvider, IdpTrust, SecurityPolicy, ServiceProvider, SettingsRegistry, SpSettings,
    },
    toolkit::{
        authn_request_redirect, enforce_logout_policy, enforce_response_policy,
        logout_request_redirect, metadata_document, AssertionFacts, AuthnRedirect, LogoutRedirect,
        ResponseFacts, SamlToolkit, SubjectConfirmation, BEARER,
    },
    utils::{random_string, Clock},
    ToolkitError, ValidationFailure, NAME_ID_FORMAT_PERSISTENT, STATUS_SUCCESS,
};

pub const MAIL: &str = "urn:oid:0.9.2342.19200300.100.1.3";
pub const EPPN: &str = "urn:oid:1.3.6.1.4.1.5923.1.1.1.6";
pub const CN: &str = "urn:oid:2.5.4.3";

/// `idp1`: a Shibboleth IdP with auto-signup keyed on email and eppn.
pub fn sample_settings() -> SpSettings {
    SpSettings {
        idp_key: "idp1".into(),
        title: Some("Example University".into()),
        description: None,
        sp: ServiceProvider {
            entity_id: "https://app.example/saml/sp".into(),
            acs_url: "https://app.example/saml/acs/idp1".into(),
            sls_url: Some("https://app.example/saml/sls/idp1".into()),
            name_id_format: NAME_ID_FORMAT_PERSISTENT.into(),
            certificate: None,
            private_key: None,
            organization: None,
            contacts: Vec::new(),
        },
        idp: IdentityProvider {
            entity_id: "https://idp.example/shibboleth".into(),
            sso_url: "https://idp.example/idp/profile/SAML2/Redirect/SSO".into(),
            slo_url: Some("https://idp.example/idp/profile/SAML2/Redirect/SLO".into()),
            trust: IdpTrust::Certificate(Vec::new()),
            valid_until: None,
            cache_duration: None,
            loaded_at: OffsetDateTime::now_utc(),
        },
        security: SecurityPolicy::default(),
        attribute_mapping: AttributeMapping::new()
            .map(MAIL, LocalField::Email)
            .map(EPPN, LocalField::UniqueId)
            .map(CN, LocalField::FullName),
        account_policy: AccountPolicy {
            allow_auto_signup: true,
            required_attributes: vec![LocalField::Email, LocalField::UniqueId],
            ..Default::default()
        },
        state_expiry: Duration::seconds(300),
    }
}

pub fn sample_registry() -> SettingsRegistry {
    SettingsRegistry::from_resolved([sample_settings()], RedirectGuard::default())
}

/// A response the IdP could have sent, described by its facts rather than
/// its XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResponse {
    facts: ResponseFacts,
    signature_valid: bool,
}

impl FakeResponse {
    /// A signed, in-window response answering `request_id` for `settings`.
    pub fn for_request(
        settings: &SpSettings,
        request_id: &str,
        name_id: &str,
        now: OffsetDateTime,
    ) -> Self {
        let expires = now + Duration::minutes(5);
        let attributes = Attributes::new()
            .with(MAIL, [name_id])
            .with(EPPN, [name_id])
            .with(CN, ["Jane Doe"]);
        Self {
            facts: ResponseFacts {
                destination: Some(settings.sp.acs_url.clone()),
                in_response_to: Some(request_id.to_string()),
                issuer: Some(settings.idp.entity_id.clone()),
                status_code: STATUS_SUCCESS.to_string(),
                signed: false,
                assertion: Some(AssertionFacts {
                    id: format!("_a{}", random_string(16)),
                    issuer: settings.idp.entity_id.clone(),
                    signed: true,
                    encrypted: false,
                    name_id: Some(NameId::new(name_id).with_format(NAME_ID_FORMAT_PERSISTENT)),
                    name_id_encrypted: false,
                    session_index: Some(format!("_s{}", random_string(8))),
                    authn_instant: Some(now),
                    authn_context_class: Some(PASSWORD_PROTECTED_TRANSPORT.to_string()),
                    attributes: Some(attributes),
                    conditions: Conditions {
                        not_before: Some(now - Duration::seconds(30)),
                        not_on_or_after: Some(expires),
                        audiences: vec![settings.sp.entity_id.clone()],
                    },
                    confirmations: vec![SubjectConfirmation {
                        method: BEARER.to_string(),
                        recipient: Some(settings.sp.acs_url.clone()),
                        not_on_or_after: Some(expires),
                        in_response_to: Some(request_id.to_string()),
                    }],
                }),
            },
            signature_valid: true,
        }
    }

    fn assertion_mut(&mut self) -> Option<&mut AssertionFacts> {
        self.facts.assertion.as_mut()
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        if let Some(assertion) = self.assertion_mut() {
            assertion.attributes = Some(attributes);
        }
        self
    }

    pub fn with_assertion_id(mut self, id: &str) -> Self {
        if let Some(assertion) = self.assertion_mut() {
            assertion.id = id.to_string();
        }
        self
    }

    /// Moves the validity window so that it closed at `at`.
    pub fn expired_at(mut self, at: OffsetDateTime) -> Self {
        if let Some(assertion) = self.assertion_mut() {
            assertion.conditions.not_before = Some(at - Duration::minutes(5));
            assertion.conditions.not_on_or_after = Some(at);
            for confirmation in &mut assertion.confirmations {
                confirmation.not_on_or_after = Some(at);
            }
        }
        self
    }

    pub fn with_invalid_signature(self) -> Self {
        Self {
            signature_valid: false,
            ..self
        }
    }

    pub fn with_status(mut self, status_code: &str) -> Self {
        self.facts.status_code = status_code.to_string();
        self
    }

    pub fn into_facts(self) -> ResponseFacts {
        self.facts
    }
}

#[derive(Debug, Clone)]
struct FakeLogoutResponse {
    in_response_to: String,
    issuer: String,
    status_code: String,
}

/// Toolkit that builds real redirect messages but validates responses issued
/// through [`MemoryToolkit::issue`] instead of parsing XML. Policy checks are
/// the same as for the XML backend.
#[derive(Debug, Default)]
pub struct MemoryToolkit {
    responses: DashMap<String, FakeResponse>,
    logout_responses: DashMap<String, FakeLogoutResponse>,
    validations: AtomicUsize,
}

impl MemoryToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a response and returns the opaque `SAMLResponse` value that
    /// stands for it.
    pub fn issue(&self, response: FakeResponse) -> String {
        let token = format!("fake-response-{}", random_string(24));
        self.responses.insert(token.clone(), response);
        token
    }

    pub fn issue_logout(
        &self,
        settings: &SpSettings,
        in_response_to: &str,
        status_code: &str,
    ) -> String {
        let token = format!("fake-logout-{}", random_string(24));
        self.logout_responses.insert(
            token.clone(),
            FakeLogoutResponse {
                in_response_to: in_response_to.to_string(),
                issuer: settings.idp.entity_id.clone(),
                status_code: status_code.to_string(),
            },
        );
        token
    }

    /// Number of `validate_response` calls so far.
    pub fn validation_calls(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }
}

impl SamlToolkit for MemoryToolkit {
    fn build_authn_request(
        &self,
        settings: &SpSettings,
        requested_context: Option<&RequestedAuthnContext>,
        now: OffsetDateTime,
    ) -> Result<AuthnRedirect, ToolkitError> {
        authn_request_redirect(settings, requested_context, now, None)
    }

    fn validate_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        expected_request_id: &str,
        now: OffsetDateTime,
    ) -> Result<Assertion, ValidationFailure> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .get(raw_response)
            .map(|entry| entry.value().clone())
            .ok_or(ValidationFailure::InvalidEncoding)?;
        if !response.signature_valid {
            return Err(ValidationFailure::InvalidSignature);
        }
        enforce_response_policy(settings, response.facts, expected_request_id, now)
    }

    fn build_logout_request(
        &self,
        settings: &SpSettings,
        name_id: &NameId,
        session_index: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<LogoutRedirect, ToolkitError> {
        logout_request_redirect(settings, name_id, session_index, now, None)
    }

    fn validate_logout_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        _binding: ProtocolBinding,
        expected_request_id: &str,
        _now: OffsetDateTime,
    ) -> Result<LogoutStatus, ValidationFailure> {
        let response = self
            .logout_responses
            .get(raw_response)
            .map(|entry| entry.value().clone())
            .ok_or(ValidationFailure::InvalidEncoding)?;
        enforce_logout_policy(
            settings,
            Some(&response.in_response_to),
            Some(&response.issuer),
            None,
            response.status_code,
            expected_request_id,
        )
    }

    fn metadata_xml(
        &self,
        settings: &SpSettings,
        now: OffsetDateTime,
    ) -> Result<Vec<u8>, ToolkitError> {
        metadata_document(settings, None, now).map(String::into_bytes)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}
