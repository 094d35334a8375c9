//! libxml + xmlsec backend: verifies XML signatures against the IdP's trust
//! material, decrypts what the IdP encrypted for us, and hands the extracted
//! facts to the shared policy checks.

use libxml::{parser::Parser as XmlParser, tree::Document, tree::Node, xpath::Context};
use openssl::pkey::{PKey, Private};
use time::{format_description::well_known::Iso8601, OffsetDateTime};
use tracing::debug;
use xmlsec::{XmlSecDocumentExt as _, XmlSecKey, XmlSecKeyFormat, XmlSecSignatureContext};

use crate::{
    assertion::{Assertion, Conditions, NameId},
    attributes::Attributes,
    authn_request::{ProtocolBinding, RequestedAuthnContext},
    decrypt::decrypt_element,
    logout::LogoutStatus,
    redirect::{
        decode_post_payload, decode_redirect_payload, OpensslRedirectSigner, RedirectSigner,
    },
    settings::{IdpTrust, SpSettings},
    toolkit::{
        authn_request_redirect, enforce_logout_policy, enforce_response_policy,
        logout_request_redirect, metadata_document, AssertionFacts, AuthnRedirect, LogoutRedirect,
        ResponseFacts, SamlToolkit, SubjectConfirmation,
    },
    utils::{
        decode_xml_base64, new_request_id,
        xml::{children, is_element, optional_child, required_child, text, DS, MD, SAML, SAMLP},
    },
    ToolkitError, ValidationFailure,
};

fn malformed(reason: &str) -> ValidationFailure {
    ValidationFailure::Malformed(reason.to_string())
}

fn parse_instant(value: &str) -> Result<OffsetDateTime, ValidationFailure> {
    OffsetDateTime::parse(value, &Iso8601::DEFAULT).map_err(|_| malformed("invalid xs:dateTime"))
}

fn instant_attribute(node: &Node, name: &str) -> Result<Option<OffsetDateTime>, ValidationFailure> {
    node.get_attribute(name)
        .map(|value| parse_instant(&value))
        .transpose()
}

/// Parses untrusted XML. DTDs are refused outright.
fn parse_untrusted(xml: &[u8]) -> Result<Document, ValidationFailure> {
    if xml
        .windows(b"<!DOCTYPE".len())
        .any(|window| window.eq_ignore_ascii_case(b"<!DOCTYPE"))
    {
        return Err(malformed("DOCTYPE is not allowed"));
    }
    XmlParser::default()
        .parse_string(xml)
        .map_err(|_| malformed("message is not well-formed XML"))
}

fn root_element(
    document: &Document,
    namespace: &str,
    local_name: &str,
) -> Result<Node, ValidationFailure> {
    document
        .get_root_element()
        .filter(|root| is_element(root, namespace, local_name))
        .ok_or_else(|| ValidationFailure::Malformed(format!("root element is not {local_name}")))
}

fn status_code(message: &Node) -> Result<String, ValidationFailure> {
    let status = required_child(message, SAMLP, "Status")?;
    required_child(&status, SAMLP, "StatusCode")?
        .get_attribute("Value")
        .ok_or_else(|| malformed("StatusCode without Value"))
}

fn issuer(node: &Node) -> Result<Option<String>, ValidationFailure> {
    Ok(optional_child(node, SAML, "Issuer")?.map(|issuer| text(&issuer)))
}

fn signing_key(trust: &IdpTrust, signature: &Node) -> Result<XmlSecKey, ValidationFailure> {
    let der = match trust {
        IdpTrust::Certificate(der) => der.clone(),
        IdpTrust::Fingerprint { .. } => {
            // Only the certificate embedded in the signature is available;
            // it is used once its fingerprint matches.
            let key_info = required_child(signature, DS, "KeyInfo")?;
            let x509_data = required_child(&key_info, DS, "X509Data")?;
            let certificate = required_child(&x509_data, DS, "X509Certificate")?;
            let der = decode_xml_base64(&text(&certificate))
                .map_err(|_| ValidationFailure::InvalidEncoding)?;
            if !trust.accepts(&der) {
                debug!("signing certificate does not match the configured fingerprint");
                return Err(ValidationFailure::InvalidSignature);
            }
            der
        }
    };
    XmlSecKey::from_memory(&der, XmlSecKeyFormat::CertDer, None)
        .map_err(|_| ValidationFailure::InvalidSignature)
}

/// Verifies `signature`, an enveloped signature over `signed`. The reference
/// must point at `signed` by ID and `signature` must be the first signature in
/// the document, since that is the one xmlsec checks.
fn verify_enveloped(
    document: &Document,
    trust: &IdpTrust,
    signed: &Node,
    signature: &Node,
    id_path: &str,
) -> Result<(), ValidationFailure> {
    let id = signed
        .get_attribute("ID")
        .ok_or_else(|| malformed("signed element without ID"))?;
    let signed_info = required_child(signature, DS, "SignedInfo")?;
    let references = children(&signed_info, DS, "Reference");
    if references.len() != 1
        || references[0].get_attribute("URI").as_deref() != Some(format!("#{id}").as_str())
    {
        return Err(ValidationFailure::InvalidSignature);
    }

    let mut context = Context::new(document).map_err(|_| malformed("cannot create XPath context"))?;
    context
        .register_namespace("ds", DS)
        .map_err(|_| malformed("cannot register namespace"))?;
    let preceding = context
        .findvalue(
            "count(preceding::ds:Signature | ancestor::ds:Signature)",
            Some(signature),
        )
        .map_err(|_| malformed("cannot locate signature"))?;
    if preceding.trim() != "0" {
        return Err(ValidationFailure::InvalidSignature);
    }

    let mut sigctx = XmlSecSignatureContext::new();
    sigctx.insert_key(signing_key(trust, signature)?);
    document
        .specify_idattr(id_path, "ID", Some(&[("samlp", SAMLP), ("saml", SAML)]))
        .map_err(|_| malformed("duplicate or missing ID attributes"))?;

    match sigctx.verify_document(document) {
        Ok(true) => Ok(()),
        _ => Err(ValidationFailure::InvalidSignature),
    }
}

fn decryption_key(settings: &SpSettings) -> Result<PKey<Private>, ValidationFailure> {
    let pem = settings
        .sp
        .private_key
        .as_deref()
        .ok_or(ValidationFailure::DecryptionFailed)?;
    PKey::private_key_from_pem(pem).map_err(|_| ValidationFailure::DecryptionFailed)
}

fn name_id(node: &Node) -> NameId {
    NameId {
        value: text(node),
        format: node.get_attribute("Format"),
    }
}

fn confirmations(subject: &Node) -> Result<Vec<SubjectConfirmation>, ValidationFailure> {
    children(subject, SAML, "SubjectConfirmation")
        .iter()
        .map(|confirmation| {
            let data = optional_child(confirmation, SAML, "SubjectConfirmationData")?;
            Ok(SubjectConfirmation {
                method: confirmation.get_attribute("Method").unwrap_or_default(),
                recipient: data.as_ref().and_then(|data| data.get_attribute("Recipient")),
                not_on_or_after: match &data {
                    Some(data) => instant_attribute(data, "NotOnOrAfter")?,
                    None => None,
                },
                in_response_to: data.as_ref().and_then(|data| data.get_attribute("InResponseTo")),
            })
        })
        .collect()
}

fn conditions(assertion: &Node) -> Result<Conditions, ValidationFailure> {
    let Some(conditions) = optional_child(assertion, SAML, "Conditions")? else {
        return Ok(Conditions::default());
    };
    let audiences = children(&conditions, SAML, "AudienceRestriction")
        .iter()
        .flat_map(|restriction| children(restriction, SAML, "Audience"))
        .map(|audience| text(&audience))
        .collect();
    Ok(Conditions {
        not_before: instant_attribute(&conditions, "NotBefore")?,
        not_on_or_after: instant_attribute(&conditions, "NotOnOrAfter")?,
        audiences,
    })
}

fn attributes(assertion: &Node) -> Option<Attributes> {
    let statements = children(assertion, SAML, "AttributeStatement");
    if statements.is_empty() {
        return None;
    }
    let mut attributes = Attributes::new();
    for statement in &statements {
        for attribute in children(statement, SAML, "Attribute") {
            let Some(name) = attribute.get_attribute("Name") else {
                continue;
            };
            attributes.insert(
                name,
                children(&attribute, SAML, "AttributeValue")
                    .iter()
                    .map(text),
            );
        }
    }
    Some(attributes)
}

#[derive(Debug, Default)]
pub struct XmlSecToolkit;

impl XmlSecToolkit {
    pub fn new() -> Self {
        Self
    }

    fn redirect_signer(
        settings: &SpSettings,
        sign: bool,
    ) -> Result<Option<OpensslRedirectSigner>, ToolkitError> {
        if !sign {
            return Ok(None);
        }
        let pem = settings
            .sp
            .private_key
            .as_deref()
            .ok_or(ToolkitError::MissingKey)?;
        OpensslRedirectSigner::from_pem(pem, settings.security.signature_algorithm).map(Some)
    }

    fn assertion_facts(
        &self,
        settings: &SpSettings,
        document: &Document,
        assertion: &Node,
        encrypted: bool,
    ) -> Result<AssertionFacts, ValidationFailure> {
        let id = assertion
            .get_attribute("ID")
            .ok_or_else(|| malformed("assertion without ID"))?;
        let issuer = issuer(assertion)?.ok_or_else(|| malformed("assertion without Issuer"))?;

        let signed = match optional_child(assertion, DS, "Signature")? {
            Some(signature) => {
                verify_enveloped(
                    document,
                    &settings.idp.trust,
                    assertion,
                    &signature,
                    "//saml:Assertion",
                )?;
                true
            }
            None => false,
        };

        let subject = optional_child(assertion, SAML, "Subject")?;
        let (name_id, name_id_encrypted) = match &subject {
            Some(subject) => match optional_child(subject, SAML, "NameID")? {
                Some(node) => (Some(name_id(&node)), false),
                None => match optional_child(subject, SAML, "EncryptedID")? {
                    Some(encrypted_id) => {
                        let plaintext =
                            decrypt_element(&encrypted_id, &decryption_key(settings)?)?;
                        let decrypted = parse_untrusted(&plaintext)?;
                        let node = root_element(&decrypted, SAML, "NameID")?;
                        (Some(name_id(&node)), true)
                    }
                    None => (None, false),
                },
            },
            None => (None, false),
        };

        let authn_statement = children(assertion, SAML, "AuthnStatement").into_iter().next();
        let authn_context_class = match &authn_statement {
            Some(statement) => optional_child(statement, SAML, "AuthnContext")?
                .map(|context| optional_child(&context, SAML, "AuthnContextClassRef"))
                .transpose()?
                .flatten()
                .map(|class| text(&class)),
            None => None,
        };

        Ok(AssertionFacts {
            id,
            issuer,
            signed,
            encrypted,
            name_id,
            name_id_encrypted,
            session_index: authn_statement
                .as_ref()
                .and_then(|statement| statement.get_attribute("SessionIndex")),
            authn_instant: match &authn_statement {
                Some(statement) => instant_attribute(statement, "AuthnInstant")?,
                None => None,
            },
            authn_context_class,
            attributes: attributes(assertion),
            conditions: conditions(assertion)?,
            confirmations: match &subject {
                Some(subject) => confirmations(subject)?,
                None => Vec::new(),
            },
        })
    }

    /// Verifies and extracts everything the policy checks need.
    pub fn response_facts(
        &self,
        settings: &SpSettings,
        xml: &[u8],
    ) -> Result<ResponseFacts, ValidationFailure> {
        let document = parse_untrusted(xml)?;
        let response = root_element(&document, SAMLP, "Response")?;

        let signed = match optional_child(&response, DS, "Signature")? {
            Some(mut signature) => {
                verify_enveloped(
                    &document,
                    &settings.idp.trust,
                    &response,
                    &signature,
                    "//samlp:Response",
                )?;
                // Out of the way so the assertion's own signature is found next.
                signature.unlink_node();
                true
            }
            None => false,
        };

        let plain = children(&response, SAML, "Assertion");
        let encrypted = children(&response, SAML, "EncryptedAssertion");
        let assertion = match (plain.as_slice(), encrypted.as_slice()) {
            ([], []) => None,
            ([assertion], []) => Some(self.assertion_facts(settings, &document, assertion, false)?),
            ([], [encrypted_assertion]) => {
                let plaintext =
                    decrypt_element(encrypted_assertion, &decryption_key(settings)?)?;
                let decrypted = parse_untrusted(&plaintext)?;
                let assertion = root_element(&decrypted, SAML, "Assertion")?;
                Some(self.assertion_facts(settings, &decrypted, &assertion, true)?)
            }
            _ => return Err(malformed("response carries more than one assertion")),
        };

        Ok(ResponseFacts {
            destination: response.get_attribute("Destination"),
            in_response_to: response.get_attribute("InResponseTo"),
            issuer: issuer(&response)?,
            status_code: status_code(&response)?,
            signed,
            assertion,
        })
    }

    fn signed_metadata(
        &self,
        settings: &SpSettings,
        now: OffsetDateTime,
    ) -> Result<Vec<u8>, ToolkitError> {
        let pem = settings
            .sp
            .private_key
            .as_deref()
            .ok_or(ToolkitError::MissingKey)?;
        let id = new_request_id();
        let xml = metadata_document(settings, Some(&id), now)?;

        let document = XmlParser::default()
            .parse_string(&xml)
            .map_err(|_| ToolkitError::Serialization("metadata is not well-formed".into()))?;
        let key = XmlSecKey::from_memory(pem, XmlSecKeyFormat::Pem, None)
            .map_err(|e| ToolkitError::Signing(e.to_string()))?;
        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        document
            .specify_idattr("//md:EntityDescriptor", "ID", Some(&[("md", MD)]))
            .map_err(|e| ToolkitError::Signing(e.to_string()))?;
        sigctx
            .sign_document(&document)
            .map_err(|e| ToolkitError::Signing(e.to_string()))?;
        Ok(document.to_string().into_bytes())
    }
}

impl SamlToolkit for XmlSecToolkit {
    fn build_authn_request(
        &self,
        settings: &SpSettings,
        requested_context: Option<&RequestedAuthnContext>,
        now: OffsetDateTime,
    ) -> Result<AuthnRedirect, ToolkitError> {
        let signer = Self::redirect_signer(settings, settings.security.authn_requests_signed)?;
        authn_request_redirect(
            settings,
            requested_context,
            now,
            signer.as_ref().map(|signer| signer as &dyn RedirectSigner),
        )
    }

    fn validate_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        expected_request_id: &str,
        now: OffsetDateTime,
    ) -> Result<Assertion, ValidationFailure> {
        let xml = decode_post_payload(raw_response)?;
        let facts = self.response_facts(settings, &xml)?;
        enforce_response_policy(settings, facts, expected_request_id, now)
    }

    fn build_logout_request(
        &self,
        settings: &SpSettings,
        name_id: &NameId,
        session_index: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<LogoutRedirect, ToolkitError> {
        let signer = Self::redirect_signer(settings, settings.security.logout_requests_signed)?;
        logout_request_redirect(
            settings,
            name_id,
            session_index,
            now,
            signer.as_ref().map(|signer| signer as &dyn RedirectSigner),
        )
    }

    fn validate_logout_response(
        &self,
        settings: &SpSettings,
        raw_response: &str,
        binding: ProtocolBinding,
        expected_request_id: &str,
        _now: OffsetDateTime,
    ) -> Result<LogoutStatus, ValidationFailure> {
        let xml = match binding {
            ProtocolBinding::Redirect => decode_redirect_payload(raw_response)?,
            ProtocolBinding::Post => decode_post_payload(raw_response)?,
        };
        let document = parse_untrusted(&xml)?;
        let response = root_element(&document, SAMLP, "LogoutResponse")?;

        // Redirect-binding responses are signed in the query string, which
        // is not available here.
        if binding == ProtocolBinding::Post {
            match optional_child(&response, DS, "Signature")? {
                Some(signature) => verify_enveloped(
                    &document,
                    &settings.idp.trust,
                    &response,
                    &signature,
                    "//samlp:LogoutResponse",
                )?,
                None if settings.security.want_messages_signed => {
                    return Err(ValidationFailure::MessageNotSigned)
                }
                None => {}
            }
        }

        enforce_logout_policy(
            settings,
            response.get_attribute("InResponseTo").as_deref(),
            issuer(&response)?.as_deref(),
            response.get_attribute("Destination").as_deref(),
            status_code(&response)?,
            expected_request_id,
        )
    }

    fn metadata_xml(&self, settings: &SpSettings, now: OffsetDateTime) -> Result<Vec<u8>, ToolkitError> {
        if settings.security.sign_metadata {
            return self.signed_metadata(settings, now);
        }
        metadata_document(settings, None, now).map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use base64::{prelude::BASE64_STANDARD, Engine};
    use openssl::{
        asn1::Asn1Time,
        hash::MessageDigest,
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder},
    };
    use time::Duration;

    use crate::{
        testing::{sample_settings, EPPN, MAIL},
        DATE_TIME_FORMAT, STATUS_SUCCESS,
    };

    use super::*;

    struct Idp {
        key_pem: Vec<u8>,
        cert_der: Vec<u8>,
    }

    fn idp() -> Idp {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "idp.example").unwrap();
        let name = name.build();
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        Idp {
            key_pem: key.private_key_to_pem_pkcs8().unwrap(),
            cert_der: builder.build().to_der().unwrap(),
        }
    }

    fn settings_trusting(idp: &Idp) -> SpSettings {
        let mut settings = sample_settings();
        settings.idp.trust = IdpTrust::Certificate(idp.cert_der.clone());
        settings
    }

    fn signature_template(id: &str) -> String {
        format!(
            r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/><ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/><ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/></ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/><ds:DigestValue/></ds:Reference></ds:SignedInfo><ds:SignatureValue/></ds:Signature>"##
        )
    }

    /// A Shibboleth-style response with a signed assertion.
    fn response_xml(settings: &SpSettings, request_id: &str, not_on_or_after: OffsetDateTime) -> String {
        let now = OffsetDateTime::now_utc().format(&DATE_TIME_FORMAT).unwrap();
        let expires = not_on_or_after.format(&DATE_TIME_FORMAT).unwrap();
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1" Version="2.0" IssueInstant="{now}" Destination="{acs}" InResponseTo="{request_id}"><saml:Issuer>{idp}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{STATUS_SUCCESS}"/></samlp:Status><saml:Assertion ID="_a1" Version="2.0" IssueInstant="{now}"><saml:Issuer>{idp}</saml:Issuer>{signature}<saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent">AAdzZWNyZXQx</saml:NameID><saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData Recipient="{acs}" NotOnOrAfter="{expires}" InResponseTo="{request_id}"/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{now}" NotOnOrAfter="{expires}"><saml:AudienceRestriction><saml:Audience>{sp}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement AuthnInstant="{now}" SessionIndex="_s1"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement><saml:AttributeStatement><saml:Attribute Name="{MAIL}"><saml:AttributeValue>jane@example.org</saml:AttributeValue></saml:Attribute><saml:Attribute Name="{EPPN}"><saml:AttributeValue>jane@example.org</saml:AttributeValue></saml:Attribute></saml:AttributeStatement></saml:Assertion></samlp:Response>"#,
            acs = settings.sp.acs_url,
            idp = settings.idp.entity_id,
            sp = settings.sp.entity_id,
            signature = signature_template("_a1"),
        )
    }

    fn sign(xml: &str, idp: &Idp) -> String {
        let document = XmlParser::default().parse_string(xml).unwrap();
        let key = XmlSecKey::from_memory(&idp.key_pem, XmlSecKeyFormat::Pem, None).unwrap();
        let mut sigctx = XmlSecSignatureContext::new();
        sigctx.insert_key(key);
        document
            .specify_idattr("//saml:Assertion", "ID", Some(&[("saml", SAML)]))
            .unwrap();
        sigctx.sign_document(&document).unwrap();
        BASE64_STANDARD.encode(document.to_string())
    }

    #[test]
    fn can_validate_signed_assertion() {
        let idp = idp();
        let settings = settings_trusting(&idp);
        let now = OffsetDateTime::now_utc();
        let raw = sign(&response_xml(&settings, "_req1", now + Duration::minutes(5)), &idp);

        let assertion = XmlSecToolkit::new()
            .validate_response(&settings, &raw, "_req1", now)
            .unwrap();
        assert_eq!(assertion.id, "_a1");
        assert_eq!(assertion.name_id.value, "AAdzZWNyZXQx");
        assert_eq!(assertion.session_index.as_deref(), Some("_s1"));
        assert_eq!(assertion.attributes.first(MAIL), Some("jane@example.org"));
    }

    #[test]
    fn can_trust_by_fingerprint() {
        let idp = idp();
        let mut settings = sample_settings();
        let algorithm = crate::settings::FingerprintAlgorithm::default();
        settings.idp.trust = IdpTrust::Fingerprint {
            algorithm,
            digest: algorithm.digest(&idp.cert_der),
        };
        let now = OffsetDateTime::now_utc();
        let xml = response_xml(&settings, "_req1", now + Duration::minutes(5)).replace(
            "<ds:SignatureValue/>",
            &format!(
                "<ds:SignatureValue/><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                BASE64_STANDARD.encode(&idp.cert_der)
            ),
        );
        let raw = sign(&xml, &idp);
        XmlSecToolkit::new()
            .validate_response(&settings, &raw, "_req1", now)
            .unwrap();
    }

    #[test]
    fn rejects_signature_from_untrusted_key() {
        let signer = idp();
        let settings = settings_trusting(&idp());
        let now = OffsetDateTime::now_utc();
        let raw = sign(&response_xml(&settings, "_req1", now + Duration::minutes(5)), &signer);

        assert_eq!(
            XmlSecToolkit::new().validate_response(&settings, &raw, "_req1", now),
            Err(ValidationFailure::InvalidSignature)
        );
    }

    #[test]
    fn rejects_tampered_assertion() {
        let idp = idp();
        let settings = settings_trusting(&idp);
        let now = OffsetDateTime::now_utc();
        let raw = sign(&response_xml(&settings, "_req1", now + Duration::minutes(5)), &idp);
        let tampered = String::from_utf8(BASE64_STANDARD.decode(raw).unwrap())
            .unwrap()
            .replace("AAdzZWNyZXQx", "admin");

        assert_eq!(
            XmlSecToolkit::new().validate_response(
                &settings,
                &BASE64_STANDARD.encode(tampered),
                "_req1",
                now
            ),
            Err(ValidationFailure::InvalidSignature)
        );
    }

    #[test]
    fn expired_assertion_fails_despite_valid_signature() {
        let idp = idp();
        let settings = settings_trusting(&idp);
        let now = OffsetDateTime::now_utc();
        let raw = sign(&response_xml(&settings, "_req1", now - Duration::minutes(10)), &idp);

        assert_eq!(
            XmlSecToolkit::new().validate_response(&settings, &raw, "_req1", now),
            Err(ValidationFailure::Expired)
        );
    }

    #[test]
    fn rejects_unsigned_response() {
        let settings = sample_settings();
        let now = OffsetDateTime::now_utc();
        let xml = response_xml(&settings, "_req1", now + Duration::minutes(5))
            .replace(&signature_template("_a1"), "");

        assert_eq!(
            XmlSecToolkit::new().validate_response(
                &settings,
                &BASE64_STANDARD.encode(xml),
                "_req1",
                now
            ),
            Err(ValidationFailure::SignatureMissing)
        );
    }

    #[test]
    fn refuses_doctype() {
        let xml = r#"<?xml version="1.0"?><!DOCTYPE r [<!ENTITY x "y">]><samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"/>"#;
        assert!(matches!(
            XmlSecToolkit::new().response_facts(&sample_settings(), xml.as_bytes()),
            Err(ValidationFailure::Malformed(_))
        ));
    }

    #[test]
    fn can_read_logout_response() {
        let settings = sample_settings();
        let xml = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_l1" Version="2.0" InResponseTo="_req9"><saml:Issuer>{}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{STATUS_SUCCESS}"/></samlp:Status></samlp:LogoutResponse>"#,
            settings.idp.entity_id
        );
        let status = XmlSecToolkit::new()
            .validate_logout_response(
                &settings,
                &crate::redirect::encode_redirect_payload(&xml),
                ProtocolBinding::Redirect,
                "_req9",
                OffsetDateTime::now_utc(),
            )
            .unwrap();
        assert!(status.is_success());
    }

    #[test]
    fn can_sign_metadata() {
        let sp = idp();
        let mut settings = sample_settings();
        settings.sp.certificate = Some(sp.cert_der.clone());
        settings.sp.private_key = Some(sp.key_pem.clone());
        settings.security.sign_metadata = true;

        let xml = XmlSecToolkit::new()
            .metadata_xml(&settings, OffsetDateTime::now_utc())
            .unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains("SignatureValue>"));
        assert!(!xml.contains("<ds:SignatureValue></ds:SignatureValue>"));
        assert!(!xml.contains("<ds:SignatureValue/>"));
    }
}
