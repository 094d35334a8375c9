use std::{fmt::Display, str::FromStr};

use serde::Deserialize;
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    redirect::encode_redirect_payload, utils::new_request_id, ToolkitError, DATE_TIME_FORMAT,
};

pub const PASSWORD_PROTECTED_TRANSPORT: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: Option<String>,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: Option<String>,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
    #[yaserde(rename = "RequestedAuthnContext", prefix = "samlp")]
    requested_authn_context: Option<RequestedAuthnContextElement>,
}

#[derive(YaSerialize)]
pub(crate) struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    pub(crate) format: String,
    #[yaserde(text = true)]
    pub(crate) content: String,
}

impl Issuer {
    pub(crate) fn entity(entity_id: String) -> Self {
        Issuer {
            format: "urn:oasis:names:tc:SAML:2.0:nameid-format:entity".to_string(),
            content: entity_id,
        }
    }
}

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(YaSerialize)]
pub(crate) struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    pub(crate) format: Option<String>,
    #[yaserde(text = true)]
    pub(crate) content: String,
}

#[derive(YaSerialize)]
struct RequestedAuthnContextElement {
    #[yaserde(attribute = true, rename = "Comparison")]
    comparison: String,
    #[yaserde(rename = "AuthnContextClassRef", prefix = "saml")]
    class_refs: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthnContextComparison {
    #[default]
    Exact,
    Minimum,
    Maximum,
    Better,
}

impl Display for AuthnContextComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let value = match self {
            AuthnContextComparison::Exact => "exact",
            AuthnContextComparison::Minimum => "minimum",
            AuthnContextComparison::Maximum => "maximum",
            AuthnContextComparison::Better => "better",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedAuthnContext {
    pub class_refs: Vec<String>,
    pub comparison: AuthnContextComparison,
}

impl Default for RequestedAuthnContext {
    fn default() -> Self {
        Self {
            class_refs: vec![PASSWORD_PROTECTED_TRANSPORT.to_string()],
            comparison: AuthnContextComparison::Exact,
        }
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    protocol_binding: ProtocolBinding,
    consumer_url: Option<String>,
    name_format: Option<String>,
    force_authn: bool,
    is_passive: bool,
    requested_context: Option<RequestedAuthnContext>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(new_request_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    /// Binding the IdP should use to deliver the response to the ACS.
    pub fn protocol_binding(self, binding: ProtocolBinding) -> Self {
        AuthnRequestBuilder {
            protocol_binding: binding,
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn force_authn(self, force: bool) -> Self {
        AuthnRequestBuilder {
            force_authn: force,
            ..self
        }
    }

    pub fn is_passive(self, passive: bool) -> Self {
        AuthnRequestBuilder {
            is_passive: passive,
            ..self
        }
    }

    pub fn requested_context(self, context: Option<RequestedAuthnContext>) -> Self {
        AuthnRequestBuilder {
            requested_context: context,
            ..self
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn build(self) -> Result<String, ToolkitError> {
        let name_format = self
            .name_format
            .ok_or(ToolkitError::MissingField("name format"))?;
        let req = AuthnRequest {
            id: self.id.ok_or(ToolkitError::MissingField("ID"))?,
            version: "2.0".to_string(),
            issue_instant: self
                .issue_instant
                .ok_or(ToolkitError::MissingField("IssueInstant"))?
                .format(&DATE_TIME_FORMAT)
                .map_err(|e| ToolkitError::Serialization(e.to_string()))?,
            destination: self
                .destination
                .ok_or(ToolkitError::MissingField("Destination"))?,
            protocol_binding: self.protocol_binding.to_string(),
            assertion_consumer_service_url: self
                .consumer_url
                .ok_or(ToolkitError::MissingField("AssertionConsumerServiceURL"))?,
            force_authn: self.force_authn.then(|| "true".to_string()),
            is_passive: self.is_passive.then(|| "true".to_string()),
            issuer: Issuer::entity(self.issuer.ok_or(ToolkitError::MissingField("Issuer"))?),
            name_id_policy: NameIdPolicy {
                format: name_format,
                allow_create: true,
            },
            requested_authn_context: self.requested_context.map(|context| {
                RequestedAuthnContextElement {
                    comparison: context.comparison.to_string(),
                    class_refs: context.class_refs,
                }
            }),
        };
        yaserde::ser::to_string(&req).map_err(ToolkitError::Serialization)
    }

    pub fn build_and_encode(self) -> Result<String, ToolkitError> {
        let xml = self.build()?;
        Ok(encode_redirect_payload(&xml))
    }
}

#[cfg(test)]
mod tests {
    use crate::NAME_ID_FORMAT_EMAIL_ADDRESS;

    use super::*;

    fn builder() -> AuthnRequestBuilder {
        AuthnRequestBuilder::new()
            .id("_id123")
            .issue_instant(OffsetDateTime::now_utc())
            .issuer("https://app.example/saml/sp")
            .destination("https://idp.example/sso")
            .protocol_binding(ProtocolBinding::Post)
            .consumer_url("https://app.example/saml/acs/idp1")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
    }

    #[test]
    fn can_build_authn_request() {
        let xml = builder().build().unwrap();
        assert!(xml.contains(r#"ID="_id123""#));
        assert!(xml.contains("https://app.example/saml/acs/idp1"));
        assert!(xml.contains("urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"));
        assert!(xml.contains(r#"AllowCreate="true""#));
        assert!(!xml.contains("ForceAuthn"));
        assert!(!xml.contains("RequestedAuthnContext"));
    }

    #[test]
    fn includes_requested_authn_context() {
        let xml = builder()
            .requested_context(Some(RequestedAuthnContext {
                class_refs: vec![PASSWORD_PROTECTED_TRANSPORT.into()],
                comparison: AuthnContextComparison::Minimum,
            }))
            .force_authn(true)
            .is_passive(true)
            .build()
            .unwrap();
        assert!(xml.contains(r#"Comparison="minimum""#));
        assert!(xml.contains(PASSWORD_PROTECTED_TRANSPORT));
        assert!(xml.contains(r#"ForceAuthn="true""#));
        assert!(xml.contains(r#"IsPassive="true""#));
    }

    #[test]
    fn missing_destination_is_an_error() {
        let result = AuthnRequestBuilder::new()
            .auto_id()
            .issue_instant(OffsetDateTime::now_utc())
            .issuer("issuer")
            .consumer_url("consumer_url")
            .name_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .build();
        assert_eq!(result, Err(ToolkitError::MissingField("Destination")));
    }
}
