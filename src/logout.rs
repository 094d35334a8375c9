use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    authn_request::{Issuer, NameId},
    redirect::encode_redirect_payload,
    utils::new_request_id,
    ToolkitError, DATE_TIME_FORMAT, STATUS_SUCCESS,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
    #[yaserde(rename = "SessionIndex", prefix = "samlp")]
    session_index: Option<String>,
}

#[derive(Default)]
pub struct LogoutRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    name_id: Option<String>,
    name_format: Option<String>,
    session_index: Option<String>,
}

impl LogoutRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        Self {
            id: Some(new_request_id()),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        Self {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        Self {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        Self {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn name_id(self, name_id: &str, format: Option<&str>) -> Self {
        Self {
            name_id: Some(name_id.into()),
            name_format: format.map(Into::into),
            ..self
        }
    }

    pub fn session_index(self, session_index: Option<&str>) -> Self {
        Self {
            session_index: session_index.map(Into::into),
            ..self
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn build(self) -> Result<String, ToolkitError> {
        let req = LogoutRequest {
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
            issuer: Issuer::entity(self.issuer.ok_or(ToolkitError::MissingField("Issuer"))?),
            name_id: NameId {
                format: self.name_format,
                content: self.name_id.ok_or(ToolkitError::MissingField("NameID"))?,
            },
            session_index: self.session_index,
        };
        yaserde::ser::to_string(&req).map_err(ToolkitError::Serialization)
    }

    pub fn build_and_encode(self) -> Result<String, ToolkitError> {
        let xml = self.build()?;
        Ok(encode_redirect_payload(&xml))
    }
}

/// Outcome reported by the IdP in a LogoutResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutStatus {
    pub in_response_to: String,
    pub status_code: String,
}

impl LogoutStatus {
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_SUCCESS
    }
}
