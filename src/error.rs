use std::path::PathBuf;

use thiserror::Error;

/// Message shown to end users for every per-handshake failure.
pub const GENERIC_FAILURE: &str = "authentication failed";

/// Fatal configuration problems, raised while settings are resolved.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{field}` for identity provider `{idp}`")]
    MissingField { idp: String, field: &'static str },
    #[error("identity provider `{0}` has neither a certificate nor a fingerprint")]
    MissingIdpCertificate(String),
    #[error("invalid setting `{field}` for identity provider `{idp}`: {reason}")]
    Invalid {
        idp: String,
        field: &'static str,
        reason: String,
    },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid IdP metadata in {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown identity provider `{0}`")]
pub struct UnknownIdp(pub String);

/// Reasons the toolkit rejects a SAML response or logout response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("message could not be decoded")]
    InvalidEncoding,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsuccessful status `{0}`")]
    Status(String),
    #[error("no signature found")]
    SignatureMissing,
    #[error("signature is invalid")]
    InvalidSignature,
    #[error("message is not signed")]
    MessageNotSigned,
    #[error("assertion is not signed")]
    AssertionNotSigned,
    #[error("issuer mismatch: expected `{expected}`, found `{found}`")]
    IssuerMismatch { expected: String, found: String },
    #[error("audience restriction does not include this service provider")]
    AudienceMismatch,
    #[error("destination mismatch")]
    DestinationMismatch,
    #[error("subject confirmation recipient mismatch")]
    RecipientMismatch,
    #[error("assertion is not yet valid")]
    NotYetValid,
    #[error("assertion has expired")]
    Expired,
    #[error("InResponseTo does not match the outstanding request")]
    InResponseToMismatch,
    #[error("assertion has no NameID")]
    MissingNameId,
    #[error("NameID is not encrypted")]
    NameIdNotEncrypted,
    #[error("assertion is not encrypted")]
    AssertionNotEncrypted,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("assertion has already been used")]
    Replayed,
}

/// The redirect guard refused a target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsafe redirect target ({reason})")]
pub struct UnsafeRedirect {
    pub target: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingFailure {
    #[error("assertion is missing required attributes: {0:?}")]
    MissingAttributes(Vec<String>),
    #[error("no local account is linked to this identity")]
    NoLinkedAccount,
    #[error("identity is linked to a different account")]
    AccountConflict,
    #[error("attribute `{0}` has multiple values")]
    AmbiguousAttribute(String),
    #[error("account store failure: {0}")]
    Store(String),
}

/// Failures while building outbound SAML messages or metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolkitError {
    #[error("`{0}` is required")]
    MissingField(&'static str),
    #[error("no private key available for signing")]
    MissingKey,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("identity provider has no single logout endpoint")]
    NoLogoutEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for BindingFailure {
    fn from(value: StoreError) -> Self {
        BindingFailure::Store(value.0)
    }
}

/// Everything that can end a handshake, caught at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    UnknownIdp(#[from] UnknownIdp),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    UnsafeRedirect(#[from] UnsafeRedirect),
    #[error("binding failed: {0}")]
    Binding(#[from] BindingFailure),
    #[error("unknown or expired request")]
    UnknownOrExpiredRequest,
    #[error("toolkit failure: {0}")]
    Toolkit(#[from] ToolkitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("illegal handshake transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl HandshakeError {
    /// Short label used as the `reason` field of failure logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::UnknownIdp(_) => "unknown_idp",
            HandshakeError::Config(_) => "config",
            HandshakeError::Validation(_) => "validation",
            HandshakeError::UnsafeRedirect(_) => "unsafe_redirect",
            HandshakeError::Binding(_) => "binding",
            HandshakeError::UnknownOrExpiredRequest => "unknown_or_expired_request",
            HandshakeError::Toolkit(_) => "toolkit",
            HandshakeError::Store(_) => "store",
            HandshakeError::IllegalTransition { .. } => "illegal_transition",
        }
    }

    /// Configuration and toolkit errors are operator problems, not user ones.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            HandshakeError::Config(_)
                | HandshakeError::Toolkit(_)
                | HandshakeError::Store(_)
                | HandshakeError::IllegalTransition { .. }
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            HandshakeError::UnknownIdp(_) => 404,
            HandshakeError::UnsafeRedirect(_) => 400,
            e if e.is_server_fault() => 500,
            _ => 403,
        }
    }

    /// What the browser is allowed to see.
    pub fn public_message(&self) -> &'static str {
        match self {
            HandshakeError::UnknownIdp(_) => "not found",
            HandshakeError::UnsafeRedirect(_) => "bad request",
            e if e.is_server_fault() => "bad server configuration",
            _ => GENERIC_FAILURE,
        }
    }
}
