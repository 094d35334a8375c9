//! Service-provider side of a SAML 2.0 / Shibboleth federation: per-IdP
//! settings, the login and logout handshakes, and binding IdP identities to
//! local accounts.

pub mod account;
pub mod assertion;
pub mod attributes;
mod authn_request;
pub mod binder;
#[cfg(feature = "xmlsec")]
mod decrypt;
pub mod endpoints;
mod error;
mod idp_metadata;
mod logout;
pub mod orchestrator;
mod redirect;
pub mod redirect_guard;
#[cfg(feature = "xmlsec")]
mod response;
pub mod session;
pub mod settings;
mod sp_metadata;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod toolkit;
pub mod utils;

pub use authn_request::{
    AuthnContextComparison, AuthnRequestBuilder, ProtocolBinding, RequestedAuthnContext,
};
pub use error::{
    BindingFailure, ConfigError, HandshakeError, StoreError, ToolkitError, UnknownIdp,
    UnsafeRedirect, ValidationFailure, GENERIC_FAILURE,
};
#[cfg(feature = "xmlsec")]
pub use idp_metadata::parse_idp_metadata;
pub use idp_metadata::IdpMetadata;
pub use logout::{LogoutRequestBuilder, LogoutStatus};
pub use redirect::{
    decode_post_payload, decode_redirect_payload, DigestAlgorithm, RedirectSigner,
    SignatureAlgorithm,
};
#[cfg(feature = "xmlsec")]
pub use redirect::OpensslRedirectSigner;
#[cfg(feature = "xmlsec")]
pub use response::XmlSecToolkit;
pub use sp_metadata::{Contact, Organization, SpMetadataBuilder};
use time::format_description::well_known::iso8601::{self, TimePrecision};

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const NAME_ID_FORMAT_PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
pub const NAME_ID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;
