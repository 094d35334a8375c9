//! Settings resolution: a JSON settings document becomes one immutable
//! [`SpSettings`] per configured IdP.
//!
//! Everything is validated when the registry is built. A registry that
//! exists is complete, so lookups afterwards can only fail with
//! [`UnknownIdp`].

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::{
    attributes::{AttributeMapping, LocalField, MultiValuePolicy},
    authn_request::{AuthnContextComparison, RequestedAuthnContext},
    binder::{AccountPolicy, EmailCollisionPolicy},
    idp_metadata::IdpMetadata,
    redirect::{DigestAlgorithm, SignatureAlgorithm},
    redirect_guard::RedirectGuard,
    sp_metadata::{Contact, Organization},
    utils::pem_to_der,
    ConfigError, UnknownIdp, NAME_ID_FORMAT_UNSPECIFIED,
};

const DEFAULT_STATE_EXPIRY_SECS: u64 = 300;
const DEFAULT_CLOCK_SKEW_SECS: u64 = 180;
const MAX_STATE_EXPIRY_SECS: u64 = 24 * 60 * 60;
const MAX_CLOCK_SKEW_SECS: u64 = 60 * 60;
const MAX_METADATA_CACHE_SECS: u64 = 365 * 24 * 60 * 60;

/// Seconds from the settings document, refused above `max`.
fn bounded_seconds(
    idp_key: &str,
    field: &'static str,
    secs: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    if secs > max {
        return Err(ConfigError::Invalid {
            idp: idp_key.to_string(),
            field,
            reason: format!("{secs} exceeds the maximum of {max} seconds"),
        });
    }
    Ok(Duration::seconds(secs as i64))
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsFile {
    pub sp: SpConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub state_expiry: Option<u64>,
    #[serde(default)]
    pub allowed_redirect_hosts: Vec<String>,
    #[serde(default)]
    pub idps: BTreeMap<String, IdpConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpConfig {
    pub entity_id: Option<String>,
    /// May contain `{idp}`, replaced by the IdP key.
    pub acs_url: Option<String>,
    pub sls_url: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub name_id_format: Option<String>,
    pub organization: Option<OrganizationConfig>,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrganizationConfig {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContactConfig {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub given_name: String,
    pub email_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RequestedContextConfig {
    Enabled(bool),
    ClassRefs(Vec<String>),
}

/// Security toggles. Every field is optional so a per-IdP block only has to
/// name what it overrides.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityConfig {
    pub strict: Option<bool>,
    /// Seconds.
    pub allowed_clock_skew: Option<u64>,
    pub want_assertions_signed: Option<bool>,
    pub want_messages_signed: Option<bool>,
    pub want_assertions_encrypted: Option<bool>,
    #[serde(rename = "wantNameId")]
    pub want_name_id: Option<bool>,
    #[serde(rename = "wantNameIdEncrypted")]
    pub want_name_id_encrypted: Option<bool>,
    pub want_attribute_statement: Option<bool>,
    pub authn_requests_signed: Option<bool>,
    pub logout_requests_signed: Option<bool>,
    pub sign_metadata: Option<bool>,
    pub force_authn: Option<bool>,
    pub is_passive: Option<bool>,
    pub requested_authn_context: Option<RequestedContextConfig>,
    pub requested_authn_context_comparison: Option<AuthnContextComparison>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    pub digest_algorithm: Option<DigestAlgorithm>,
    /// RFC 3339 timestamp.
    pub metadata_valid_until: Option<String>,
    /// Seconds.
    pub metadata_cache_duration: Option<u64>,
}

impl SecurityConfig {
    /// Field-wise override: values set in `self` win over `fallback`.
    pub fn or(self, fallback: &SecurityConfig) -> SecurityConfig {
        let fallback = fallback.clone();
        SecurityConfig {
            strict: self.strict.or(fallback.strict),
            allowed_clock_skew: self.allowed_clock_skew.or(fallback.allowed_clock_skew),
            want_assertions_signed: self
                .want_assertions_signed
                .or(fallback.want_assertions_signed),
            want_messages_signed: self.want_messages_signed.or(fallback.want_messages_signed),
            want_assertions_encrypted: self
                .want_assertions_encrypted
                .or(fallback.want_assertions_encrypted),
            want_name_id: self.want_name_id.or(fallback.want_name_id),
            want_name_id_encrypted: self
                .want_name_id_encrypted
                .or(fallback.want_name_id_encrypted),
            want_attribute_statement: self
                .want_attribute_statement
                .or(fallback.want_attribute_statement),
            authn_requests_signed: self.authn_requests_signed.or(fallback.authn_requests_signed),
            logout_requests_signed: self
                .logout_requests_signed
                .or(fallback.logout_requests_signed),
            sign_metadata: self.sign_metadata.or(fallback.sign_metadata),
            force_authn: self.force_authn.or(fallback.force_authn),
            is_passive: self.is_passive.or(fallback.is_passive),
            requested_authn_context: self
                .requested_authn_context
                .or(fallback.requested_authn_context),
            requested_authn_context_comparison: self
                .requested_authn_context_comparison
                .or(fallback.requested_authn_context_comparison),
            signature_algorithm: self.signature_algorithm.or(fallback.signature_algorithm),
            digest_algorithm: self.digest_algorithm.or(fallback.digest_algorithm),
            metadata_valid_until: self.metadata_valid_until.or(fallback.metadata_valid_until),
            metadata_cache_duration: self
                .metadata_cache_duration
                .or(fallback.metadata_cache_duration),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdpConfig {
    pub title: Option<String>,
    pub description: Option<String>,
    pub entity_id: Option<String>,
    pub sso_url: Option<String>,
    pub slo_url: Option<String>,
    pub cert_file_or_fingerprint: Option<String>,
    pub fingerprint_algorithm: Option<FingerprintAlgorithm>,
    pub metadata_file: Option<PathBuf>,
    pub sp_entity_id: Option<String>,
    pub acs_url: Option<String>,
    pub sls_url: Option<String>,
    pub name_id_format: Option<String>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub attribute_mapping: BTreeMap<String, LocalField>,
    #[serde(default)]
    pub allow_auto_signup: bool,
    pub required_attributes: Option<Vec<LocalField>>,
    #[serde(default)]
    pub on_email_collision: EmailCollisionPolicy,
    #[serde(default)]
    pub multi_value: MultiValuePolicy,
    pub state_expiry: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl FingerprintAlgorithm {
    pub fn digest_len(&self) -> usize {
        match self {
            FingerprintAlgorithm::Sha1 => 20,
            FingerprintAlgorithm::Sha256 => 32,
            FingerprintAlgorithm::Sha384 => 48,
            FingerprintAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(&self, der: &[u8]) -> Vec<u8> {
        match self {
            FingerprintAlgorithm::Sha1 => Sha1::digest(der).to_vec(),
            FingerprintAlgorithm::Sha256 => Sha256::digest(der).to_vec(),
            FingerprintAlgorithm::Sha384 => Sha384::digest(der).to_vec(),
            FingerprintAlgorithm::Sha512 => Sha512::digest(der).to_vec(),
        }
    }

    /// Accepts `AB:CD:..` and plain hex; `None` if it is not a digest of this
    /// algorithm.
    pub fn parse_fingerprint(&self, value: &str) -> Option<Vec<u8>> {
        let hex_digits: String = value.trim().chars().filter(|c| *c != ':').collect();
        let digest = hex::decode(hex_digits).ok()?;
        (digest.len() == self.digest_len()).then_some(digest)
    }
}

/// How the IdP's signing certificate is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdpTrust {
    Certificate(Vec<u8>),
    Fingerprint {
        algorithm: FingerprintAlgorithm,
        digest: Vec<u8>,
    },
}

impl IdpTrust {
    /// Whether a DER certificate presented in a message is trusted.
    pub fn accepts(&self, der: &[u8]) -> bool {
        match self {
            IdpTrust::Certificate(trusted) => trusted.as_slice() == der,
            IdpTrust::Fingerprint { algorithm, digest } => algorithm.digest(der) == *digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProvider {
    pub entity_id: String,
    pub sso_url: String,
    pub slo_url: Option<String>,
    pub trust: IdpTrust,
    pub valid_until: Option<OffsetDateTime>,
    pub cache_duration: Option<Duration>,
    pub loaded_at: OffsetDateTime,
}

impl IdentityProvider {
    /// True once the metadata snapshot is past `validUntil` or older than
    /// its `cacheDuration`.
    pub fn refresh_due(&self, now: OffsetDateTime) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
            || self
                .cache_duration
                .is_some_and(|cache| now >= self.loaded_at + cache)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProvider {
    pub entity_id: String,
    pub acs_url: String,
    pub sls_url: Option<String>,
    pub name_id_format: String,
    /// DER.
    pub certificate: Option<Vec<u8>>,
    /// PEM.
    pub private_key: Option<Vec<u8>>,
    pub organization: Option<Organization>,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub strict: bool,
    pub allowed_clock_skew: Duration,
    pub want_assertions_signed: bool,
    pub want_messages_signed: bool,
    pub want_assertions_encrypted: bool,
    pub want_name_id_encrypted: bool,
    pub want_attribute_statement: bool,
    pub authn_requests_signed: bool,
    pub logout_requests_signed: bool,
    pub sign_metadata: bool,
    pub force_authn: bool,
    pub is_passive: bool,
    pub requested_authn_context: Option<RequestedAuthnContext>,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
    pub metadata_valid_until: Option<OffsetDateTime>,
    pub metadata_cache_duration: Option<Duration>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            strict: true,
            allowed_clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS as i64),
            want_assertions_signed: true,
            want_messages_signed: false,
            want_assertions_encrypted: false,
            want_name_id_encrypted: false,
            want_attribute_statement: true,
            authn_requests_signed: false,
            logout_requests_signed: false,
            sign_metadata: false,
            force_authn: false,
            is_passive: false,
            requested_authn_context: Some(RequestedAuthnContext::default()),
            signature_algorithm: SignatureAlgorithm::default(),
            digest_algorithm: DigestAlgorithm::default(),
            metadata_valid_until: None,
            metadata_cache_duration: None,
        }
    }
}

impl SecurityPolicy {
    fn resolve(idp_key: &str, config: SecurityConfig) -> Result<Self, ConfigError> {
        let defaults = SecurityPolicy::default();
        let comparison = config
            .requested_authn_context_comparison
            .unwrap_or_default();
        let requested_authn_context = match config.requested_authn_context {
            None => defaults.requested_authn_context,
            Some(RequestedContextConfig::Enabled(false)) => None,
            Some(RequestedContextConfig::Enabled(true)) => Some(RequestedAuthnContext {
                comparison,
                ..Default::default()
            }),
            Some(RequestedContextConfig::ClassRefs(class_refs)) if class_refs.is_empty() => None,
            Some(RequestedContextConfig::ClassRefs(class_refs)) => Some(RequestedAuthnContext {
                class_refs,
                comparison,
            }),
        };
        let metadata_valid_until = config
            .metadata_valid_until
            .map(|value| {
                OffsetDateTime::parse(&value, &Rfc3339).map_err(|e| ConfigError::Invalid {
                    idp: idp_key.to_string(),
                    field: "metadataValidUntil",
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        // Accounts are keyed by NameID.
        if config.want_name_id == Some(false) {
            return Err(ConfigError::Invalid {
                idp: idp_key.to_string(),
                field: "wantNameId",
                reason: "a NameID is required to bind accounts".to_string(),
            });
        }
        let allowed_clock_skew = config
            .allowed_clock_skew
            .map(|secs| bounded_seconds(idp_key, "allowedClockSkew", secs, MAX_CLOCK_SKEW_SECS))
            .transpose()?
            .unwrap_or(defaults.allowed_clock_skew);
        let metadata_cache_duration = config
            .metadata_cache_duration
            .map(|secs| {
                bounded_seconds(
                    idp_key,
                    "metadataCacheDuration",
                    secs,
                    MAX_METADATA_CACHE_SECS,
                )
            })
            .transpose()?;

        Ok(Self {
            strict: config.strict.unwrap_or(defaults.strict),
            allowed_clock_skew,
            want_assertions_signed: config
                .want_assertions_signed
                .unwrap_or(defaults.want_assertions_signed),
            want_messages_signed: config
                .want_messages_signed
                .unwrap_or(defaults.want_messages_signed),
            want_assertions_encrypted: config
                .want_assertions_encrypted
                .unwrap_or(defaults.want_assertions_encrypted),
            want_name_id_encrypted: config
                .want_name_id_encrypted
                .unwrap_or(defaults.want_name_id_encrypted),
            want_attribute_statement: config
                .want_attribute_statement
                .unwrap_or(defaults.want_attribute_statement),
            authn_requests_signed: config
                .authn_requests_signed
                .unwrap_or(defaults.authn_requests_signed),
            logout_requests_signed: config
                .logout_requests_signed
                .unwrap_or(defaults.logout_requests_signed),
            sign_metadata: config.sign_metadata.unwrap_or(defaults.sign_metadata),
            force_authn: config.force_authn.unwrap_or(defaults.force_authn),
            is_passive: config.is_passive.unwrap_or(defaults.is_passive),
            requested_authn_context,
            signature_algorithm: config
                .signature_algorithm
                .unwrap_or(defaults.signature_algorithm),
            digest_algorithm: config.digest_algorithm.unwrap_or(defaults.digest_algorithm),
            metadata_valid_until,
            metadata_cache_duration,
        })
    }

    /// Toggles that cannot work without an SP private key.
    fn key_requirements(&self) -> [(&'static str, bool); 5] {
        [
            ("authnRequestsSigned", self.authn_requests_signed),
            ("logoutRequestsSigned", self.logout_requests_signed),
            ("signMetadata", self.sign_metadata),
            ("wantNameIdEncrypted", self.want_name_id_encrypted),
            ("wantAssertionsEncrypted", self.want_assertions_encrypted),
        ]
    }
}

/// Fully resolved settings for one IdP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpSettings {
    pub idp_key: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub sp: ServiceProvider,
    pub idp: IdentityProvider,
    pub security: SecurityPolicy,
    pub attribute_mapping: AttributeMapping,
    pub account_policy: AccountPolicy,
    pub state_expiry: Duration,
}

struct Resolver<'a> {
    file: &'a SettingsFile,
    base_dir: &'a Path,
    sp_certificate: Option<Vec<u8>>,
    sp_private_key: Option<Vec<u8>>,
    now: OffsetDateTime,
}

fn read_file(base_dir: &Path, path: &Path) -> Result<Vec<u8>, ConfigError> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    fs::read(&path).map_err(|source| ConfigError::Io { path, source })
}

impl Resolver<'_> {
    fn missing(idp: &str, field: &'static str) -> ConfigError {
        ConfigError::MissingField {
            idp: idp.to_string(),
            field,
        }
    }

    fn invalid(idp: &str, field: &'static str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            idp: idp.to_string(),
            field,
            reason: reason.into(),
        }
    }

    fn metadata(&self, path: &Path) -> Result<IdpMetadata, ConfigError> {
        let bytes = read_file(self.base_dir, path)?;
        parse_metadata(&bytes).map_err(|reason| ConfigError::Metadata {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn trust(
        &self,
        idp_key: &str,
        config: &IdpConfig,
        metadata: Option<&IdpMetadata>,
    ) -> Result<IdpTrust, ConfigError> {
        let algorithm = config.fingerprint_algorithm.unwrap_or_default();
        match config.cert_file_or_fingerprint.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => {
                if let Some(digest) = algorithm.parse_fingerprint(value) {
                    return Ok(IdpTrust::Fingerprint { algorithm, digest });
                }
                let contents = read_file(self.base_dir, Path::new(value))?;
                let der = pem_to_der(&contents)
                    .map_err(|e| Self::invalid(idp_key, "certFileOrFingerprint", e.to_string()))?;
                Ok(IdpTrust::Certificate(der))
            }
            _ => metadata
                .and_then(|metadata| metadata.signing_certificates.first().cloned())
                .map(IdpTrust::Certificate)
                .ok_or_else(|| ConfigError::MissingIdpCertificate(idp_key.to_string())),
        }
    }

    fn resolve(&self, idp_key: &str, config: &IdpConfig) -> Result<SpSettings, ConfigError> {
        let metadata = config
            .metadata_file
            .as_deref()
            .map(|path| self.metadata(path))
            .transpose()?;

        let security = SecurityPolicy::resolve(
            idp_key,
            config.security.clone().or(&self.file.security),
        )?;
        if self.sp_private_key.is_none() {
            if let Some((field, _)) = security
                .key_requirements()
                .into_iter()
                .find(|(_, enabled)| *enabled)
            {
                return Err(Self::invalid(idp_key, field, "requires sp.keyFile"));
            }
        }

        let substitute = |url: &str| url.replace("{idp}", idp_key);
        let sp = ServiceProvider {
            entity_id: config
                .sp_entity_id
                .clone()
                .or_else(|| self.file.sp.entity_id.clone())
                .ok_or_else(|| Self::missing(idp_key, "sp.entityId"))?,
            acs_url: config
                .acs_url
                .clone()
                .or_else(|| self.file.sp.acs_url.as_deref().map(substitute))
                .ok_or_else(|| Self::missing(idp_key, "sp.acsUrl"))?,
            sls_url: config
                .sls_url
                .clone()
                .or_else(|| self.file.sp.sls_url.as_deref().map(substitute)),
            name_id_format: config
                .name_id_format
                .clone()
                .or_else(|| self.file.sp.name_id_format.clone())
                .unwrap_or_else(|| NAME_ID_FORMAT_UNSPECIFIED.to_string()),
            certificate: self.sp_certificate.clone(),
            private_key: self.sp_private_key.clone(),
            organization: self.file.sp.organization.clone().map(|org| Organization {
                name: org.name,
                display_name: org.display_name,
                url: org.url,
            }),
            contacts: self
                .file
                .sp
                .contacts
                .iter()
                .cloned()
                .map(|contact| Contact {
                    contact_type: contact.contact_type,
                    given_name: contact.given_name,
                    email_address: contact.email_address,
                })
                .collect(),
        };

        let idp = IdentityProvider {
            entity_id: config
                .entity_id
                .clone()
                .or_else(|| metadata.as_ref().map(|m| m.entity_id.clone()))
                .ok_or_else(|| Self::missing(idp_key, "entityId"))?,
            sso_url: config
                .sso_url
                .clone()
                .or_else(|| metadata.as_ref().and_then(|m| m.sso_url().map(str::to_string)))
                .ok_or_else(|| Self::missing(idp_key, "ssoUrl"))?,
            slo_url: config
                .slo_url
                .clone()
                .or_else(|| metadata.as_ref().and_then(|m| m.slo_url().map(str::to_string))),
            trust: self.trust(idp_key, config, metadata.as_ref())?,
            valid_until: metadata.as_ref().and_then(|m| m.valid_until),
            cache_duration: metadata.as_ref().and_then(|m| m.cache_duration),
            loaded_at: self.now,
        };

        let attribute_mapping: AttributeMapping = config
            .attribute_mapping
            .iter()
            .map(|(attribute, field)| (attribute.clone(), *field))
            .collect();
        let required_attributes = config.required_attributes.clone().unwrap_or_default();
        if config.allow_auto_signup && required_attributes.is_empty() {
            return Err(Self::invalid(
                idp_key,
                "requiredAttributes",
                "allowAutoSignup needs an explicit, non-empty list",
            ));
        }
        if let Some(unmapped) = required_attributes
            .iter()
            .find(|field| !attribute_mapping.maps_field(**field))
        {
            return Err(Self::invalid(
                idp_key,
                "requiredAttributes",
                format!("no attribute is mapped to `{unmapped}`"),
            ));
        }

        let state_expiry = config
            .state_expiry
            .or(self.file.state_expiry)
            .unwrap_or(DEFAULT_STATE_EXPIRY_SECS);
        if state_expiry == 0 {
            return Err(Self::invalid(idp_key, "stateExpiry", "must be positive"));
        }
        let state_expiry =
            bounded_seconds(idp_key, "stateExpiry", state_expiry, MAX_STATE_EXPIRY_SECS)?;

        Ok(SpSettings {
            idp_key: idp_key.to_string(),
            title: config.title.clone(),
            description: config.description.clone(),
            sp,
            idp,
            security,
            attribute_mapping,
            account_policy: AccountPolicy {
                allow_auto_signup: config.allow_auto_signup,
                required_attributes,
                email_collision: config.on_email_collision,
                multi_value: config.multi_value,
            },
            state_expiry,
        })
    }
}

#[cfg(feature = "xmlsec")]
fn parse_metadata(bytes: &[u8]) -> Result<IdpMetadata, String> {
    crate::idp_metadata::parse_idp_metadata(bytes).map_err(|e| e.to_string())
}

#[cfg(not(feature = "xmlsec"))]
fn parse_metadata(_bytes: &[u8]) -> Result<IdpMetadata, String> {
    Err("reading IdP metadata files needs the `xmlsec` feature".to_string())
}

/// Immutable set of resolved per-IdP settings.
#[derive(Debug, Default)]
pub struct SettingsRegistry {
    idps: HashMap<String, Arc<SpSettings>>,
    redirect_guard: RedirectGuard,
}

impl SettingsRegistry {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SettingsFile = serde_json::from_slice(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_settings(&file, base_dir)
    }

    pub fn from_json(json: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let file: SettingsFile = serde_json::from_str(json)?;
        Self::from_settings(&file, base_dir)
    }

    pub fn from_settings(file: &SettingsFile, base_dir: &Path) -> Result<Self, ConfigError> {
        let sp_certificate = file
            .sp
            .cert_file
            .as_deref()
            .map(|path| {
                let contents = read_file(base_dir, path)?;
                pem_to_der(&contents).map_err(|e| ConfigError::Invalid {
                    idp: "*".into(),
                    field: "sp.certFile",
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        let sp_private_key = file
            .sp
            .key_file
            .as_deref()
            .map(|path| read_file(base_dir, path))
            .transpose()?;

        let resolver = Resolver {
            file,
            base_dir,
            sp_certificate,
            sp_private_key,
            now: OffsetDateTime::now_utc(),
        };

        let mut idps = HashMap::with_capacity(file.idps.len());
        for (idp_key, config) in &file.idps {
            let settings = resolver.resolve(idp_key, config)?;
            debug!(idp = %idp_key, entity_id = %settings.idp.entity_id, "resolved IdP settings");
            idps.insert(idp_key.clone(), Arc::new(settings));
        }
        info!(idps = idps.len(), "loaded SAML settings");

        Ok(Self {
            idps,
            redirect_guard: RedirectGuard::new(&file.allowed_redirect_hosts),
        })
    }

    /// Registry built from already resolved settings.
    pub fn from_resolved<I>(settings: I, redirect_guard: RedirectGuard) -> Self
    where
        I: IntoIterator<Item = SpSettings>,
    {
        Self {
            idps: settings
                .into_iter()
                .map(|settings| (settings.idp_key.clone(), Arc::new(settings)))
                .collect(),
            redirect_guard,
        }
    }

    pub fn resolve(&self, idp_key: &str) -> Result<Arc<SpSettings>, UnknownIdp> {
        self.idps
            .get(idp_key)
            .cloned()
            .ok_or_else(|| UnknownIdp(idp_key.to_string()))
    }

    pub fn idp_keys(&self) -> impl Iterator<Item = &str> {
        self.idps.keys().map(String::as_str)
    }

    pub fn redirect_guard(&self) -> &RedirectGuard {
        &self.redirect_guard
    }
}

/// The registry currently in force. Readers take a snapshot; a reload swaps
/// in a new registry without disturbing handshakes holding the old one.
#[derive(Debug)]
pub struct SharedRegistry {
    current: ArcSwap<SettingsRegistry>,
}

impl SharedRegistry {
    pub fn new(registry: SettingsRegistry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
        }
    }

    pub fn snapshot(&self) -> Arc<SettingsRegistry> {
        self.current.load_full()
    }

    pub fn replace(&self, registry: SettingsRegistry) {
        self.current.store(Arc::new(registry));
    }

    /// Rebuilds from a settings file. On error the current registry stays.
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let registry = SettingsRegistry::from_file(path)?;
        self.replace(registry);
        Ok(())
    }
}
