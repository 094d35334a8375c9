use base64::{prelude::BASE64_STANDARD, Engine};
use time::{Duration, OffsetDateTime};
use yaserde::YaSerialize;

use crate::{
    authn_request::ProtocolBinding,
    redirect::{DigestAlgorithm, SignatureAlgorithm},
    utils::xs_duration,
    ToolkitError, DATE_TIME_FORMAT,
};

const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
    "ds" = "http://www.w3.org/2000/09/xmldsig#",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "ID")]
    id: Option<String>,
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(attribute = true, rename = "validUntil")]
    valid_until: Option<String>,
    #[yaserde(attribute = true, rename = "cacheDuration")]
    cache_duration: Option<String>,
    #[yaserde(rename = "Signature", prefix = "ds")]
    signature: Option<Signature>,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
    #[yaserde(rename = "Organization", prefix = "md")]
    organization: Option<OrganizationElement>,
    #[yaserde(rename = "ContactPerson", prefix = "md")]
    contact_people: Vec<ContactPerson>,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "KeyDescriptor", prefix = "md")]
    key_descriptors: Vec<KeyDescriptor>,
    #[yaserde(rename = "SingleLogoutService", prefix = "md")]
    single_logout_service: Option<Endpoint>,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_format: NameIdFormat,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: AssertionConsumerService,
}

#[derive(YaSerialize)]
struct KeyDescriptor {
    #[yaserde(attribute = true, rename = "use")]
    key_use: String,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct KeyInfo {
    #[yaserde(rename = "X509Data", prefix = "ds")]
    x509_data: X509Data,
}

#[derive(YaSerialize)]
struct X509Data {
    #[yaserde(rename = "X509Certificate", prefix = "ds")]
    certificate: String,
}

/// Enveloped signature skeleton; the digest and signature values are filled
/// in by the signer.
#[derive(YaSerialize)]
struct Signature {
    #[yaserde(rename = "SignedInfo", prefix = "ds")]
    signed_info: SignedInfo,
    #[yaserde(rename = "SignatureValue", prefix = "ds")]
    signature_value: Empty,
    #[yaserde(rename = "KeyInfo", prefix = "ds")]
    key_info: KeyInfo,
}

#[derive(YaSerialize)]
struct SignedInfo {
    #[yaserde(rename = "CanonicalizationMethod", prefix = "ds")]
    canonicalization_method: Algorithm,
    #[yaserde(rename = "SignatureMethod", prefix = "ds")]
    signature_method: Algorithm,
    #[yaserde(rename = "Reference", prefix = "ds")]
    reference: Reference,
}

#[derive(YaSerialize)]
struct Reference {
    #[yaserde(attribute = true, rename = "URI")]
    uri: String,
    #[yaserde(rename = "Transforms", prefix = "ds")]
    transforms: Transforms,
    #[yaserde(rename = "DigestMethod", prefix = "ds")]
    digest_method: Algorithm,
    #[yaserde(rename = "DigestValue", prefix = "ds")]
    digest_value: Empty,
}

#[derive(YaSerialize)]
struct Transforms {
    #[yaserde(rename = "Transform", prefix = "ds")]
    transforms: Vec<Algorithm>,
}

#[derive(YaSerialize)]
struct Algorithm {
    #[yaserde(attribute = true, rename = "Algorithm")]
    algorithm: String,
}

impl Algorithm {
    fn new(uri: &str) -> Self {
        Self {
            algorithm: uri.to_string(),
        }
    }
}

#[derive(YaSerialize)]
struct Empty {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct NameIdFormat {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct Endpoint {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
}

#[derive(YaSerialize)]
struct AssertionConsumerService {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
}

#[derive(YaSerialize)]
struct OrganizationElement {
    #[yaserde(rename = "OrganizationName", prefix = "md")]
    name: Localized,
    #[yaserde(rename = "OrganizationDisplayName", prefix = "md")]
    display_name: Localized,
    #[yaserde(rename = "OrganizationURL", prefix = "md")]
    url: Localized,
}

#[derive(YaSerialize)]
struct Localized {
    #[yaserde(attribute = true, prefix = "xml", rename = "lang")]
    lang: String,
    #[yaserde(text = true)]
    content: String,
}

impl Localized {
    fn en(content: String) -> Self {
        Self {
            lang: "en".into(),
            content,
        }
    }
}

#[derive(YaSerialize)]
struct ContactPerson {
    #[yaserde(attribute = true, rename = "contactType")]
    contact_type: String,
    #[yaserde(rename = "GivenName", prefix = "md")]
    given_name: String,
    #[yaserde(rename = "EmailAddress", prefix = "md")]
    email_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub contact_type: String,
    pub given_name: String,
    pub email_address: String,
}

#[derive(Default, Clone)]
pub struct SpMetadataBuilder {
    id: Option<String>,
    entity_id: Option<String>,
    acs_url: Option<String>,
    sls_url: Option<String>,
    name_id_format: Option<String>,
    authn_requests_signed: bool,
    want_assertions_signed: bool,
    signing_certificate: Option<Vec<u8>>,
    encryption_certificate: Option<Vec<u8>>,
    valid_until: Option<OffsetDateTime>,
    cache_duration: Option<Duration>,
    organization: Option<Organization>,
    contacts: Vec<Contact>,
    signature: Option<(SignatureAlgorithm, DigestAlgorithm)>,
}

impl SpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document ID, needed when the metadata gets an enveloped signature.
    pub fn id(self, id: &str) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn acs_url(self, acs_url: &str) -> Self {
        Self {
            acs_url: Some(acs_url.into()),
            ..self
        }
    }

    pub fn sls_url(self, sls_url: Option<&str>) -> Self {
        Self {
            sls_url: sls_url.map(Into::into),
            ..self
        }
    }

    pub fn name_id_format(self, name_id_format: &str) -> Self {
        Self {
            name_id_format: Some(name_id_format.into()),
            ..self
        }
    }

    pub fn authn_requests_signed(self, signed: bool) -> Self {
        Self {
            authn_requests_signed: signed,
            ..self
        }
    }

    pub fn want_assertions_signed(self, signed: bool) -> Self {
        Self {
            want_assertions_signed: signed,
            ..self
        }
    }

    pub fn signing_certificate(self, der: Option<&[u8]>) -> Self {
        Self {
            signing_certificate: der.map(<[u8]>::to_vec),
            ..self
        }
    }

    pub fn encryption_certificate(self, der: Option<&[u8]>) -> Self {
        Self {
            encryption_certificate: der.map(<[u8]>::to_vec),
            ..self
        }
    }

    pub fn valid_until(self, valid_until: OffsetDateTime) -> Self {
        Self {
            valid_until: Some(valid_until),
            ..self
        }
    }

    pub fn cache_duration(self, cache_duration: Duration) -> Self {
        Self {
            cache_duration: Some(cache_duration),
            ..self
        }
    }

    pub fn organization(self, organization: Option<Organization>) -> Self {
        Self {
            organization,
            ..self
        }
    }

    pub fn contacts(self, contacts: Vec<Contact>) -> Self {
        Self { contacts, ..self }
    }

    /// Adds an empty enveloped-signature template referencing the document
    /// ID, with the signing certificate as KeyInfo.
    pub fn signature_template(
        self,
        signature_algorithm: SignatureAlgorithm,
        digest_algorithm: DigestAlgorithm,
    ) -> Self {
        Self {
            signature: Some((signature_algorithm, digest_algorithm)),
            ..self
        }
    }

    pub fn build(self) -> Result<String, ToolkitError> {
        let key_descriptor = |key_use: &str, der: Vec<u8>| KeyDescriptor {
            key_use: key_use.to_string(),
            key_info: KeyInfo {
                x509_data: X509Data {
                    certificate: BASE64_STANDARD.encode(der),
                },
            },
        };
        let signature = match self.signature {
            Some((signature_algorithm, digest_algorithm)) => Some(Signature {
                signed_info: SignedInfo {
                    canonicalization_method: Algorithm::new(EXCLUSIVE_C14N),
                    signature_method: Algorithm::new(signature_algorithm.uri()),
                    reference: Reference {
                        uri: format!(
                            "#{}",
                            self.id.as_deref().ok_or(ToolkitError::MissingField("ID"))?
                        ),
                        transforms: Transforms {
                            transforms: vec![
                                Algorithm::new(ENVELOPED_SIGNATURE),
                                Algorithm::new(EXCLUSIVE_C14N),
                            ],
                        },
                        digest_method: Algorithm::new(digest_algorithm.uri()),
                        digest_value: Empty {
                            content: String::new(),
                        },
                    },
                },
                signature_value: Empty {
                    content: String::new(),
                },
                key_info: KeyInfo {
                    x509_data: X509Data {
                        certificate: BASE64_STANDARD.encode(
                            self.signing_certificate
                                .as_deref()
                                .ok_or(ToolkitError::MissingKey)?,
                        ),
                    },
                },
            }),
            None => None,
        };

        let mut key_descriptors = Vec::new();
        if let Some(der) = self.signing_certificate {
            key_descriptors.push(key_descriptor("signing", der));
        }
        if let Some(der) = self.encryption_certificate {
            key_descriptors.push(key_descriptor("encryption", der));
        }

        let metadata = EntityDescriptor {
            id: self.id,
            entity_id: self
                .entity_id
                .ok_or(ToolkitError::MissingField("entity_id"))?,
            valid_until: self
                .valid_until
                .map(|instant| instant.format(&DATE_TIME_FORMAT))
                .transpose()
                .map_err(|e| ToolkitError::Serialization(e.to_string()))?,
            cache_duration: self.cache_duration.map(xs_duration),
            signature,
            sp_sso_descriptor: SPSSODescriptor {
                authn_requests_signed: self.authn_requests_signed,
                want_assertions_signed: self.want_assertions_signed,
                protocol_support_enumeration: "urn:oasis:names:tc:SAML:2.0:protocol".into(),
                key_descriptors,
                single_logout_service: self.sls_url.map(|location| Endpoint {
                    binding: ProtocolBinding::Redirect.to_string(),
                    location,
                }),
                name_id_format: NameIdFormat {
                    content: self
                        .name_id_format
                        .ok_or(ToolkitError::MissingField("name_id_format"))?,
                },
                assertion_consumer_service: AssertionConsumerService {
                    binding: ProtocolBinding::Post.to_string(),
                    location: self.acs_url.ok_or(ToolkitError::MissingField("acs_url"))?,
                    index: 0,
                },
            },
            organization: self.organization.map(|org| OrganizationElement {
                name: Localized::en(org.name),
                display_name: Localized::en(org.display_name),
                url: Localized::en(org.url),
            }),
            contact_people: self
                .contacts
                .into_iter()
                .map(|contact| ContactPerson {
                    contact_type: contact.contact_type,
                    given_name: contact.given_name,
                    email_address: contact.email_address,
                })
                .collect(),
        };
        yaserde::ser::to_string(&metadata).map_err(ToolkitError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use crate::NAME_ID_FORMAT_EMAIL_ADDRESS;

    use super::*;

    #[test]
    fn can_build_sp_metadata() {
        let xml = SpMetadataBuilder::new()
            .entity_id("entity_id")
            .acs_url("https://foo.com/acs")
            .sls_url(Some("https://foo.com/sls"))
            .name_id_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .want_assertions_signed(true)
            .signing_certificate(Some(&[1, 2, 3]))
            .cache_duration(Duration::days(7))
            .contacts(vec![Contact {
                contact_type: "technical".into(),
                given_name: "Ops".into(),
                email_address: "ops@foo.com".into(),
            }])
            .build()
            .unwrap();

        assert!(xml.contains(r#"entityID="entity_id""#));
        assert!(xml.contains(r#"WantAssertionsSigned="true""#));
        assert!(xml.contains(r#"use="signing""#));
        assert!(xml.contains("AQID"));
        assert!(xml.contains("https://foo.com/sls"));
        assert!(xml.contains(r#"cacheDuration="PT604800S""#));
        assert!(xml.contains("ops@foo.com"));
        assert!(!xml.contains(r#"use="encryption""#));
    }

    #[test]
    fn acs_url_is_required() {
        let result = SpMetadataBuilder::new()
            .entity_id("entity_id")
            .name_id_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .build();
        assert_eq!(result, Err(ToolkitError::MissingField("acs_url")));
    }

    #[test]
    fn can_add_signature_template() {
        let builder = SpMetadataBuilder::new()
            .entity_id("entity_id")
            .acs_url("https://foo.com/acs")
            .name_id_format(NAME_ID_FORMAT_EMAIL_ADDRESS)
            .signing_certificate(Some(&[1, 2, 3]))
            .signature_template(SignatureAlgorithm::RsaSha256, DigestAlgorithm::Sha256);

        assert_eq!(
            builder.clone().build(),
            Err(ToolkitError::MissingField("ID"))
        );

        let xml = builder.id("_meta1").build().unwrap();
        assert!(xml.contains(r##"URI="#_meta1""##));
        assert!(xml.contains(SignatureAlgorithm::RsaSha256.uri()));
        assert!(xml.find("Signature").unwrap() < xml.find("SPSSODescriptor").unwrap());
    }
}
