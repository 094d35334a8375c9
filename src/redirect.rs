//! SAML HTTP-Redirect binding: raw DEFLATE, base64, URL encoding and the
//! optional query-string signature.

use std::io::Read;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use serde::Deserialize;
use url::form_urlencoded::byte_serialize;

use crate::{utils::decode_xml_base64, ToolkitError, ValidationFailure};

/// Inflated messages larger than this are refused.
const MAX_INFLATED_LEN: u64 = 512 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "http://www.w3.org/2000/09/xmldsig#rsa-sha1", alias = "rsa-sha1")]
    RsaSha1,
    #[default]
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256", alias = "rsa-sha256")]
    RsaSha256,
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384", alias = "rsa-sha384")]
    RsaSha384,
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512", alias = "rsa-sha512")]
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::RsaSha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::RsaSha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            SignatureAlgorithm::RsaSha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "http://www.w3.org/2000/09/xmldsig#sha1", alias = "sha1")]
    Sha1,
    #[default]
    #[serde(rename = "http://www.w3.org/2001/04/xmlenc#sha256", alias = "sha256")]
    Sha256,
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#sha384", alias = "sha384")]
    Sha384,
    #[serde(rename = "http://www.w3.org/2001/04/xmlenc#sha512", alias = "sha512")]
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            DigestAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            DigestAlgorithm::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            DigestAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }
}

/// Signs the octets of a redirect query string.
pub trait RedirectSigner {
    fn algorithm(&self) -> SignatureAlgorithm;
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ToolkitError>;
}

/// Raw DEFLATE followed by base64, as the redirect binding requires.
pub fn encode_redirect_payload(xml: &str) -> String {
    let compressed = deflate_bytes(xml.as_bytes());
    BASE64_STANDARD.encode(compressed)
}

fn url_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Builds the redirect URL for an already encoded request message.
///
/// When a signer is given the signed octets are exactly
/// `SAMLRequest=..&RelayState=..&SigAlg=..` as they appear in the URL.
pub fn redirect_url(
    destination: &str,
    encoded: &str,
    relay_state: Option<&str>,
    signer: Option<&dyn RedirectSigner>,
) -> Result<String, ToolkitError> {
    let mut query = format!("SAMLRequest={}", url_encode(encoded));
    if let Some(relay_state) = relay_state {
        query.push_str("&RelayState=");
        query.push_str(&url_encode(relay_state));
    }
    if let Some(signer) = signer {
        query.push_str("&SigAlg=");
        query.push_str(&url_encode(signer.algorithm().uri()));
        let signature = signer.sign(query.as_bytes())?;
        query.push_str("&Signature=");
        query.push_str(&url_encode(&BASE64_STANDARD.encode(signature)));
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{destination}{separator}{query}"))
}

/// Decodes a message received through the redirect binding.
pub fn decode_redirect_payload(encoded: &str) -> Result<Vec<u8>, ValidationFailure> {
    let compressed = decode_xml_base64(encoded).map_err(|_| ValidationFailure::InvalidEncoding)?;
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut inflated)
        .map_err(|_| ValidationFailure::InvalidEncoding)?;
    if inflated.len() as u64 > MAX_INFLATED_LEN {
        return Err(ValidationFailure::InvalidEncoding);
    }
    Ok(inflated)
}

/// Decodes a message received through the POST binding.
pub fn decode_post_payload(encoded: &str) -> Result<Vec<u8>, ValidationFailure> {
    decode_xml_base64(encoded).map_err(|_| ValidationFailure::InvalidEncoding)
}

#[cfg(feature = "xmlsec")]
pub use self::openssl_signer::OpensslRedirectSigner;

#[cfg(feature = "xmlsec")]
mod openssl_signer {
    use openssl::{
        hash::MessageDigest,
        pkey::{PKey, Private},
        sign::Signer,
    };

    use super::{RedirectSigner, SignatureAlgorithm};
    use crate::ToolkitError;

    pub struct OpensslRedirectSigner {
        key: PKey<Private>,
        algorithm: SignatureAlgorithm,
    }

    impl OpensslRedirectSigner {
        pub fn from_pem(pem: &[u8], algorithm: SignatureAlgorithm) -> Result<Self, ToolkitError> {
            let key = PKey::private_key_from_pem(pem)
                .map_err(|e| ToolkitError::Signing(e.to_string()))?;
            Ok(Self { key, algorithm })
        }
    }

    impl RedirectSigner for OpensslRedirectSigner {
        fn algorithm(&self) -> SignatureAlgorithm {
            self.algorithm
        }

        fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ToolkitError> {
            let digest = match self.algorithm {
                SignatureAlgorithm::RsaSha1 => MessageDigest::sha1(),
                SignatureAlgorithm::RsaSha256 => MessageDigest::sha256(),
                SignatureAlgorithm::RsaSha384 => MessageDigest::sha384(),
                SignatureAlgorithm::RsaSha512 => MessageDigest::sha512(),
            };
            let mut signer = Signer::new(digest, &self.key)
                .map_err(|e| ToolkitError::Signing(e.to_string()))?;
            signer
                .update(data)
                .map_err(|e| ToolkitError::Signing(e.to_string()))?;
            signer
                .sign_to_vec()
                .map_err(|e| ToolkitError::Signing(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    struct FixedSigner;

    impl RedirectSigner for FixedSigner {
        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::RsaSha256
        }

        fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ToolkitError> {
            assert!(data.starts_with(b"SAMLRequest="));
            assert!(data.ends_with(b"rsa-sha256"));
            Ok(b"sig".to_vec())
        }
    }

    #[test]
    fn redirect_url_carries_an_inflatable_message() {
        let xml = "<samlp:AuthnRequest ID=\"_id1\"/>";
        let url = redirect_url(
            "https://idp.example/sso?tenant=1",
            &encode_redirect_payload(xml),
            Some("_id1"),
            None,
        )
        .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("tenant".into(), "1".into()));
        assert_eq!(pairs[1].0, "SAMLRequest");
        assert_eq!(pairs[2], ("RelayState".into(), "_id1".into()));
        assert_eq!(decode_redirect_payload(&pairs[1].1).unwrap(), xml.as_bytes());
    }

    #[test]
    fn signed_redirect_appends_sig_alg_and_signature() {
        let url = redirect_url(
            "https://idp.example/slo",
            "abc",
            None,
            Some(&FixedSigner),
        )
        .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let signature = parsed
            .query_pairs()
            .find(|(k, _)| k == "Signature")
            .map(|(_, v)| v.into_owned());
        assert_eq!(signature.as_deref(), Some("c2ln"));
    }

    #[test]
    fn rejects_garbage_payloads() {
        assert_eq!(
            decode_redirect_payload("not base64!"),
            Err(ValidationFailure::InvalidEncoding)
        );
    }
}
