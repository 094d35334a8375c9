//! XML Encryption for EncryptedAssertion and EncryptedID: RSA-OAEP key
//! transport with AES-CBC or AES-GCM content encryption.

use libxml::tree::Node;
use openssl::{
    md::{Md, MdRef},
    pkey::{PKeyRef, Private},
    pkey_ctx::PkeyCtx,
    rsa::Padding,
    symm::{decrypt_aead, Cipher, Crypter, Mode},
};
use tracing::debug;

use crate::{
    utils::{
        decode_xml_base64,
        xml::{children, optional_child, required_child, text, DS, XENC, XENC11},
    },
    ValidationFailure,
};

const RSA_OAEP_MGF1P: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p";
const RSA_OAEP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;

#[derive(Clone, Copy)]
enum ContentCipher {
    Cbc(Cipher),
    Gcm(Cipher),
}

impl ContentCipher {
    fn from_uri(uri: &str) -> Option<Self> {
        Some(match uri {
            "http://www.w3.org/2001/04/xmlenc#aes128-cbc" => ContentCipher::Cbc(Cipher::aes_128_cbc()),
            "http://www.w3.org/2001/04/xmlenc#aes192-cbc" => ContentCipher::Cbc(Cipher::aes_192_cbc()),
            "http://www.w3.org/2001/04/xmlenc#aes256-cbc" => ContentCipher::Cbc(Cipher::aes_256_cbc()),
            "http://www.w3.org/2009/xmlenc11#aes128-gcm" => ContentCipher::Gcm(Cipher::aes_128_gcm()),
            "http://www.w3.org/2009/xmlenc11#aes192-gcm" => ContentCipher::Gcm(Cipher::aes_192_gcm()),
            "http://www.w3.org/2009/xmlenc11#aes256-gcm" => ContentCipher::Gcm(Cipher::aes_256_gcm()),
            _ => return None,
        })
    }

    fn key_len(&self) -> usize {
        match self {
            ContentCipher::Cbc(cipher) | ContentCipher::Gcm(cipher) => cipher.key_len(),
        }
    }
}

fn failed() -> ValidationFailure {
    ValidationFailure::DecryptionFailed
}

fn digest_from_uri(uri: &str) -> Option<&'static MdRef> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => Some(Md::sha1()),
        "http://www.w3.org/2001/04/xmlenc#sha256" => Some(Md::sha256()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Some(Md::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Some(Md::sha512()),
        _ => None,
    }
}

fn mgf_from_uri(uri: &str) -> Option<&'static MdRef> {
    match uri {
        "http://www.w3.org/2009/xmlenc11#mgf1sha1" => Some(Md::sha1()),
        "http://www.w3.org/2009/xmlenc11#mgf1sha256" => Some(Md::sha256()),
        "http://www.w3.org/2009/xmlenc11#mgf1sha384" => Some(Md::sha384()),
        "http://www.w3.org/2009/xmlenc11#mgf1sha512" => Some(Md::sha512()),
        _ => None,
    }
}

fn algorithm(node: &Node) -> Result<String, ValidationFailure> {
    required_child(node, XENC, "EncryptionMethod")?
        .get_attribute("Algorithm")
        .ok_or_else(|| ValidationFailure::Malformed("EncryptionMethod without Algorithm".into()))
}

fn cipher_value(node: &Node) -> Result<Vec<u8>, ValidationFailure> {
    let cipher_data = required_child(node, XENC, "CipherData")?;
    let value = required_child(&cipher_data, XENC, "CipherValue")?;
    decode_xml_base64(&text(&value)).map_err(|_| ValidationFailure::InvalidEncoding)
}

/// Unwraps the symmetric key carried in an `xenc:EncryptedKey`.
fn unwrap_key(
    encrypted_key: &Node,
    key: &PKeyRef<Private>,
) -> Result<Vec<u8>, ValidationFailure> {
    let method = required_child(encrypted_key, XENC, "EncryptionMethod")?;
    let (oaep_md, mgf_md) = match method.get_attribute("Algorithm").as_deref() {
        Some(RSA_OAEP_MGF1P) => {
            let digest = optional_child(&method, DS, "DigestMethod")?
                .and_then(|digest| digest.get_attribute("Algorithm"));
            let oaep_md = match digest {
                Some(uri) => digest_from_uri(&uri).ok_or(ValidationFailure::DecryptionFailed)?,
                None => Md::sha1(),
            };
            (oaep_md, Md::sha1())
        }
        Some(RSA_OAEP) => {
            let digest = optional_child(&method, DS, "DigestMethod")?
                .and_then(|digest| digest.get_attribute("Algorithm"));
            let mgf = optional_child(&method, XENC11, "MGF")?
                .and_then(|mgf| mgf.get_attribute("Algorithm"));
            let oaep_md = match digest {
                Some(uri) => digest_from_uri(&uri).ok_or(ValidationFailure::DecryptionFailed)?,
                None => Md::sha1(),
            };
            let mgf_md = match mgf {
                Some(uri) => mgf_from_uri(&uri).ok_or(ValidationFailure::DecryptionFailed)?,
                None => Md::sha1(),
            };
            (oaep_md, mgf_md)
        }
        other => {
            debug!(algorithm = ?other, "unsupported key transport");
            return Err(failed());
        }
    };
    rsa_oaep_decrypt(key, &cipher_value(encrypted_key)?, oaep_md, mgf_md)
}

fn rsa_oaep_decrypt(
    key: &PKeyRef<Private>,
    wrapped: &[u8],
    oaep_md: &MdRef,
    mgf_md: &MdRef,
) -> Result<Vec<u8>, ValidationFailure> {
    let mut ctx = PkeyCtx::new(key).map_err(|_| failed())?;
    ctx.decrypt_init().map_err(|_| failed())?;
    ctx.set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(|_| failed())?;
    ctx.set_rsa_oaep_md(oaep_md).map_err(|_| failed())?;
    ctx.set_rsa_mgf1_md(mgf_md).map_err(|_| failed())?;
    let mut out = Vec::new();
    ctx.decrypt_to_vec(wrapped, &mut out)
        .map_err(|_| failed())?;
    Ok(out)
}

fn decrypt_content(
    cipher: ContentCipher,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, ValidationFailure> {
    if key.len() != cipher.key_len() {
        return Err(failed());
    }
    match cipher {
        ContentCipher::Gcm(cipher) => {
            if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
                return Err(failed());
            }
            let (iv, rest) = data.split_at(GCM_IV_LEN);
            let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
            decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag).map_err(|_| failed())
        }
        ContentCipher::Cbc(cipher) => {
            if data.len() < 2 * CBC_IV_LEN || data.len() % CBC_IV_LEN != 0 {
                return Err(failed());
            }
            let (iv, ciphertext) = data.split_at(CBC_IV_LEN);
            let mut crypter =
                Crypter::new(cipher, Mode::Decrypt, key, Some(iv)).map_err(|_| failed())?;
            // XML Encryption pads with arbitrary bytes, so the padding is
            // stripped by hand.
            crypter.pad(false);
            let mut out = vec![0; ciphertext.len() + cipher.block_size()];
            let mut len = crypter.update(ciphertext, &mut out).map_err(|_| failed())?;
            len += crypter.finalize(&mut out[len..]).map_err(|_| failed())?;
            out.truncate(len);
            let pad = usize::from(*out.last().ok_or_else(failed)?);
            if pad == 0 || pad > CBC_IV_LEN || pad > out.len() {
                return Err(failed());
            }
            out.truncate(out.len() - pad);
            Ok(out)
        }
    }
}

/// Decrypts the `xenc:EncryptedData` inside `container` (an
/// EncryptedAssertion or EncryptedID) and returns the plaintext XML.
pub(crate) fn decrypt_element(
    container: &Node,
    key: &PKeyRef<Private>,
) -> Result<Vec<u8>, ValidationFailure> {
    let encrypted_data = required_child(container, XENC, "EncryptedData")?;
    let content_algorithm = algorithm(&encrypted_data)?;
    let cipher = ContentCipher::from_uri(&content_algorithm).ok_or_else(|| {
        debug!(algorithm = %content_algorithm, "unsupported content encryption");
        failed()
    })?;

    // The EncryptedKey sits either in the EncryptedData's KeyInfo or next to
    // the EncryptedData.
    let mut encrypted_keys = match optional_child(&encrypted_data, DS, "KeyInfo")? {
        Some(key_info) => children(&key_info, XENC, "EncryptedKey"),
        None => Vec::new(),
    };
    encrypted_keys.extend(children(container, XENC, "EncryptedKey"));
    if encrypted_keys.is_empty() {
        return Err(ValidationFailure::Malformed("no EncryptedKey".into()));
    }

    let data = cipher_value(&encrypted_data)?;
    for encrypted_key in &encrypted_keys {
        if let Ok(symmetric) = unwrap_key(encrypted_key, key) {
            return decrypt_content(cipher, &symmetric, &data);
        }
    }
    Err(failed())
}
