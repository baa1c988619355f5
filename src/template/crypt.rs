//! Hybrid encryption envelope for secret values stored in the backend.
//!
//! Layout before base64: `u16 BE wrapped key length | RSA-OAEP(SHA-256)
//! wrapped AES-256 key | 12 byte nonce | AES-256-GCM ciphertext`.

use aes_gcm::aead::Aead;
use aes_gcm::aead::AeadCore;
use aes_gcm::aead::OsRng;
use aes_gcm::Aes256Gcm;
use aes_gcm::KeyInit;
use aes_gcm::Nonce;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::Oaep;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use sha2::Sha256;

use crate::Result;
use crate::TemplateError;

const NONCE_LEN: usize = 12;

pub struct Decryptor {
    key: RsaPrivateKey,
}

impl std::fmt::Debug for Decryptor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Decryptor").finish_non_exhaustive()
    }
}

impl Decryptor {
    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| crypt_error(format!("invalid private key: {e}")))?;
        Ok(Self { key })
    }

    pub fn decrypt(
        &self,
        envelope: &str,
    ) -> Result<String> {
        let raw = STANDARD
            .decode(envelope.trim())
            .map_err(|e| crypt_error(format!("invalid base64: {e}")))?;
        if raw.len() < 2 {
            return Err(crypt_error("envelope too short".into()));
        }
        let wrapped_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let body = &raw[2..];
        if body.len() < wrapped_len + NONCE_LEN {
            return Err(crypt_error("envelope truncated".into()));
        }
        let (wrapped, rest) = body.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let aes_key = self
            .key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| crypt_error(format!("cannot unwrap key: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&aes_key).map_err(|e| crypt_error(format!("bad key length: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| crypt_error("authentication failed".into()))?;

        String::from_utf8(plaintext).map_err(|e| crypt_error(format!("plaintext is not utf-8: {e}")))
    }
}

/// Produces an envelope that [`Decryptor::decrypt`] opens with the matching private key.
pub fn encrypt_value(
    public_pem: &str,
    plaintext: &str,
) -> Result<String> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
        .map_err(|e| crypt_error(format!("invalid public key: {e}")))?;

    let aes_key = Aes256Gcm::generate_key(OsRng);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let cipher = Aes256Gcm::new(&aes_key);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| crypt_error("encryption failed".into()))?;
    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), aes_key.as_slice())
        .map_err(|e| crypt_error(format!("cannot wrap key: {e}")))?;

    let wrapped_len = u16::try_from(wrapped.len()).map_err(|_| crypt_error("public key too large".into()))?;
    let mut raw = Vec::with_capacity(2 + wrapped.len() + NONCE_LEN + ciphertext.len());
    raw.extend_from_slice(&wrapped_len.to_be_bytes());
    raw.extend_from_slice(&wrapped);
    raw.extend_from_slice(nonce.as_slice());
    raw.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(raw))
}

fn crypt_error(msg: String) -> crate::Error {
    TemplateError::Crypt(msg).into()
}
