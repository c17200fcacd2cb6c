use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

#[derive(thiserror::Error, Debug)]
pub enum SigningError {
    #[error("signing key is empty")]
    EmptyKey,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("could not encode JWS header: {0}")]
    Header(#[from] serde_json::Error),
}

/// Signs request bodies sent to the federation gateway.
pub trait ContentSigner: Send + Sync {
    /// JWS `alg` value of the produced signatures.
    fn algorithm(&self) -> &'static str;

    fn sign(&self, content: &[u8]) -> Result<Vec<u8>, SigningError>;
}

pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: &[u8]) -> Result<Self, SigningError> {
        if key.is_empty() {
            return Err(SigningError::EmptyKey);
        }
        Ok(HmacSigner { key: key.to_vec() })
    }
}

impl ContentSigner for HmacSigner {
    fn algorithm(&self) -> &'static str {
        "HS256"
    }

    fn sign(&self, content: &[u8]) -> Result<Vec<u8>, SigningError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        mac.update(content);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[derive(Serialize)]
struct JwsHeader<'a> {
    alg: &'a str,
}

/// Produces compact JWS serializations with a pluggable signer.
#[derive(Clone)]
pub struct Jws {
    signer: Arc<dyn ContentSigner>,
}

impl Jws {
    pub fn new(signer: Arc<dyn ContentSigner>) -> Self {
        Jws { signer }
    }

    /// `base64url(header).base64url(payload).base64url(signature)`, signature
    /// computed over the first two parts.
    pub fn sign(&self, payload: &[u8]) -> Result<String, SigningError> {
        let header = serde_json::to_vec(&JwsHeader {
            alg: self.signer.algorithm(),
        })?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.signer.sign(signing_input.as_bytes())?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}
