use std::str::FromStr as _;

use anyhow::{Context as _, Result, bail};
use hex::encode;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha1::Sha1;
use sha2::Sha256;
use strum::{Display, EnumString};
use subtle::ConstantTimeEq;

const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_HEADER: &str = "x-hub-signature";

pub trait GithubRequestVerifier {
    /// `body` must be the raw request body, before any parsing.
    fn verify_request(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
}

impl SignatureAlgorithm {
    fn hex_digest(self, secret: &str, body: &[u8]) -> Result<String> {
        let bytes = match self {
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                    .with_context(|| "HMAC creation failed")?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                    .with_context(|| "HMAC creation failed")?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(encode(bytes))
    }
}

pub struct DefaultVerifier;

impl GithubRequestVerifier for DefaultVerifier {
    fn verify_request(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<()> {
        // Prefer the SHA-256 header. A missing header is an empty digest, which never matches.
        let signature = headers
            .get(SIGNATURE_256_HEADER)
            .or_else(|| headers.get(SIGNATURE_HEADER))
            .map(|v| v.to_str())
            .transpose()
            .with_context(|| "signature header is not visible ASCII")?
            .unwrap_or("sha1=");
        verify_signature(signature, body, secret)
    }
}

fn verify_signature(signature: &str, body: &[u8], secret: &str) -> Result<()> {
    let (algorithm, their_digest) = signature.split_once('=').unwrap_or((signature, ""));
    let algorithm = SignatureAlgorithm::from_str(algorithm)
        .with_context(|| format!("unsupported signature algorithm: {algorithm}"))?;
    let our_digest = algorithm.hex_digest(secret, body)?;
    // Into bool will be false if it's ok, so we need to negate it.
    let choice = !our_digest
        .as_bytes()
        .ct_eq(their_digest.to_ascii_lowercase().as_bytes());
    if choice.into() {
        bail!("signature mismatch: algorithm={algorithm}")
    }
    Ok(())
}
