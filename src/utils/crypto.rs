//! HMAC signing and verification for inbound webhooks and signed endpoints.

use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "sha1",
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(SignatureAlgorithm::Sha1),
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            "sha512" => Ok(SignatureAlgorithm::Sha512),
            other => Err(format!("unsupported signature algorithm: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFormat {
    #[default]
    Hex,
    Base64,
}

pub fn hmac_digest(algorithm: SignatureAlgorithm, secret: &[u8], body: &[u8]) -> Vec<u8> {
    let digest = match algorithm {
        SignatureAlgorithm::Sha1 => HmacSha1::new_from_slice(secret).map(|mut mac| {
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }),
        SignatureAlgorithm::Sha256 => HmacSha256::new_from_slice(secret).map(|mut mac| {
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }),
        SignatureAlgorithm::Sha512 => HmacSha512::new_from_slice(secret).map(|mut mac| {
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }),
    };
    digest.unwrap_or_default()
}

pub fn hmac_sha256_hex(body: &[u8], secret: &str) -> String {
    hex::encode(hmac_digest(
        SignatureAlgorithm::Sha256,
        secret.as_bytes(),
        body,
    ))
}

pub fn sign(
    algorithm: SignatureAlgorithm,
    format: DigestFormat,
    secret: &str,
    body: &[u8],
) -> String {
    let digest = hmac_digest(algorithm, secret.as_bytes(), body);
    match format {
        DigestFormat::Hex => hex::encode(digest),
        DigestFormat::Base64 => BASE64.encode(digest),
    }
}

/// Drops a leading `sha256=` style marker from a signature header value.
pub fn strip_algorithm_prefix(value: &str) -> &str {
    let value = value.trim();
    match value.split_once('=') {
        Some((prefix, rest))
            if !rest.is_empty()
                && matches!(
                    prefix.to_ascii_lowercase().as_str(),
                    "sha1" | "sha256" | "sha512" | "v1"
                ) =>
        {
            rest
        }
        _ => value,
    }
}

/// Constant-time check of `provided` (optionally prefixed) against the HMAC of
/// `body`. Undecodable signatures never match.
pub fn verify_signature(
    algorithm: SignatureAlgorithm,
    format: DigestFormat,
    secret: &str,
    body: &[u8],
    provided: &str,
) -> bool {
    let provided = strip_algorithm_prefix(provided);
    let decoded = match format {
        DigestFormat::Hex => hex::decode(provided.to_ascii_lowercase()).ok(),
        DigestFormat::Base64 => BASE64.decode(provided).ok(),
    };
    let Some(provided_bytes) = decoded else {
        return false;
    };
    let expected = hmac_digest(algorithm, secret.as_bytes(), body);
    constant_time_eq(&provided_bytes, &expected)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
