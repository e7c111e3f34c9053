//! AWS Signature Version 4 request signing
//!
//! Requests carry the signature in headers (`Authorization`, `x-amz-date`,
//! `x-amz-content-sha256`). Only GETs with an empty body are signed, so the
//! payload hash is always the hash of the empty string.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::{NetworkError, Result};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Header values for one signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// `x-amz-date`
    pub amz_date: String,
    /// `x-amz-content-sha256`
    pub content_sha256: String,
    /// `Authorization`
    pub authorization: String,
}

/// Signs requests for one set of credentials
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
}

impl RequestSigner {
    /// Create a signer
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    /// Sign a body-less request.
    ///
    /// `canonical_uri` must already be percent-encoded; `query` pairs are
    /// encoded and sorted here.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        query: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders> {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let content_sha256 = hex_sha256(b"");

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, content_sha256, amz_date
        );
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_query_string(query),
            canonical_headers,
            SIGNED_HEADERS,
            content_sha256
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, SIGNED_HEADERS, signature
        );

        Ok(SignedHeaders {
            amz_date,
            content_sha256,
            authorization,
        })
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

/// Percent-encode an object path, keeping `/`
pub fn uri_encode_path(path: &str) -> String {
    encode(path, true)
}

/// Percent-encode a query component
pub fn uri_encode_value(value: &str) -> String {
    encode(value, false)
}

fn encode(input: &str, keep_slash: bool) -> String {
    let mut result = String::with_capacity(input.len() * 3);
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(b as char)
            }
            b'/' if keep_slash => result.push('/'),
            _ => {
                let _ = write!(result, "%{:02X}", b);
            }
        }
    }
    result
}

/// Canonical query string: encoded pairs sorted by key
pub(crate) fn canonical_query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode_value(k), uri_encode_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| NetworkError::Configuration(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_authorization_shape() {
        let signer = RequestSigner::new("AKID", "secret", "auto");
        let headers = signer
            .sign("GET", "example.com", "/bucket/key", &BTreeMap::new(), timestamp())
            .unwrap();

        assert_eq!(headers.amz_date, "20240115T120000Z");
        assert_eq!(
            headers.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(headers
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKID/20240115/auto/s3/aws4_request, "));
        assert!(headers
            .authorization
            .contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        let signature = headers.authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = RequestSigner::new("AKID", "secret", "auto");
        let a = signer
            .sign("GET", "example.com", "/bucket/key", &BTreeMap::new(), timestamp())
            .unwrap();
        let b = signer
            .sign("GET", "example.com", "/bucket/key", &BTreeMap::new(), timestamp())
            .unwrap();
        assert_eq!(a, b);

        let other_key = signer
            .sign("GET", "example.com", "/bucket/other", &BTreeMap::new(), timestamp())
            .unwrap();
        assert_ne!(a.authorization, other_key.authorization);

        let other_secret = RequestSigner::new("AKID", "different", "auto")
            .sign("GET", "example.com", "/bucket/key", &BTreeMap::new(), timestamp())
            .unwrap();
        assert_ne!(a.authorization, other_secret.authorization);
    }

    #[test]
    fn test_uri_encoding() {
        assert_eq!(uri_encode_path("/bucket/a b+c.ckpt"), "/bucket/a%20b%2Bc.ckpt");
        assert_eq!(uri_encode_value("a/b"), "a%2Fb");
        assert_eq!(uri_encode_value("~x_y-z."), "~x_y-z.");
    }

    #[test]
    fn test_canonical_query_is_sorted() {
        let mut query = BTreeMap::new();
        query.insert("prefix".to_string(), "abc".to_string());
        query.insert("list-type".to_string(), "2".to_string());
        assert_eq!(canonical_query_string(&query), "list-type=2&prefix=abc");
    }
}
