//! Joyent HTTP signature verification for lifecycle requests.
//!
//! SmartThings signs every lifecycle POST with the Joyent HTTP signature
//! scheme. Only rsa-sha256 appears in practice, so that is all we accept,
//! which keeps the implementation small. The public key is resolved from
//! the SmartThings key server by the `keyId` in the Authorization header
//! and cached for the life of the process; failures are never cached.
//!
//! When the signing headers include `digest`, the digest line is recomputed
//! from the exact raw bytes of the request body rather than trusted from
//! the header, binding the signature to the body as received. Re-serializing
//! parsed JSON is lossy and would break verification.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use openssl::base64;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sha::sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::retry::{self, CallError, RetryPolicy};

/// A signature verification failure. Always surfaced as request rejection,
/// never retried locally.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The Authorization (or a required companion) header cannot be parsed.
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    /// The public key for the request's keyId could not be fetched.
    #[error("failed to retrieve key [{key_id}]: {source}")]
    KeyResolutionFailed {
        key_id: String,
        #[source]
        source: CallError,
    },

    /// The request date is outside the allowed clock skew.
    #[error("request date is not current, skew exceeds {skew_secs}s")]
    StaleDate { skew_secs: i64 },

    /// The signature does not match the signing string.
    #[error("signature is not valid")]
    InvalidSignature,
}

/// Fetches and caches SmartThings public keys by key id.
#[derive(Clone)]
pub struct KeyStore {
    keyserver_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyStore {
    pub fn new(keyserver_url: String, http: reqwest::Client, retry: RetryPolicy) -> Self {
        KeyStore {
            keyserver_url,
            http,
            retry,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Retrieve the PEM public key for a key id, from cache when possible.
    pub async fn public_key(&self, key_id: &str) -> Result<String, CallError> {
        if let Some(pem) = self.cache.read().await.get(key_id) {
            return Ok(pem.clone());
        }

        // Key ids are URL-safe per the SmartThings spec, no encoding needed.
        let url = format!(
            "{}/{}",
            self.keyserver_url.trim_end_matches('/'),
            key_id.trim_start_matches('/')
        );
        let pem = retry::call(&self.retry, || async {
            let response = self.http.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(response.text().await?)
        })
        .await?;

        debug!(key_id, "cached public key");
        self.cache
            .write()
            .await
            .insert(key_id.to_string(), pem.clone());
        Ok(pem)
    }
}

/// The attributes of an `Authorization: Signature ...` header.
#[derive(Debug, PartialEq)]
struct SigningAttributes {
    key_id: String,
    algorithm: String,
    headers: String,
    signature: String,
}

impl SigningAttributes {
    /// Parse a header like
    /// `Signature keyId="key",algorithm="rsa-sha256",headers="date",signature="xxx"`.
    fn parse(authorization: &str) -> Result<Self, AuthError> {
        if !authorization.starts_with("Signature ") {
            return Err(AuthError::MalformedHeader(
                "authorization header is not a signature".to_string(),
            ));
        }
        let required = |name: &str| {
            attribute(authorization, name).ok_or_else(|| {
                AuthError::MalformedHeader(format!("signature does not contain: {name}"))
            })
        };
        Ok(SigningAttributes {
            key_id: required("keyId")?,
            algorithm: required("algorithm")?,
            signature: required("signature")?,
            // per the Joyent spec the headers list defaults to just Date
            headers: attribute(authorization, "headers").unwrap_or_else(|| "Date".to_string()),
        })
    }
}

/// Extract a quoted `name="value"` attribute from the header.
fn attribute(header: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = header.find(&needle)? + needle.len();
    let rest = &header[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Return a required header as a non-empty string.
fn header(headers: &HeaderMap, name: &str) -> Result<String, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::MalformedHeader(format!("header not found: {name}")))
}

/// Verifier for rsa-sha256 Joyent HTTP signatures.
pub struct SignatureVerifier {
    keys: KeyStore,
    request_path: String,
    clock_skew_secs: Option<i64>,
}

impl SignatureVerifier {
    /// `request_path` is the path (plus query) of the configured target URL;
    /// the platform signs that, which may differ from the path the server
    /// saw behind a proxy.
    pub fn new(keys: KeyStore, request_path: String, clock_skew_secs: Option<i64>) -> Self {
        SignatureVerifier {
            keys,
            request_path,
            clock_skew_secs,
        }
    }

    /// Verify the signature over the exact raw bytes of the request body.
    pub async fn verify(&self, raw_body: &[u8], headers: &HeaderMap) -> Result<(), AuthError> {
        let authorization = header(headers, "authorization")?;
        let attrs = SigningAttributes::parse(&authorization)?;
        if attrs.algorithm != "rsa-sha256" {
            return Err(AuthError::MalformedHeader(format!(
                "algorithm not supported: {}",
                attrs.algorithm
            )));
        }

        self.verify_date(headers)?;

        let signing_string = self.signing_string(&attrs, raw_body, headers)?;
        let pem = self
            .keys
            .public_key(&attrs.key_id)
            .await
            .map_err(|source| AuthError::KeyResolutionFailed {
                key_id: attrs.key_id.clone(),
                source,
            })?;
        verify_rsa_sha256(&pem, &signing_string, &attrs.signature)
    }

    /// The Date header must be present and, when a skew limit is configured,
    /// within that many seconds of now.
    fn verify_date(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let date = header(headers, "date")?;
        let date: DateTime<Utc> = DateTime::parse_from_rfc2822(&date)
            .map_err(|e| AuthError::MalformedHeader(format!("invalid date header: {e}")))?
            .with_timezone(&Utc);
        if let Some(skew_secs) = self.clock_skew_secs {
            let skew = (Utc::now() - date).num_seconds().abs();
            if skew > skew_secs {
                return Err(AuthError::StaleDate { skew_secs });
            }
        }
        Ok(())
    }

    /// Reconstruct the signing string: one line per signing header, in the
    /// order listed. `(request-target)` uses the configured path; `digest`
    /// is recomputed from the raw body; everything else must be present as
    /// a header.
    fn signing_string(
        &self,
        attrs: &SigningAttributes,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<String, AuthError> {
        let mut components = Vec::new();
        for name in attrs.headers.split_whitespace() {
            let name = name.to_ascii_lowercase();
            let line = match name.as_str() {
                "(request-target)" => {
                    format!("(request-target): post {}", self.request_path)
                }
                "digest" => {
                    format!("digest: SHA-256={}", base64::encode_block(&sha256(raw_body)))
                }
                _ => format!("{}: {}", name, header(headers, &name)?),
            };
            components.push(line);
        }
        Ok(components.join("\n"))
    }
}

fn verify_rsa_sha256(
    pem: &str,
    signing_string: &str,
    signature_b64: &str,
) -> Result<(), AuthError> {
    let signature =
        base64::decode_block(signature_b64.trim()).map_err(|_| AuthError::InvalidSignature)?;
    let key = PKey::public_key_from_pem(pem.as_bytes()).map_err(|_| AuthError::InvalidSignature)?;
    let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha256(), &key)
        .map_err(|_| AuthError::InvalidSignature)?;
    match verifier.verify_oneshot(&signature, signing_string.as_bytes()) {
        Ok(true) => Ok(()),
        _ => Err(AuthError::InvalidSignature),
    }
}
