//! Time-limited, single-object write credentials.
//!
//! A credential is an HMAC-SHA256 over `PUT\n{bucket}\n{key}\n{expires}` carried
//! in the query string of the upload URL. Nothing is persisted here: the object
//! store front door calls [`UploadSigner::verify`] and enforces scope and expiry.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use gallery_db::storage::validate_component;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const UPLOAD_METHOD: &str = "PUT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload credential expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("upload signature does not match")]
    InvalidSignature,
    #[error("upload credential is not valid for bucket '{0}'")]
    WrongBucket(String),
    #[error("invalid upload key '{0}'")]
    InvalidKey(String),
    #[error("upload signer misconfigured: {0}")]
    Misconfigured(String),
}

/// What the client needs to write exactly one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    pub url: String,
    pub method: String,
    pub bucket: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UploadSigner {
    secret: Vec<u8>,
    base_url: String,
    bucket: String,
    validity: Duration,
}

impl std::fmt::Debug for UploadSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSigner")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl UploadSigner {
    pub fn new(
        secret: Vec<u8>,
        base_url: impl Into<String>,
        bucket: impl Into<String>,
        validity: Duration,
    ) -> Result<Self, UploadError> {
        if secret.is_empty() {
            return Err(UploadError::Misconfigured("signing secret is empty".into()));
        }
        if validity.is_zero() {
            return Err(UploadError::Misconfigured("validity window is zero".into()));
        }
        let bucket = bucket.into();
        validate_component(&bucket)
            .map_err(|_| UploadError::Misconfigured(format!("bad bucket '{bucket}'")))?;

        Ok(Self {
            secret,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bucket,
            validity,
        })
    }

    pub fn issue(&self, key: &str) -> Result<UploadCredential, UploadError> {
        self.issue_at(key, Utc::now())
    }

    pub fn issue_at(&self, key: &str, now: DateTime<Utc>) -> Result<UploadCredential, UploadError> {
        validate_component(key).map_err(|_| UploadError::InvalidKey(key.to_string()))?;

        let validity_secs = i64::try_from(self.validity.as_secs()).unwrap_or(i64::MAX);
        let expires = now.timestamp().saturating_add(validity_secs);
        let expires_at = DateTime::<Utc>::from_timestamp(expires, 0).ok_or_else(|| {
            UploadError::Misconfigured(format!("expiry {expires} out of range"))
        })?;
        let signature = self.sign(&self.bucket, key, expires)?;

        Ok(UploadCredential {
            url: format!(
                "{}/uploads/{}/{}?expires={}&signature={}",
                self.base_url, self.bucket, key, expires, signature
            ),
            method: UPLOAD_METHOD.to_string(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            expires_at,
        })
    }

    pub fn verify(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<(), UploadError> {
        self.verify_at(bucket, key, expires, signature, Utc::now())
    }

    /// Scope first, then signature, then expiry: a tampered `expires` reads as a
    /// bad signature rather than as an expired credential.
    pub fn verify_at(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        if bucket != self.bucket {
            return Err(UploadError::WrongBucket(bucket.to_string()));
        }
        validate_component(key).map_err(|_| UploadError::InvalidKey(key.to_string()))?;

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| UploadError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(canonical_request(bucket, key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| UploadError::InvalidSignature)?;

        if now.timestamp() > expires {
            let expired_at = DateTime::<Utc>::from_timestamp(expires, 0).unwrap_or(now);
            return Err(UploadError::Expired(expired_at));
        }
        Ok(())
    }

    fn sign(&self, bucket: &str, key: &str, expires: i64) -> Result<String, UploadError> {
        let mut mac = self.mac()?;
        mac.update(canonical_request(bucket, key, expires).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha256, UploadError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| UploadError::Misconfigured(err.to_string()))
    }
}

fn canonical_request(bucket: &str, key: &str, expires: i64) -> String {
    format!("{UPLOAD_METHOD}\n{bucket}\n{key}\n{expires}")
}
