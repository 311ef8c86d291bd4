use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::worker::DerivationStage;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_path: PathBuf,
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: PathBuf::from("./logs/gallery-audit.jsonl"),
            hmac_key: None,
        }
    }
}

/// Append-only JSONL log of pipeline events, replayable after failures.
#[derive(Debug)]
pub(crate) struct AuditLogWriter {
    state: Arc<AuditLogState>,
}

#[derive(Debug)]
struct AuditLogState {
    path: PathBuf,
    hmac_key: Option<Vec<u8>>,
    lock: Mutex<()>,
}

impl AuditLogWriter {
    pub fn try_new(config: &AuditConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }

        Ok(Self {
            state: Arc::new(AuditLogState {
                path: config.log_path.clone(),
                hmac_key: config.hmac_key.clone(),
                lock: Mutex::new(()),
            }),
        })
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<()> {
        let _guard = self.state.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state.path)
            .await
            .with_context(|| format!("opening audit log {}", self.state.path.display()))?;

        let canonical = serde_json::to_value(event).context("serializing audit payload")?;
        let signature = match &self.state.hmac_key {
            Some(key) => Some(sign_payload(key, &canonical)?),
            None => None,
        };

        #[derive(Serialize)]
        struct AuditLine<'a> {
            #[serde(flatten)]
            event: &'a AuditEvent,
            #[serde(skip_serializing_if = "Option::is_none")]
            signature: Option<String>,
        }

        let line = AuditLine { event, signature };
        let encoded = serde_json::to_vec(&line).context("serializing audit line")?;
        file.write_all(&encoded).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

// Signs the key-sorted rendering so a reader can recompute it from the parsed line.
fn sign_payload(key: &[u8], canonical: &Value) -> Result<String> {
    let payload = serde_json::to_vec(canonical).context("encoding canonical audit payload")?;
    let mut mac =
        HmacSha256::new_from_slice(key).context("initializing HMAC for audit log entry")?;
    mac.update(&payload);
    Ok(STANDARD_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Checks the signature of one audit log line. Unsigned lines fail verification.
pub fn verify_signed_line(line: &str, key: &[u8]) -> Result<bool> {
    let mut value: Value = serde_json::from_str(line).context("parsing audit line")?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("audit line is not a JSON object"))?;
    let signature = match object.remove("signature") {
        Some(Value::String(signature)) => signature,
        _ => return Ok(false),
    };
    Ok(sign_payload(key, &value)? == signature)
}

#[derive(Debug, Serialize, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type")]
pub enum AuditEventKind {
    #[serde(rename = "image_created")]
    ImageCreated { group_id: String, image_id: Uuid },
    #[serde(rename = "upload_accepted")]
    UploadAccepted {
        bucket: String,
        key: String,
        size_bytes: u64,
        message_id: Uuid,
    },
    #[serde(rename = "thumbnail_stored")]
    ThumbnailStored {
        original_key: String,
        thumbnail_key: String,
        width: u32,
        height: u32,
    },
    #[serde(rename = "derivation_failed")]
    DerivationFailed {
        message_id: Uuid,
        attempt: u32,
        position: String,
        key: Option<String>,
        stage: DerivationStage,
        retryable: bool,
        error: String,
    },
    #[serde(rename = "message_parked")]
    MessageParked {
        message_id: Uuid,
        attempt: u32,
        reason: String,
        body: String,
    },
}

impl AuditEvent {
    fn now(kind: AuditEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn image_created(group_id: impl Into<String>, image_id: Uuid) -> Self {
        Self::now(AuditEventKind::ImageCreated {
            group_id: group_id.into(),
            image_id,
        })
    }

    pub fn upload_accepted(
        bucket: impl Into<String>,
        key: impl Into<String>,
        size_bytes: u64,
        message_id: Uuid,
    ) -> Self {
        Self::now(AuditEventKind::UploadAccepted {
            bucket: bucket.into(),
            key: key.into(),
            size_bytes,
            message_id,
        })
    }

    pub fn thumbnail_stored(
        original_key: impl Into<String>,
        thumbnail_key: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Self {
        Self::now(AuditEventKind::ThumbnailStored {
            original_key: original_key.into(),
            thumbnail_key: thumbnail_key.into(),
            width,
            height,
        })
    }

    pub fn derivation_failed(
        message_id: Uuid,
        attempt: u32,
        position: impl Into<String>,
        key: Option<String>,
        stage: DerivationStage,
        retryable: bool,
        error: impl Into<String>,
    ) -> Self {
        Self::now(AuditEventKind::DerivationFailed {
            message_id,
            attempt,
            position: position.into(),
            key,
            stage,
            retryable,
            error: error.into(),
        })
    }

    pub fn message_parked(
        message_id: Uuid,
        attempt: u32,
        reason: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::now(AuditEventKind::MessageParked {
            message_id,
            attempt,
            reason: reason.into(),
            body: body.into(),
        })
    }
}
