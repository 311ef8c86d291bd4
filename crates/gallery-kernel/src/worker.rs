//! Thumbnail derivation driven by relay messages.
//!
//! Each nested store event in a message is its own unit of work and moves
//! through `Received → Fetched → Resized → Stored`. Failures carry the stage
//! they reached. The thumbnail write is an overwrite keyed by
//! `original key + suffix`, so duplicate or concurrent deliveries converge on
//! the same stored bytes.

use std::{fmt, io::Cursor, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use gallery_db::{BackgroundWorker, SharedObjectStorage, StorageError};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use serde::Serialize;
use thiserror::Error;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogWriter};
use crate::events::{unwrap_work_items, EnvelopeError, StoreEvent, WorkItem};
use crate::relay::{NotificationRelay, RelayError, RelayMessage, Settlement};

pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 150;
pub const THUMBNAIL_SUFFIX: &str = ".jpeg";

const RELAY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailPolicy {
    pub target_width: u32,
    pub suffix: String,
}

impl Default for ThumbnailPolicy {
    fn default() -> Self {
        Self {
            target_width: DEFAULT_THUMBNAIL_WIDTH,
            suffix: THUMBNAIL_SUFFIX.to_string(),
        }
    }
}

impl ThumbnailPolicy {
    pub fn thumbnail_key(&self, original_key: &str) -> String {
        format!("{original_key}{}", self.suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationStage {
    Received,
    Fetched,
    Resized,
    Stored,
    Acknowledged,
}

impl DerivationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationStage::Received => "received",
            DerivationStage::Fetched => "fetched",
            DerivationStage::Resized => "resized",
            DerivationStage::Stored => "stored",
            DerivationStage::Acknowledged => "acknowledged",
        }
    }
}

impl fmt::Display for DerivationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("malformed relay record at {position}: {source}")]
    Envelope {
        position: String,
        #[source]
        source: EnvelopeError,
    },
    #[error("event for bucket '{bucket}' is not an original upload")]
    UnexpectedBucket { bucket: String },
    #[error("failed to fetch original {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("original {key} is not a decodable image: {reason}")]
    Decode { key: String, reason: String },
    #[error("failed to encode thumbnail for {key}: {reason}")]
    Encode { key: String, reason: String },
    #[error("resize task for {key} did not complete: {reason}")]
    Task {
        key: String,
        reason: String,
        panicked: bool,
    },
    #[error("failed to store thumbnail {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl DerivationError {
    /// Last stage the event reached before failing.
    pub fn stage(&self) -> DerivationStage {
        match self {
            DerivationError::Envelope { .. }
            | DerivationError::UnexpectedBucket { .. }
            | DerivationError::Fetch { .. } => DerivationStage::Received,
            DerivationError::Decode { .. }
            | DerivationError::Encode { .. }
            | DerivationError::Task { .. } => DerivationStage::Fetched,
            DerivationError::Store { .. } => DerivationStage::Resized,
        }
    }

    /// Whether redelivering the message could make this event succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DerivationError::Fetch { source, .. } | DerivationError::Store { source, .. } => {
                source.is_retryable()
            }
            DerivationError::Task { panicked, .. } => !panicked,
            DerivationError::Envelope { .. }
            | DerivationError::UnexpectedBucket { .. }
            | DerivationError::Decode { .. }
            | DerivationError::Encode { .. } => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThumbnailError {
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    Encode(String),
}

/// Encoded derivative plus its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// Height that keeps the aspect ratio at `target_width`, rounded, at least 1.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let width = u64::from(width.max(1));
    let scaled = (u64::from(height) * u64::from(target_width) + width / 2) / width;
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}

/// Output encoding follows the source: JPEG stays JPEG, everything else is PNG.
pub fn output_format(source: ImageFormat) -> ImageFormat {
    match source {
        ImageFormat::Jpeg => ImageFormat::Jpeg,
        _ => ImageFormat::Png,
    }
}

/// Decodes `bytes`, resizes to `target_width` with proportional height and
/// re-encodes. Pure and deterministic for identical input.
pub fn render_thumbnail(bytes: &[u8], target_width: u32) -> Result<Thumbnail, ThumbnailError> {
    let source_format =
        image::guess_format(bytes).map_err(|err| ThumbnailError::Decode(err.to_string()))?;
    let source = image::load_from_memory_with_format(bytes, source_format)
        .map_err(|err| ThumbnailError::Decode(err.to_string()))?;
    if source.width() == 0 || source.height() == 0 {
        return Err(ThumbnailError::Decode("image has no pixels".into()));
    }

    let width = target_width.max(1);
    let height = scaled_height(source.width(), source.height(), width);
    let resized = source.resize_exact(width, height, FilterType::Triangle);

    let format = output_format(source_format);
    let normalized = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(resized.to_rgb8()),
        _ if resized.color().has_alpha() => DynamicImage::ImageRgba8(resized.to_rgba8()),
        _ => DynamicImage::ImageRgb8(resized.to_rgb8()),
    };

    let mut encoded = Cursor::new(Vec::new());
    normalized
        .write_to(&mut encoded, format)
        .map_err(|err| ThumbnailError::Encode(err.to_string()))?;

    Ok(Thumbnail {
        bytes: encoded.into_inner(),
        width,
        height,
        format,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailWritten {
    pub original_key: String,
    pub thumbnail_key: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct EventOutcome {
    pub position: String,
    pub key: Option<String>,
    pub result: Result<ThumbnailWritten, DerivationError>,
}

#[derive(Debug)]
pub struct MessageOutcome {
    pub message_id: Uuid,
    pub attempt: u32,
    pub events: Vec<EventOutcome>,
}

/// What to tell the relay about a processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Retry(String),
    Reject(String),
}

impl MessageOutcome {
    pub fn stored(&self) -> impl Iterator<Item = &ThumbnailWritten> {
        self.events.iter().filter_map(|event| event.result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DerivationError> {
        self.events.iter().filter_map(|event| event.result.as_ref().err())
    }

    /// Any retryable failure asks for redelivery of the whole message; the
    /// events that already succeeded are overwritten with identical bytes.
    pub fn verdict(&self) -> Verdict {
        let retryable: Vec<String> = self
            .failures()
            .filter(|err| err.is_retryable())
            .map(ToString::to_string)
            .collect();
        if !retryable.is_empty() {
            return Verdict::Retry(retryable.join("; "));
        }

        let permanent: Vec<String> = self.failures().map(ToString::to_string).collect();
        if permanent.is_empty() {
            Verdict::Ack
        } else {
            Verdict::Reject(permanent.join("; "))
        }
    }
}

pub struct DerivationWorker {
    storage: SharedObjectStorage,
    relay: NotificationRelay,
    originals_bucket: String,
    thumbnails_bucket: String,
    policy: ThumbnailPolicy,
    audit: Option<Arc<AuditLogWriter>>,
}

impl DerivationWorker {
    pub fn new(
        storage: SharedObjectStorage,
        relay: NotificationRelay,
        originals_bucket: impl Into<String>,
        thumbnails_bucket: impl Into<String>,
        policy: ThumbnailPolicy,
    ) -> Self {
        Self {
            storage,
            relay,
            originals_bucket: originals_bucket.into(),
            thumbnails_bucket: thumbnails_bucket.into(),
            policy,
            audit: None,
        }
    }

    pub(crate) fn with_audit(mut self, audit: Option<Arc<AuditLogWriter>>) -> Self {
        self.audit = audit;
        self
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Some(writer) = self.audit.clone() {
            if let Err(err) = writer.append(&event).await {
                warn!(error = %err, "failed to append audit log entry");
            }
        }
    }

    /// Receives one message, processes every nested event and settles the
    /// delivery. Returns `None` once the relay is closed and drained.
    pub async fn process_next(&self) -> Result<Option<(MessageOutcome, Settlement)>, RelayError> {
        let Some(delivery) = self.relay.recv().await? else {
            return Ok(None);
        };
        let message = delivery.message().clone();
        let outcome = self.handle_message(&message).await;

        let settlement = match outcome.verdict() {
            Verdict::Ack => delivery.ack().await?,
            Verdict::Retry(reason) => delivery.nack(reason).await?,
            Verdict::Reject(reason) => delivery.reject(reason).await?,
        };

        match &settlement {
            Settlement::Acked => {
                debug!(message_id = %message.id, stage = %DerivationStage::Acknowledged, "relay message acknowledged");
            }
            Settlement::Requeued { next_attempt } => {
                info!(message_id = %message.id, next_attempt, "relay message will be redelivered");
            }
            Settlement::Parked { reason } => {
                self.record_audit(AuditEvent::message_parked(
                    message.id,
                    message.attempt,
                    reason.clone(),
                    message.body.clone(),
                ))
                .await;
            }
        }

        Ok(Some((outcome, settlement)))
    }

    /// Processes every work item of `message` independently.
    #[instrument(skip(self, message), fields(message_id = %message.id, attempt = message.attempt))]
    pub async fn handle_message(&self, message: &RelayMessage) -> MessageOutcome {
        let items = unwrap_work_items(&message.body);
        if items.is_empty() {
            warn!("relay message carried no store events");
        }

        let mut events = Vec::with_capacity(items.len());
        for WorkItem { position, event } in items {
            let (key, result) = match event {
                Ok(event) => (Some(event.key.clone()), self.process_event(&event).await),
                Err(source) => (
                    None,
                    Err(DerivationError::Envelope {
                        position: position.clone(),
                        source,
                    }),
                ),
            };

            match &result {
                Ok(written) => {
                    self.record_audit(AuditEvent::thumbnail_stored(
                        written.original_key.clone(),
                        written.thumbnail_key.clone(),
                        written.width,
                        written.height,
                    ))
                    .await;
                }
                Err(err) => {
                    error!(
                        %position,
                        key = key.as_deref().unwrap_or("-"),
                        stage = %err.stage(),
                        retryable = err.is_retryable(),
                        error = %err,
                        "derivation failed"
                    );
                    self.record_audit(AuditEvent::derivation_failed(
                        message.id,
                        message.attempt,
                        position.clone(),
                        key.clone(),
                        err.stage(),
                        err.is_retryable(),
                        err.to_string(),
                    ))
                    .await;
                }
            }

            events.push(EventOutcome {
                position,
                key,
                result,
            });
        }

        MessageOutcome {
            message_id: message.id,
            attempt: message.attempt,
            events,
        }
    }

    /// Fetches the original, renders the thumbnail and overwrites it in the
    /// thumbnail bucket.
    #[instrument(skip(self, event), fields(key = %event.key))]
    pub async fn process_event(&self, event: &StoreEvent) -> Result<ThumbnailWritten, DerivationError> {
        if event.bucket != self.originals_bucket {
            return Err(DerivationError::UnexpectedBucket {
                bucket: event.bucket.clone(),
            });
        }

        let original = self
            .storage
            .get_object(&self.originals_bucket, &event.key)
            .await
            .map_err(|source| DerivationError::Fetch {
                key: event.key.clone(),
                source,
            })?;
        debug!(stage = %DerivationStage::Fetched, size = original.len(), "original fetched");

        let target_width = self.policy.target_width;
        let thumbnail = spawn_blocking(move || render_thumbnail(&original, target_width))
            .await
            .map_err(|err| DerivationError::Task {
                key: event.key.clone(),
                reason: err.to_string(),
                panicked: err.is_panic(),
            })?
            .map_err(|err| match err {
                ThumbnailError::Decode(reason) => DerivationError::Decode {
                    key: event.key.clone(),
                    reason,
                },
                ThumbnailError::Encode(reason) => DerivationError::Encode {
                    key: event.key.clone(),
                    reason,
                },
            })?;
        debug!(
            stage = %DerivationStage::Resized,
            width = thumbnail.width,
            height = thumbnail.height,
            "thumbnail rendered"
        );

        let thumbnail_key = self.policy.thumbnail_key(&event.key);
        let size_bytes = thumbnail.bytes.len() as u64;
        self.storage
            .put_object(&self.thumbnails_bucket, &thumbnail_key, thumbnail.bytes)
            .await
            .map_err(|source| DerivationError::Store {
                key: thumbnail_key.clone(),
                source,
            })?;

        info!(
            stage = %DerivationStage::Stored,
            bucket = %self.thumbnails_bucket,
            thumbnail_key = %thumbnail_key,
            "thumbnail stored"
        );

        Ok(ThumbnailWritten {
            original_key: event.key.clone(),
            thumbnail_key,
            width: thumbnail.width,
            height: thumbnail.height,
            size_bytes,
        })
    }
}

#[async_trait]
impl BackgroundWorker for DerivationWorker {
    async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            originals = %self.originals_bucket,
            thumbnails = %self.thumbnails_bucket,
            target_width = self.policy.target_width,
            "derivation worker started"
        );
        loop {
            match self.process_next().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) if self.relay.is_closed() => return Err(err.into()),
                Err(err) => {
                    error!(error = %err, "relay unavailable; backing off");
                    tokio::time::sleep(RELAY_BACKOFF).await;
                }
            }
        }
        info!("relay closed; derivation worker exiting");
        Ok(())
    }
}
