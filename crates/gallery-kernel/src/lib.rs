//! Gallery kernel: image ingestion, upload authorization and thumbnail
//! derivation on top of the `gallery-db` stores.
//!
//! The kernel owns no durable state itself. Metadata lives in [`Database`],
//! bytes live behind an [`ObjectStorage`](gallery_db::ObjectStorage) and store
//! completion events travel over a [`NotificationRelay`] to the
//! [`DerivationWorker`].

mod audit;
pub mod connections;
pub mod events;
pub mod ingest;
pub mod relay;
pub mod upload;
pub mod worker;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use gallery_db::{
    storage::validate_component, Database, GroupRecord, ImageRecord, NewImage, RecordError,
    SharedObjectStorage, StorageError,
};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use audit::{AuditEvent, AuditLogWriter};
use connections::ConnectionRegistry;
use events::{store_notification, wrap_in_envelope, StoreEvent};
use ingest::AttributePolicy;
use relay::{NotificationRelay, RelayError};
use upload::{UploadCredential, UploadError, UploadSigner};
use worker::{DerivationWorker, ThumbnailPolicy};

pub use audit::{verify_signed_line, AuditConfig};

pub const DEFAULT_IMAGES_BUCKET: &str = "images";
pub const DEFAULT_THUMBNAILS_BUCKET: &str = "thumbnails";
pub const DEFAULT_UPLOAD_EXPIRATION: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct GalleryConfig {
    pub images_bucket: String,
    pub thumbnails_bucket: String,
    /// Externally reachable base URL; image and upload URLs are built from it.
    pub public_base_url: String,
    pub upload_expiration: Duration,
    pub upload_secret: Vec<u8>,
    pub attributes: AttributePolicy,
    pub thumbnail: ThumbnailPolicy,
    pub audit: AuditConfig,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            images_bucket: DEFAULT_IMAGES_BUCKET.to_string(),
            thumbnails_bucket: DEFAULT_THUMBNAILS_BUCKET.to_string(),
            public_base_url: "http://127.0.0.1:8080".to_string(),
            upload_expiration: DEFAULT_UPLOAD_EXPIRATION,
            upload_secret: Vec::new(),
            attributes: AttributePolicy::default(),
            thumbnail: ThumbnailPolicy::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl std::fmt::Debug for GalleryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GalleryConfig")
            .field("images_bucket", &self.images_bucket)
            .field("thumbnails_bucket", &self.thumbnails_bucket)
            .field("public_base_url", &self.public_base_url)
            .field("upload_expiration", &self.upload_expiration)
            .field("attributes", &self.attributes)
            .field("thumbnail", &self.thumbnail)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl GalleryConfig {
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            upload_secret: secret.into(),
            ..Self::default()
        }
    }

    /// Public read URL of the original stored under `image_id`.
    pub fn image_url(&self, image_id: Uuid) -> String {
        format!(
            "{}/objects/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            self.images_bucket,
            image_id
        )
    }
}

/// Result of [`GalleryKernel::create_image`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedImage {
    pub new_item: ImageRecord,
    pub url: String,
    #[serde(skip)]
    pub credential: UploadCredential,
}

/// High-level API shared by the HTTP surface and the tests.
#[derive(Clone)]
pub struct GalleryKernel {
    db: Database,
    storage: SharedObjectStorage,
    relay: NotificationRelay,
    signer: UploadSigner,
    config: Arc<GalleryConfig>,
    audit: Option<Arc<AuditLogWriter>>,
}

impl GalleryKernel {
    pub fn new(
        db: Database,
        storage: SharedObjectStorage,
        relay: NotificationRelay,
        config: GalleryConfig,
    ) -> Result<Self, KernelError> {
        for bucket in [&config.images_bucket, &config.thumbnails_bucket] {
            validate_component(bucket)
                .map_err(|_| KernelError::Config(format!("invalid bucket name '{bucket}'")))?;
        }
        if config.images_bucket == config.thumbnails_bucket {
            return Err(KernelError::Config(
                "images and thumbnails must live in different buckets".into(),
            ));
        }

        let signer = UploadSigner::new(
            config.upload_secret.clone(),
            config.public_base_url.clone(),
            config.images_bucket.clone(),
            config.upload_expiration,
        )
        .map_err(|err| KernelError::Config(err.to_string()))?;

        let audit = if config.audit.enabled {
            match AuditLogWriter::try_new(&config.audit) {
                Ok(writer) => Some(Arc::new(writer)),
                Err(err) => {
                    warn!(error = %err, "failed to initialize audit log writer; disabling audits");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            db,
            storage,
            relay,
            signer,
            config: Arc::new(config),
            audit,
        })
    }

    pub fn config(&self) -> &GalleryConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }

    pub fn connections(&self) -> ConnectionRegistry {
        ConnectionRegistry::new(self.db.clone())
    }

    /// Builds a worker consuming this kernel's relay.
    pub fn derivation_worker(&self) -> DerivationWorker {
        DerivationWorker::new(
            self.storage.clone(),
            self.relay.clone(),
            self.config.images_bucket.clone(),
            self.config.thumbnails_bucket.clone(),
            self.config.thumbnail.clone(),
        )
        .with_audit(self.audit.clone())
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Some(writer) = self.audit.clone() {
            if let Err(err) = writer.append(&event).await {
                warn!(error = %err, "failed to append audit log entry");
            }
        }
    }

    /// Registers a new image under `group_id` and returns the record together
    /// with a write credential for its original.
    #[instrument(skip(self, body), fields(body_len = body.len()))]
    pub async fn create_image(
        &self,
        group_id: &str,
        body: &[u8],
    ) -> Result<CreatedImage, KernelError> {
        if !self.db.group_exists(group_id).await? {
            return Err(KernelError::GroupNotFound(group_id.to_string()));
        }

        let filtered = self.config.attributes.filter(parse_image_body(body)?);
        if !filtered.dropped.is_empty() {
            debug!(dropped = ?filtered.dropped, "ignoring caller attributes");
        }

        let image_id = Uuid::new_v4();
        let record = self
            .db
            .create_image(NewImage {
                group_id: group_id.to_string(),
                image_id,
                timestamp: Utc::now(),
                image_url: self.config.image_url(image_id),
                attributes: filtered.kept,
            })
            .await?;

        let credential = self.signer.issue(&image_id.to_string())?;

        info!(%image_id, group_id, "image registered");
        self.record_audit(AuditEvent::image_created(group_id, image_id))
            .await;

        Ok(CreatedImage {
            url: credential.url.clone(),
            new_item: record,
            credential,
        })
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupRecord>, KernelError> {
        Ok(self.db.list_groups().await?)
    }

    /// Newest first.
    pub async fn list_images(&self, group_id: &str) -> Result<Vec<ImageRecord>, KernelError> {
        if !self.db.group_exists(group_id).await? {
            return Err(KernelError::GroupNotFound(group_id.to_string()));
        }
        Ok(self.db.list_images(group_id).await?)
    }

    pub async fn get_image(&self, image_id: Uuid) -> Result<ImageRecord, KernelError> {
        self.db
            .fetch_image(image_id)
            .await?
            .ok_or(KernelError::ImageNotFound(image_id))
    }

    /// Object store front door: checks the credential, writes the original and
    /// publishes its completion event.
    #[instrument(skip(self, signature, bytes), fields(size = bytes.len()))]
    pub async fn accept_upload(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        bytes: Vec<u8>,
    ) -> Result<StoreEvent, KernelError> {
        self.signer.verify(bucket, key, expires, signature)?;
        if bytes.is_empty() {
            return Err(KernelError::MalformedInput("upload body is empty".into()));
        }

        let size = bytes.len() as u64;
        self.storage.put_object(bucket, key, bytes).await?;

        let event = StoreEvent::object_created(bucket, key, size);
        let notification = wrap_in_envelope(&store_notification(std::slice::from_ref(&event)));
        let message = self.relay.publish(notification.to_string()).await?;

        info!(bucket, key, size, message_id = %message.id, "upload stored");
        self.record_audit(AuditEvent::upload_accepted(bucket, key, size, message.id))
            .await;
        Ok(event)
    }

    /// Reads an original or a thumbnail. Other buckets do not exist publicly.
    pub async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, KernelError> {
        if bucket != self.config.images_bucket && bucket != self.config.thumbnails_bucket {
            return Err(KernelError::Object(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }));
        }
        Ok(self.storage.get_object(bucket, key).await?)
    }
}

fn parse_image_body(body: &[u8]) -> Result<Map<String, Value>, KernelError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(KernelError::MalformedInput(
            "request body must be a JSON object".into(),
        )),
        Err(err) => Err(KernelError::MalformedInput(format!(
            "request body is not valid JSON: {err}"
        ))),
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Storage(anyhow::Error),
    #[error(transparent)]
    Record(RecordError),
    #[error("Group does not exist")]
    GroupNotFound(String),
    #[error("image {0} not found")]
    ImageNotFound(Uuid),
    #[error("{0}")]
    MalformedInput(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Object(#[from] StorageError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<anyhow::Error> for KernelError {
    fn from(value: anyhow::Error) -> Self {
        match value.downcast::<RecordError>() {
            Ok(record_err) => KernelError::Record(record_err),
            Err(other) => KernelError::Storage(other),
        }
    }
}
