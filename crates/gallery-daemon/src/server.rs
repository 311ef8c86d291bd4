use std::{env, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gallery_db::{
    Database, GroupRecord, ImageRecord, LocalObjectStore, NewGroup, RecordError,
    SharedObjectStorage, StorageError, WorkerRegistry,
};
use gallery_kernel::{
    connections::ConnectionRegistry,
    ingest::AttributePolicy,
    relay::{NotificationRelay, DEFAULT_DEAD_LETTER_RETENTION_DAYS},
    upload::UploadError, worker::ThumbnailPolicy, AuditConfig, GalleryConfig, GalleryKernel,
    KernelError, DEFAULT_IMAGES_BUCKET, DEFAULT_THUMBNAILS_BUCKET,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;
    let relay = prepare_database(&db, &config).await?;

    let storage: SharedObjectStorage = Arc::new(LocalObjectStore::new(config.storage_root.clone()));
    let kernel = GalleryKernel::new(db.clone(), storage, relay.clone(), config.gallery.clone())
        .context("initializing gallery kernel")?;

    let workers = WorkerRegistry::default();
    workers.spawn(Arc::new(kernel.derivation_worker()));

    let state = Arc::new(AppState {
        kernel,
        max_upload_bytes: config.max_upload_bytes,
    });
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        storage_root = %config.storage_root.display(),
        "gallery-daemon listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;

    relay.close();
    workers
        .wait_all()
        .await
        .context("derivation worker failed")?;
    if let Err(err) = db.clear_connections().await {
        error!(error = %err, "failed to clear connections on shutdown");
    }
    info!("gallery-daemon stopped");
    Ok(())
}

/// Seeds groups, forgets connections left by a previous process and opens the
/// relay, which resumes whatever that process left undelivered.
async fn prepare_database(db: &Database, config: &AppConfig) -> Result<NotificationRelay> {
    for group in &config.seed_groups {
        db.put_group(NewGroup::with_id(group))
            .await
            .with_context(|| format!("failed to seed group '{group}'"))?;
    }

    let stale = db
        .clear_connections()
        .await
        .context("failed to clear stale connections")?;
    if stale > 0 {
        info!(stale, "stale connection records cleared");
    }

    let relay = NotificationRelay::open(db.clone(), config.relay_max_deliveries)
        .await
        .context("failed to open notification relay")?;
    relay
        .purge_dead_letters(ChronoDuration::days(DEFAULT_DEAD_LETTER_RETENTION_DAYS))
        .await
        .context("failed to purge expired dead letters")?;
    Ok(relay)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/groups", get(list_groups))
        .route(
            "/groups/:group_id/images",
            post(create_image).get(list_images),
        )
        .route("/images/:image_id", get(get_image))
        .route("/uploads/:bucket/:key", put(upload_object))
        .route("/objects/:bucket/:key", get(read_object))
        .route("/ws", get(realtime))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

struct AppState {
    kernel: GalleryKernel,
    max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub db_url: String,
    pub storage_root: PathBuf,
    pub relay_max_deliveries: u32,
    pub max_upload_bytes: usize,
    pub seed_groups: Vec<String>,
    pub gallery: GalleryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let listen_addr: SocketAddr = var("GALLERY_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid GALLERY_API_ADDR")?;

        let db_url = var("GALLERY_DB_DSN")
            .or_else(|| var("DATABASE_URL"))
            .ok_or_else(|| anyhow!("GALLERY_DB_DSN or DATABASE_URL must be configured"))?;

        let storage_root = var("GALLERY_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./.gallery_objects"));

        let upload_secret = var("GALLERY_UPLOAD_SECRET")
            .ok_or_else(|| anyhow!("GALLERY_UPLOAD_SECRET must be configured"))?
            .into_bytes();

        let public_base_url = var("GALLERY_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{listen_addr}"))
            .trim_end_matches('/')
            .to_string();

        let upload_expiration = Duration::from_secs(
            parse_var(&var, "GALLERY_SIGNED_URL_EXPIRATION")?.unwrap_or(300),
        );

        let mut thumbnail = ThumbnailPolicy::default();
        if let Some(width) = parse_var::<u32>(&var, "GALLERY_THUMBNAIL_WIDTH")? {
            if width == 0 {
                return Err(anyhow!("GALLERY_THUMBNAIL_WIDTH must be positive"));
            }
            thumbnail.target_width = width;
        }

        let attributes = var("GALLERY_IMAGE_ATTRIBUTES")
            .map(|list| AttributePolicy::from_list(&list))
            .unwrap_or_default();

        let audit_enabled = match var("GALLERY_AUDIT_LOG_ENABLED") {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| anyhow!("invalid boolean in GALLERY_AUDIT_LOG_ENABLED"))?,
            None => false,
        };
        let audit_hmac_key = var("GALLERY_AUDIT_LOG_HMAC_KEY")
            .map(|value| STANDARD.decode(value))
            .transpose()
            .context("invalid base64 in GALLERY_AUDIT_LOG_HMAC_KEY")?;
        let audit = AuditConfig {
            enabled: audit_enabled,
            log_path: var("GALLERY_AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| AuditConfig::default().log_path),
            hmac_key: audit_hmac_key,
        };

        let seed_groups = var("GALLERY_SEED_GROUPS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|group| !group.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            db_url,
            storage_root,
            relay_max_deliveries: parse_var(&var, "GALLERY_RELAY_MAX_DELIVERIES")?
                .unwrap_or(gallery_kernel::relay::DEFAULT_MAX_DELIVERIES),
            max_upload_bytes: parse_var(&var, "GALLERY_MAX_UPLOAD_BYTES")?
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            seed_groups,
            gallery: GalleryConfig {
                images_bucket: var("GALLERY_IMAGES_BUCKET")
                    .unwrap_or_else(|| DEFAULT_IMAGES_BUCKET.to_string()),
                thumbnails_bucket: var("GALLERY_THUMBNAILS_BUCKET")
                    .unwrap_or_else(|| DEFAULT_THUMBNAILS_BUCKET.to_string()),
                public_base_url,
                upload_expiration,
                upload_secret,
                attributes,
                thumbnail,
                audit,
            },
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    var(key)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|err| anyhow!("invalid {key}='{value}': {err}"))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/groups",
    responses((status = 200, description = "All groups", body = GroupListResponse))
)]
async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<GroupListResponse>, ApiError> {
    let groups = state.kernel.list_groups().await?;
    Ok(Json(GroupListResponse {
        items: groups.into_iter().map(GroupResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/groups/{groupId}/images",
    params(("groupId" = String, Path, description = "Group the image belongs to")),
    request_body(
        content = String,
        content_type = "application/json",
        description = "JSON object; only allow-listed attributes are kept"
    ),
    responses(
        (status = 201, description = "Image registered; upload the original to `url`", body = CreateImageResponse),
        (status = 400, description = "Body is not a JSON object", body = ErrorBody),
        (status = 404, description = "Group does not exist", body = ErrorBody)
    )
)]
async fn create_image(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<CreateImageResponse>), ApiError> {
    let body = body.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
    let created = state.kernel.create_image(&group_id, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateImageResponse {
            new_item: created.new_item.into(),
            url: created.url,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/groups/{groupId}/images",
    params(("groupId" = String, Path, description = "Group to list")),
    responses(
        (status = 200, description = "Images of the group, newest first", body = ImageListResponse),
        (status = 404, description = "Group does not exist", body = ErrorBody)
    )
)]
async fn list_images(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let images = state.kernel.list_images(&group_id).await?;
    Ok(Json(ImageListResponse {
        items: images.into_iter().map(ImageResponse::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/images/{imageId}",
    params(("imageId" = Uuid, Path, description = "Image identifier")),
    responses(
        (status = 200, description = "Image record", body = ImageResponse),
        (status = 404, description = "Image not found", body = ErrorBody)
    )
)]
async fn get_image(
    State(state): State<Arc<AppState>>,
    Path(image_id): Path<String>,
) -> Result<Json<ImageResponse>, ApiError> {
    let image_id = Uuid::parse_str(&image_id)
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, format!("image {image_id} not found")))?;
    let record = state.kernel.get_image(image_id).await?;
    Ok(Json(record.into()))
}

#[utoipa::path(
    put,
    path = "/uploads/{bucket}/{key}",
    params(
        ("bucket" = String, Path, description = "Bucket named in the credential"),
        ("key" = String, Path, description = "Object key named in the credential"),
        UploadQuery
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 204, description = "Original stored and derivation queued"),
        (status = 400, description = "Missing credential or empty body", body = ErrorBody),
        (status = 403, description = "Credential expired or signature mismatch", body = ErrorBody)
    )
)]
async fn upload_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    query: Result<Query<UploadQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let body = body.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
    state
        .kernel
        .accept_upload(&bucket, &key, query.expires, &query.signature, body.to_vec())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/objects/{bucket}/{key}",
    params(
        ("bucket" = String, Path, description = "Originals or thumbnails bucket"),
        ("key" = String, Path, description = "Object key")
    ),
    responses(
        (status = 200, description = "Object bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Object not found", body = ErrorBody)
    )
)]
async fn read_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let bytes = state.kernel.read_object(&bucket, &key).await?;
    let content_type = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[utoipa::path(
    get,
    path = "/ws",
    responses((status = 101, description = "WebSocket session registered as a live connection"))
)]
async fn realtime(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let registry = state.kernel.connections();
    ws.on_upgrade(move |socket| track_connection(socket, registry))
}

async fn track_connection(mut socket: WebSocket, registry: ConnectionRegistry) {
    let connection_id = Uuid::new_v4().to_string();
    if let Err(err) = registry.on_connect(&connection_id).await {
        error!(%connection_id, error = %err, "failed to register connection");
        return;
    }

    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%connection_id, error = %err, "websocket receive failed");
                break;
            }
        }
    }

    if let Err(err) = registry.on_disconnect(&connection_id).await {
        error!(%connection_id, error = %err, "failed to remove connection");
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct UploadQuery {
    /// Unix time after which the credential is rejected.
    expires: i64,
    /// URL-safe base64 HMAC over method, bucket, key and expiry.
    signature: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct GroupResponse {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<GroupRecord> for GroupResponse {
    fn from(record: GroupRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            description: record.description,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct GroupListResponse {
    items: Vec<GroupResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    group_id: String,
    image_id: Uuid,
    timestamp: DateTime<Utc>,
    image_url: String,
    /// Allow-listed caller attributes, inlined next to the fields above.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    attributes: Map<String, Value>,
}

impl From<ImageRecord> for ImageResponse {
    fn from(record: ImageRecord) -> Self {
        Self {
            group_id: record.group_id,
            image_id: record.image_id,
            timestamp: record.timestamp,
            image_url: record.image_url,
            attributes: record.attributes,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ImageListResponse {
    items: Vec<ImageResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateImageResponse {
    new_item: ImageResponse,
    url: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::GroupNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            KernelError::ImageNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            KernelError::MalformedInput(message) => ApiError::bad_request(message),
            KernelError::Upload(inner) => match inner {
                UploadError::Expired(_)
                | UploadError::InvalidSignature
                | UploadError::WrongBucket(_) => {
                    ApiError::new(StatusCode::FORBIDDEN, inner.to_string())
                }
                UploadError::InvalidKey(_) => ApiError::bad_request(inner.to_string()),
                UploadError::Misconfigured(_) => ApiError::internal(inner),
            },
            KernelError::Object(inner) => match inner {
                StorageError::NotFound { .. } => {
                    ApiError::new(StatusCode::NOT_FOUND, inner.to_string())
                }
                StorageError::InvalidKey(_) => ApiError::bad_request(inner.to_string()),
                StorageError::Io(..) | StorageError::Unavailable(_) => ApiError::internal(inner),
            },
            KernelError::Record(RecordError::DuplicateImage(id)) => {
                ApiError::internal(format!("image id {id} collided; retry the request"))
            }
            KernelError::Relay(inner) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, inner.to_string()),
            KernelError::Storage(inner) => ApiError::internal(inner),
            KernelError::Config(message) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Gallery Daemon API", version = "0.1.0"),
        paths(
            healthz,
            list_groups,
            create_image,
            list_images,
            get_image,
            upload_object,
            read_object,
            realtime
        ),
        components(schemas(
            GroupResponse,
            GroupListResponse,
            ImageResponse,
            ImageListResponse,
            CreateImageResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, io::Cursor};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use gallery_db::MemoryObjectStore;
    use gallery_kernel::relay::Settlement;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::json;
    use tower::Service;

    const BASE_URL: &str = "http://gallery.test";

    async fn setup_test_app() -> (GalleryKernel, Router) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.put_group(NewGroup {
            id: "g1",
            name: Some("Holidays"),
            description: None,
        })
        .await
        .unwrap();

        let relay = NotificationRelay::open(db.clone(), gallery_kernel::relay::DEFAULT_MAX_DELIVERIES)
            .await
            .unwrap();
        let kernel = GalleryKernel::new(
            db,
            Arc::new(MemoryObjectStore::new()),
            relay,
            GalleryConfig {
                public_base_url: BASE_URL.to_string(),
                ..GalleryConfig::with_secret(b"router-secret".to_vec())
            },
        )
        .unwrap();
        let state = Arc::new(AppState {
            kernel: kernel.clone(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        });
        (kernel, build_router(state))
    }

    async fn send(router: &mut Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.call(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn json_body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 90, 160])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn healthz_and_groups() {
        let (_, mut router) = setup_test_app().await;

        let (status, _) = send(&mut router, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&mut router, get("/groups")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["items"][0]["id"], "g1");
        assert_eq!(body["items"][0]["name"], "Holidays");
    }

    #[tokio::test]
    async fn create_image_returns_record_and_upload_url() {
        let (_, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            post_json(
                "/groups/g1/images",
                json!({ "caption": "hi", "imageId": "spoofed", "groupId": "other" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let body = json_body(&body);
        let item = &body["newItem"];
        let image_id = item["imageId"].as_str().unwrap();
        assert!(Uuid::parse_str(image_id).is_ok());
        assert_eq!(item["groupId"], "g1");
        assert_eq!(item["caption"], "hi");
        assert_eq!(
            item["imageUrl"],
            format!("{BASE_URL}/objects/images/{image_id}")
        );
        let url = body["url"].as_str().unwrap();
        assert!(url.starts_with(&format!("{BASE_URL}/uploads/images/{image_id}?expires=")));

        let (status, fetched) = send(&mut router, get(&format!("/images/{image_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&json_body(&fetched), item);
    }

    #[tokio::test]
    async fn create_image_errors_use_error_body() {
        let (kernel, mut router) = setup_test_app().await;

        let (status, body) = send(
            &mut router,
            post_json("/groups/missing/images", json!({ "caption": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&body), json!({ "error": "Group does not exist" }));

        let request = Request::builder()
            .method("POST")
            .uri("/groups/g1/images")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&mut router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(&body)["error"].is_string());

        assert_eq!(kernel.database().count_images().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lookups_for_unknown_ids_are_not_found() {
        let (_, mut router) = setup_test_app().await;

        let (status, _) = send(&mut router, get("/groups/missing/images")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&mut router, get(&format!("/images/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&mut router, get("/images/not-a-uuid")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&mut router, get("/objects/images/nothing-here")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_then_derive_serves_thumbnail() {
        let (kernel, mut router) = setup_test_app().await;

        let (_, body) = send(&mut router, post_json("/groups/g1/images", json!({}))).await;
        let body = json_body(&body);
        let image_id = body["newItem"]["imageId"].as_str().unwrap().to_string();
        let upload_uri = body["url"].as_str().unwrap().trim_start_matches(BASE_URL).to_string();

        let upload = Request::builder()
            .method("PUT")
            .uri(&upload_uri)
            .body(Body::from(png(300, 150)))
            .unwrap();
        let (status, _) = send(&mut router, upload).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, settlement) = kernel.derivation_worker().process_next().await.unwrap().unwrap();
        assert_eq!(settlement, Settlement::Acked);

        let response = router
            .call(get(&format!("/objects/thumbnails/{image_id}.jpeg")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let thumbnail = image::load_from_memory(&bytes).unwrap();
        assert_eq!((thumbnail.width(), thumbnail.height()), (150, 75));
    }

    #[tokio::test]
    async fn upload_with_bad_credentials_is_forbidden() {
        let (kernel, mut router) = setup_test_app().await;
        let (_, body) = send(&mut router, post_json("/groups/g1/images", json!({}))).await;
        let image_id = json_body(&body)["newItem"]["imageId"]
            .as_str()
            .unwrap()
            .to_string();

        let forged = Request::builder()
            .method("PUT")
            .uri(format!("/uploads/images/{image_id}?expires=9999999999&signature=AAAA"))
            .body(Body::from(png(4, 4)))
            .unwrap();
        let (status, body) = send(&mut router, forged).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(json_body(&body)["error"].is_string());

        let unsigned = Request::builder()
            .method("PUT")
            .uri(format!("/uploads/images/{image_id}"))
            .body(Body::from(png(4, 4)))
            .unwrap();
        let (status, body) = send(&mut router, unsigned).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(&body)["error"].is_string());

        assert!(kernel.relay().try_recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn websocket_route_requires_upgrade() {
        let (_, mut router) = setup_test_app().await;
        let (status, _) = send(&mut router, get("/ws")).await;
        assert!(status.is_client_error());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite::memory:"),
            ("GALLERY_UPLOAD_SECRET", "s3cret"),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.gallery.public_base_url, "http://127.0.0.1:8080");
        assert_eq!(config.gallery.images_bucket, "images");
        assert_eq!(config.gallery.thumbnails_bucket, "thumbnails");
        assert_eq!(config.gallery.upload_expiration, Duration::from_secs(300));
        assert_eq!(config.gallery.thumbnail.target_width, 150);
        assert_eq!(config.relay_max_deliveries, 5);
        assert!(!config.gallery.audit.enabled);
        assert!(config.seed_groups.is_empty());

        let env: HashMap<&str, &str> = HashMap::from([
            ("GALLERY_DB_DSN", "sqlite://gallery.db"),
            ("GALLERY_UPLOAD_SECRET", "s3cret"),
            ("GALLERY_PUBLIC_URL", "https://img.example/"),
            ("GALLERY_SIGNED_URL_EXPIRATION", "60"),
            ("GALLERY_THUMBNAIL_WIDTH", "200"),
            ("GALLERY_IMAGE_ATTRIBUTES", "title,rating"),
            ("GALLERY_SEED_GROUPS", "g1, g2,"),
            ("GALLERY_AUDIT_LOG_ENABLED", "yes"),
            ("GALLERY_AUDIT_LOG_HMAC_KEY", "a2V5"),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.db_url, "sqlite://gallery.db");
        assert_eq!(config.gallery.public_base_url, "https://img.example");
        assert_eq!(config.gallery.upload_expiration, Duration::from_secs(60));
        assert_eq!(config.gallery.thumbnail.target_width, 200);
        assert!(config.gallery.attributes.allows("rating"));
        assert!(!config.gallery.attributes.allows("caption"));
        assert_eq!(config.seed_groups, vec!["g1", "g2"]);
        assert!(config.gallery.audit.enabled);
        assert_eq!(config.gallery.audit.hmac_key.as_deref(), Some(&b"key"[..]));
    }

    #[test]
    fn config_rejects_missing_or_invalid_values() {
        let missing_secret: HashMap<&str, &str> = HashMap::from([("DATABASE_URL", "sqlite::memory:")]);
        assert!(AppConfig::from_lookup(|key| missing_secret.get(key).map(|v| v.to_string())).is_err());

        let missing_db: HashMap<&str, &str> = HashMap::from([("GALLERY_UPLOAD_SECRET", "s")]);
        assert!(AppConfig::from_lookup(|key| missing_db.get(key).map(|v| v.to_string())).is_err());

        let bad_width: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite::memory:"),
            ("GALLERY_UPLOAD_SECRET", "s"),
            ("GALLERY_THUMBNAIL_WIDTH", "wide"),
        ]);
        let err = AppConfig::from_lookup(|key| bad_width.get(key).map(|v| v.to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GALLERY_THUMBNAIL_WIDTH"));
    }

    #[tokio::test]
    async fn startup_forgets_connections_of_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.db");
        let db_url = format!("sqlite://{}", path.display());
        {
            let db = Database::connect(&db_url).await.unwrap();
            db.put_connection("left-over", Utc::now()).await.unwrap();
        }

        let env: HashMap<&str, &str> = HashMap::from([
            ("GALLERY_DB_DSN", db_url.as_str()),
            ("GALLERY_UPLOAD_SECRET", "s3cret"),
            ("GALLERY_SEED_GROUPS", "g1"),
            ("GALLERY_RELAY_MAX_DELIVERIES", "3"),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        let db = Database::connect(&config.db_url).await.unwrap();
        let relay = prepare_database(&db, &config).await.unwrap();

        assert!(db.fetch_connection("left-over").await.unwrap().is_none());
        assert!(db.list_connections().await.unwrap().is_empty());
        assert!(db.group_exists("g1").await.unwrap());
        assert_eq!(relay.max_deliveries(), 3);
    }

    #[test]
    fn openapi_lists_every_route() {
        let doc = docs::ApiDoc::openapi();
        for path in [
            "/healthz",
            "/groups",
            "/groups/{groupId}/images",
            "/images/{imageId}",
            "/uploads/{bucket}/{key}",
            "/objects/{bucket}/{key}",
            "/ws",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
