//! The coordinator's RPC surface: worker registration and work handout,
//! byte streams in both directions, progress/report ingestion, the
//! operator admin surface, and the live event socket.

use crate::coordinator::transfer::{self, UploadProgress};
use crate::coordinator::Coordinator;
use crate::error::CrucibleError;
use crate::protocol::{
    Ack, HeartbeatRequest, ProgressReport, RegisterRequest, RegisterResponse, ReportRequest,
    ResultResponse, UploadOffset,
};
use crate::store::FileStatus;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{error, info};

const STATUS_TOP_N: i64 = 50;

pub async fn serve(coordinator: Arc<Coordinator>) -> crate::error::Result<()> {
    let addr = coordinator.config.server.listen.clone();

    let app = Router::new()
        .route("/workers/register", post(register))
        .route("/workers/:id/heartbeat", post(heartbeat))
        .route("/workers/:id/next", post(next_work))
        .route("/files/:id/bytes", get(download_bytes))
        .route("/files/:id/result/begin", post(begin_result))
        .route("/files/:id/result/:upload_id", post(upload_result))
        .route("/files/:id/progress", post(progress))
        .route("/files/:id/report", post(report))
        .route("/status", get(status))
        .route("/events", get(events_socket))
        .route("/admin/scan", post(admin_scan))
        .route("/admin/files/:id/reset", post(admin_reset))
        .route("/admin/files/:id/retry", post(admin_reset))
        .route("/admin/files/:id/skip", post(admin_skip))
        .route("/admin/files/:id/delete", post(admin_delete))
        .route("/admin/files/:id/abort", post(admin_abort))
        .route("/admin/files/:id/priority", post(admin_priority))
        .route("/admin/files/:id/pin", post(admin_pin))
        .route("/admin/files/reset_failed", post(admin_bulk_reset_failed))
        .route(
            "/admin/files/delete_completed",
            post(admin_bulk_delete_completed),
        )
        .route("/admin/workers/:id/fade_out", post(admin_fade_out))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(coordinator);

    info!("Coordinator listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Error envelope: lease conflicts are 409, unknown ids are 404, the rest
/// is a 500 with the message preserved for the caller's logs.
struct ApiError(CrucibleError);

impl From<CrucibleError> for ApiError {
    fn from(e: CrucibleError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CrucibleError::StaleLease { .. } => StatusCode::CONFLICT,
            CrucibleError::UnknownWorker(_) | CrucibleError::NotFound(_) => StatusCode::NOT_FOUND,
            CrucibleError::Transfer(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn register(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    coordinator.registry.register(
        &req.worker_id,
        &req.display_name,
        &req.hostname,
        &req.version,
        req.capabilities,
        &coordinator.events,
    );
    info!(
        "Worker {} registered ({} @ {})",
        req.worker_id, req.display_name, req.hostname
    );
    Json(RegisterResponse {
        accepted: true,
        config_digest: coordinator.config.cluster.digest(),
        cluster_config: coordinator.config.cluster.clone(),
    })
}

async fn heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Path(worker_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Response> {
    match coordinator.registry.heartbeat(&worker_id, &req) {
        Some(resp) => Ok(Json(resp).into_response()),
        // Unknown after a coordinator restart: the worker must re-register.
        None => Err(CrucibleError::UnknownWorker(worker_id).into()),
    }
}

async fn next_work(
    State(coordinator): State<Arc<Coordinator>>,
    Path(worker_id): Path<String>,
) -> ApiResult<Response> {
    if !coordinator.registry.is_known(&worker_id) {
        return Err(CrucibleError::UnknownWorker(worker_id).into());
    }
    let next = coordinator.scheduler.next_for(&worker_id).await?;
    Ok(Json(next).into_response())
}

#[derive(Debug, Deserialize)]
struct OffsetQuery {
    #[serde(default)]
    offset: u64,
}

async fn download_bytes(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Query(query): Query<OffsetQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let lease = headers
        .get("x-lease-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let record = coordinator
        .store
        .get_file(file_id)
        .await?
        .ok_or(CrucibleError::StaleLease { file_id })?;

    let live = matches!(record.status, FileStatus::Assigned | FileStatus::Processing);
    if !live || record.lease_token.as_deref() != Some(lease.as_str()) {
        return Err(CrucibleError::StaleLease { file_id }.into());
    }

    let hash = match coordinator.hashes.get(file_id) {
        Some(hash) => hash,
        None => transfer::hash_file(std::path::Path::new(&record.path))
            .await
            .map_err(CrucibleError::Io)?,
    };

    let (file, remaining) = transfer::open_ranged(std::path::Path::new(&record.path), query.offset)
        .await
        .map_err(CrucibleError::Io)?;

    let stream = ReaderStream::new(file);
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, remaining.into());
    response.headers_mut().insert(
        "x-content-hash",
        hash.parse().unwrap_or(header::HeaderValue::from_static("")),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct BeginUpload {
    lease_token: String,
    output_size: u64,
    content_hash: String,
}

async fn begin_result(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Json(req): Json<BeginUpload>,
) -> ApiResult<Json<UploadOffset>> {
    let record = coordinator
        .store
        .get_file(file_id)
        .await?
        .ok_or(CrucibleError::StaleLease { file_id })?;

    if record.lease_token.as_deref() != Some(req.lease_token.as_str()) {
        return Err(CrucibleError::StaleLease { file_id }.into());
    }

    let (upload_id, offset) = coordinator
        .uploads
        .begin(
            file_id,
            &req.lease_token,
            std::path::Path::new(&record.path),
            req.output_size,
            &req.content_hash,
        )
        .await?;

    Ok(Json(UploadOffset { upload_id, offset }))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UploadReply {
    Progress(UploadOffset),
    Done(ResultResponse),
}

async fn upload_result(
    State(coordinator): State<Arc<Coordinator>>,
    Path((_file_id, upload_id)): Path<(i64, String)>,
    Query(query): Query<OffsetQuery>,
    body: Body,
) -> ApiResult<Json<UploadReply>> {
    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(stream);

    let progress = coordinator
        .uploads
        .store_chunk(&upload_id, query.offset, reader)
        .await?;

    match progress {
        UploadProgress::Incomplete { offset } => Ok(Json(UploadReply::Progress(UploadOffset {
            upload_id,
            offset,
        }))),
        UploadProgress::Complete(finished) => {
            let file_id = finished.file_id;
            let result = coordinator.lifecycle.complete_upload(finished).await?;
            coordinator.hashes.remove(file_id);
            Ok(Json(UploadReply::Done(result)))
        }
    }
}

async fn progress(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Json(report): Json<ProgressReport>,
) -> ApiResult<Json<Ack>> {
    coordinator.lifecycle.handle_progress(file_id, &report).await?;
    Ok(Json(Ack { ok: true }))
}

async fn report(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Json(req): Json<ReportRequest>,
) -> ApiResult<Json<Ack>> {
    coordinator
        .lifecycle
        .handle_report(file_id, &req.lease_token, &req.outcome)
        .await?;
    Ok(Json(Ack { ok: true }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    stats: crate::store::QueueStats,
    workers: Vec<crate::coordinator::registry::WorkerView>,
    files: Vec<crate::store::FileRecord>,
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> ApiResult<Json<StatusResponse>> {
    let snapshot = coordinator.store.snapshot_for_ui(STATUS_TOP_N).await?;
    Ok(Json(StatusResponse {
        stats: snapshot.stats,
        workers: coordinator.registry.views(),
        files: snapshot.files,
    }))
}

/// Subscribers get a consistent snapshot first, then the live stream.
/// Falling more than the backlog behind closes the socket; the client
/// resubscribes and gets a fresh snapshot.
async fn events_socket(
    State(coordinator): State<Arc<Coordinator>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, coordinator))
}

async fn handle_events_socket(mut socket: WebSocket, coordinator: Arc<Coordinator>) {
    // Subscribe before snapshotting so nothing falls into the gap.
    let mut rx = BroadcastStream::new(coordinator.events.subscribe());

    let snapshot = match coordinator.store.snapshot_for_ui(STATUS_TOP_N).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Snapshot for event subscriber failed: {}", e);
            return;
        }
    };
    let initial = serde_json::json!({
        "type": "snapshot",
        "data": {
            "stats": snapshot.stats,
            "files": snapshot.files,
            "workers": coordinator.registry.views(),
        }
    });
    if socket
        .send(Message::Text(initial.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = rx.next() => {
                match event {
                    Some(Ok(event)) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        info!("Event subscriber lagged by {}; disconnecting", n);
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn admin_scan(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<Json<crate::scanner::ScanReport>> {
    let report = coordinator.scan().await?;
    Ok(Json(report))
}

async fn updated_record(
    coordinator: &Coordinator,
    file_id: i64,
) -> ApiResult<Json<crate::store::FileRecord>> {
    coordinator
        .store
        .get_file(file_id)
        .await?
        .map(Json)
        .ok_or_else(|| CrucibleError::NotFound(format!("file {}", file_id)).into())
}

async fn admin_reset(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<crate::store::FileRecord>> {
    coordinator.lifecycle.operator_reset(file_id).await?;
    updated_record(&coordinator, file_id).await
}

async fn admin_skip(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<crate::store::FileRecord>> {
    coordinator.lifecycle.operator_skip(file_id).await?;
    updated_record(&coordinator, file_id).await
}

async fn admin_delete(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<Ack>> {
    let done = coordinator.lifecycle.operator_delete(file_id).await?;
    Ok(Json(Ack { ok: done }))
}

async fn admin_abort(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
) -> ApiResult<Json<Ack>> {
    let delivered = coordinator.lifecycle.abort(file_id).await?;
    Ok(Json(Ack { ok: delivered }))
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: i32,
}

async fn admin_priority(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Json(body): Json<PriorityBody>,
) -> ApiResult<Json<crate::store::FileRecord>> {
    coordinator.store.set_priority(file_id, body.priority).await?;
    updated_record(&coordinator, file_id).await
}

#[derive(Debug, Deserialize)]
struct PinBody {
    worker_id: Option<String>,
}

async fn admin_pin(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<i64>,
    Json(body): Json<PinBody>,
) -> ApiResult<Json<crate::store::FileRecord>> {
    coordinator
        .store
        .set_preferred_worker(file_id, body.worker_id.as_deref())
        .await?;
    updated_record(&coordinator, file_id).await
}

#[derive(Debug, Serialize)]
struct BulkResult {
    affected: u64,
}

async fn admin_bulk_reset_failed(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<Json<BulkResult>> {
    let affected = coordinator.store.bulk_reset_failed().await?;
    Ok(Json(BulkResult { affected }))
}

async fn admin_bulk_delete_completed(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<Json<BulkResult>> {
    let affected = coordinator.store.bulk_delete_completed().await?;
    Ok(Json(BulkResult { affected }))
}

#[derive(Debug, Deserialize)]
struct FadeOutBody {
    fade_out: bool,
}

#[derive(Debug, Serialize)]
struct FadeOutResponse {
    fade_out: bool,
}

async fn admin_fade_out(
    State(coordinator): State<Arc<Coordinator>>,
    Path(worker_id): Path<String>,
    Json(body): Json<FadeOutBody>,
) -> ApiResult<Json<FadeOutResponse>> {
    match coordinator
        .registry
        .set_fade_out(&worker_id, body.fade_out, &coordinator.events)
    {
        Some(fade_out) => Ok(Json(FadeOutResponse { fade_out })),
        None => Err(CrucibleError::UnknownWorker(worker_id).into()),
    }
}
