//! HTTP surface exposed to the desktop UI shell (spec section 6). Thin:
//! every handler validates its input, delegates to `DownloadManager`/
//! `JobStore`/`RoadmapCache`, and maps `CoreError` to a status code.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::events::EventBus;
use crate::extractor::{ExtractorClient, is_instagram_host};
use crate::job_store::JobStore;
use crate::manager::DownloadManager;
use crate::models::{DownloadOptions, Job, VideoInfo};
use crate::rate_limiter::{self, PerEndpointLimiter};
use crate::roadmap::RoadmapCache;

#[derive(Clone)]
pub struct HTTPHandlerState {
    pub manager: DownloadManager,
    pub store: JobStore,
    pub roadmap: std::sync::Arc<RoadmapCache>,
    pub extractor: std::sync::Arc<ExtractorClient>,
    pub limiter: std::sync::Arc<PerEndpointLimiter>,
    pub bus: EventBus,
}

impl HTTPHandlerState {
    #[must_use]
    pub fn new(
        manager: DownloadManager,
        store: JobStore,
        roadmap: std::sync::Arc<RoadmapCache>,
        extractor: std::sync::Arc<ExtractorClient>,
        limiter: std::sync::Arc<PerEndpointLimiter>,
        bus: EventBus,
    ) -> Self {
        Self { manager, store, roadmap, extractor, limiter, bus }
    }
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::InvalidInput(_) | CoreError::Unsupported(_) => StatusCode::BAD_REQUEST,
        CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Cancelled => StatusCode::CONFLICT,
        CoreError::Storage(_) | CoreError::Network(_) | CoreError::Decode(_) | CoreError::Io(_) | CoreError::ExternalTool(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn error_response(err: CoreError) -> (StatusCode, Json<ErrorBody>) {
    let status = status_for(&err);
    (status, Json(ErrorBody { error: err.to_string() }))
}

#[derive(Serialize)]
pub struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
pub struct PostDownloadsBody {
    url: String,
    #[serde(default)]
    options: DownloadOptions,
}

/// `POST /downloads` — enqueue a URL (spec section 4.7/6).
pub async fn post_downloads(
    State(state): State<HTTPHandlerState>,
    Json(body): Json<PostDownloadsBody>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorBody>)> {
    state
        .manager
        .enqueue(&body.url, body.options)
        .await
        .map(Json)
        .map_err(error_response)
}

/// `POST /downloads/{id}/cancel` — idempotent cancellation (spec section 5).
pub async fn post_downloads_cancel(
    State(state): State<HTTPHandlerState>,
    Path(id): Path<uuid::Uuid>,
) -> StatusCode {
    state.manager.cancel(id).await;
    StatusCode::ACCEPTED
}

/// `GET /downloads/queue` — all non-terminal jobs (spec section 6).
pub async fn get_downloads_queue(
    State(state): State<HTTPHandlerState>,
) -> Result<Json<Vec<Job>>, (StatusCode, Json<ErrorBody>)> {
    state.store.get_queue().await.map(Json).map_err(error_response)
}

/// `GET /downloads/pending` — jobs not yet picked up by a worker.
pub async fn get_downloads_pending(
    State(state): State<HTTPHandlerState>,
) -> Result<Json<Vec<Job>>, (StatusCode, Json<ErrorBody>)> {
    state.store.get_pending().await.map(Json).map_err(error_response)
}

/// `GET /downloads/active` — jobs currently downloading or merging.
pub async fn get_downloads_active(
    State(state): State<HTTPHandlerState>,
) -> Result<Json<Vec<Job>>, (StatusCode, Json<ErrorBody>)> {
    state.store.get_active().await.map(Json).map_err(error_response)
}

/// `DELETE /downloads/{id}` — remove a job row outright (e.g. dismissing a
/// failed entry from history; spec section 6).
pub async fn delete_downloads(
    State(state): State<HTTPHandlerState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    state
        .store
        .delete(id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    100
}

/// `GET /downloads/history` — terminal jobs, most recent first.
pub async fn get_downloads_history(
    State(state): State<HTTPHandlerState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Job>>, (StatusCode, Json<ErrorBody>)> {
    state
        .store
        .get_history(query.limit)
        .await
        .map(Json)
        .map_err(error_response)
}

/// `DELETE /downloads/history` — clears all terminal rows.
pub async fn delete_downloads_history(
    State(state): State<HTTPHandlerState>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    state
        .store
        .clear_history()
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

#[derive(Deserialize)]
pub struct RoadmapQuery {
    #[serde(default = "default_language")]
    lang: String,
}

fn default_language() -> String {
    "en-US".to_string()
}

/// `GET /roadmap` — cached roadmap items, refreshed in the background (spec
/// section 4.8).
pub async fn get_roadmap(
    State(state): State<HTTPHandlerState>,
    Query(query): Query<RoadmapQuery>,
) -> Result<Json<Vec<crate::models::RoadmapItem>>, (StatusCode, Json<ErrorBody>)> {
    state
        .roadmap
        .get(&query.lang)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Deserialize)]
pub struct UrlBody {
    url: String,
}

/// `POST /videos/info` — metadata probe ahead of enqueueing (spec section
/// 4.5). Not itself cancellable through this surface; a caller that wants to
/// abort simply lets the HTTP connection drop.
pub async fn post_videos_info(
    State(state): State<HTTPHandlerState>,
    Json(body): Json<UrlBody>,
) -> Result<Json<VideoInfo>, (StatusCode, Json<ErrorBody>)> {
    let token = tokio_util::sync::CancellationToken::new();
    wait_on_info_buckets(&state, &token, &body.url).await.map_err(error_response)?;
    state
        .extractor
        .get_info(&token, &body.url)
        .await
        .map(Json)
        .map_err(error_response)
}

/// `POST /playlists/info` — expands a playlist URL into its member videos.
pub async fn post_playlists_info(
    State(state): State<HTTPHandlerState>,
    Json(body): Json<UrlBody>,
) -> Result<Json<Vec<VideoInfo>>, (StatusCode, Json<ErrorBody>)> {
    let token = tokio_util::sync::CancellationToken::new();
    wait_on_info_buckets(&state, &token, &body.url).await.map_err(error_response)?;
    state
        .extractor
        .get_playlist_info(&token, &body.url)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Shared rate-limit wait for the metadata-probe endpoints: always the
/// `video_info` bucket, plus the tighter `instagram` bucket for that host
/// (spec section 4.1).
async fn wait_on_info_buckets(
    state: &HTTPHandlerState,
    token: &tokio_util::sync::CancellationToken,
    url: &str,
) -> Result<(), CoreError> {
    state
        .limiter
        .bucket("video_info", rate_limiter::VIDEO_INFO)
        .await
        .wait(token)
        .await?;
    if is_instagram_host(url) {
        state
            .limiter
            .bucket("instagram", rate_limiter::INSTAGRAM)
            .await
            .wait(token)
            .await?;
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct UpdateBody {
    #[serde(default = "default_update_channel")]
    channel: String,
}

fn default_update_channel() -> String {
    "stable".to_string()
}

/// `POST /ytdlp/update` — runs the extractor's self-update.
pub async fn post_ytdlp_update(
    State(state): State<HTTPHandlerState>,
    Json(body): Json<UpdateBody>,
) -> Result<String, (StatusCode, Json<ErrorBody>)> {
    let token = tokio_util::sync::CancellationToken::new();
    state
        .extractor
        .update(&token, &body.channel)
        .await
        .map_err(error_response)
}

/// `GET /events` — the UI's only coupling to the core: a server-sent-events
/// stream of every `EventBus` emission from this point forward.
pub async fn get_events(
    State(state): State<HTTPHandlerState>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let stream = tokio_stream::wrappers::BroadcastStream::new(state.bus.subscribe())
        .filter_map(|item| async move { item.ok() })
        .map(|event| {
            Ok(SseEvent::default()
                .event(event.name.as_str())
                .json_data(event.payload)
                .unwrap_or_else(|_| SseEvent::default().event(event.name.as_str())))
        });
    Sse::new(stream)
}
