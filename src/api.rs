use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::errors::StreamError;
use crate::mjpeg::{multipart_content_type, multipart_part, MjpegFrameReader};
use crate::session_manager::SessionManager;

#[derive(Debug, Serialize)]
pub struct ApiError {
    status: String,
    error: String,
    code: u16,
}

impl StreamError {
    fn status_code(&self) -> StatusCode {
        match self {
            StreamError::NotFound { .. } => StatusCode::NOT_FOUND,
            StreamError::SourceUnavailable { .. } | StreamError::Transcode { .. } => StatusCode::BAD_GATEWAY,
            StreamError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            StreamError::NotFound { message }
            | StreamError::SourceUnavailable { message }
            | StreamError::Transcode { message }
            | StreamError::Busy { message } => message.clone(),
            other => other.to_string(),
        };

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }

        let body = ApiError {
            status: "error".to_string(),
            error: message,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct FullStreamResponse {
    pub url: String,
    pub camera_id: String,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub reused: bool,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub camera_id: String,
    pub stopped: bool,
}

pub fn router(manager: SessionManager) -> Router {
    let videostream = Router::new()
        .route("/cameras", get(list_cameras))
        .route("/:camera_id/snapshot", get(snapshot))
        .route("/:camera_id/snapshot/stream", get(snapshot_stream))
        .route("/:camera_id/mjpeg", get(mjpeg_passthrough))
        .route("/:camera_id/full", get(start_full_stream).delete(stop_full_stream))
        .route("/:camera_id/status", get(recording_status))
        .route("/:camera_id/playlist.m3u8", get(playlist))
        .route("/:camera_id/segments/:segment", get(segment));

    Router::new()
        .nest("/api/videostream", videostream)
        .with_state(manager)
}

async fn list_cameras(State(manager): State<SessionManager>) -> Json<Vec<String>> {
    Json(manager.list_cameras())
}

async fn snapshot(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<Response, StreamError> {
    let snapshot = manager.get_snapshot(&camera_id).await?;
    trace!("Serving snapshot for camera '{}' captured at {}", camera_id, snapshot.captured_at);

    let mut response = Response::new(Body::from(snapshot.frame.clone()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&snapshot.captured_at.to_rfc3339()) {
        headers.insert("x-captured-at", value);
    }
    Ok(response)
}

fn multipart_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&multipart_content_type()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Pushes every refreshed snapshot to the viewer until it disconnects.
async fn snapshot_stream(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<Response, StreamError> {
    let updates = manager.subscribe_snapshots(&camera_id).await?;
    let current = manager.get_snapshot(&camera_id).await?;
    let first_captured_at = current.captured_at;

    let first = stream::iter([Ok::<_, Infallible>(multipart_part(&current.frame))]);
    let later = BroadcastStream::new(updates).filter_map(move |update| match update {
        Ok(snapshot) if snapshot.captured_at > first_captured_at => Some(Ok(multipart_part(&snapshot.frame))),
        Ok(_) => None,
        Err(lagged) => {
            trace!("Snapshot viewer lagging: {}", lagged);
            None
        }
    });

    Ok(multipart_response(Body::from_stream(first.chain(later))))
}

async fn mjpeg_passthrough(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<Response, StreamError> {
    let source = manager.open_source(&camera_id).await?;
    let reader = MjpegFrameReader::new(source);

    let frames = stream::unfold((reader, camera_id), |(mut reader, camera_id)| async move {
        match reader.next_frame().await {
            Ok(Some(frame)) => Some((Ok::<_, Infallible>(multipart_part(&frame)), (reader, camera_id))),
            Ok(None) => None,
            Err(e) => {
                warn!("MJPEG pass-through for camera '{}' ended: {}", camera_id, e);
                None
            }
        }
    });

    Ok(multipart_response(Body::from_stream(frames)))
}

async fn start_full_stream(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<Json<FullStreamResponse>, StreamError> {
    let locator = manager.start_recording(&camera_id).await?;
    Ok(Json(FullStreamResponse {
        url: locator.manifest_url,
        camera_id: locator.camera_id,
        job_id: locator.job_id,
        started_at: locator.started_at,
        reused: locator.reused,
    }))
}

async fn stop_full_stream(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<Json<StopResponse>, StreamError> {
    let stopped = manager.stop_recording(&camera_id).await?;
    Ok(Json(StopResponse { camera_id, stopped }))
}

async fn recording_status(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse, StreamError> {
    Ok(Json(manager.recording_status(&camera_id).await?))
}

async fn playlist(
    State(manager): State<SessionManager>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse, StreamError> {
    let playlist = manager.playlist(&camera_id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        playlist,
    ))
}

async fn segment(
    State(manager): State<SessionManager>,
    Path((camera_id, segment)): Path<(String, String)>,
) -> Result<impl IntoResponse, StreamError> {
    let sequence = segment
        .strip_suffix(".ts")
        .and_then(|sequence| sequence.parse::<u64>().ok())
        .ok_or_else(|| StreamError::not_found(format!("Segment '{}' not found", segment)))?;

    let data = manager.read_segment(&camera_id, sequence).await?;
    Ok(([(header::CONTENT_TYPE, "video/mp2t")], data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use crate::camera_registry::CameraRegistry;
    use crate::session_manager::RecordingSettings;
    use crate::snapshot_cache::SnapshotSettings;
    use crate::test_support::{frame_label, ScriptedFetcher, SlowFrameTranscoder};

    fn app(dir: &std::path::Path, frames_per_fetch: usize) -> (Router, SessionManager) {
        let registry = Arc::new(CameraRegistry::new([("cam1", "test://cam1"), ("cam2", "test://cam2")]).unwrap());
        let manager = SessionManager::new(
            registry,
            Arc::new(ScriptedFetcher::new(frames_per_fetch)),
            Arc::new(SlowFrameTranscoder::new(Duration::ZERO)),
            SnapshotSettings {
                refresh_interval: Duration::from_millis(50),
                capture_timeout: Duration::from_secs(2),
                idle_timeout: None,
                subscriber_buffer: 4,
            },
            RecordingSettings {
                segment_duration: Duration::from_millis(100),
                retention_segments: 4,
                lock_timeout: Duration::from_millis(100),
                output_directory: dir.to_path_buf(),
                manifest_base_url: String::new(),
            },
        );
        (router(manager.clone()), manager)
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_list_cameras() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), 4);

        let response = app.oneshot(request(Method::GET, "/api/videostream/cameras")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cameras: Vec<String> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(cameras, vec!["cam1", "cam2"]);
    }

    #[tokio::test]
    async fn test_snapshot_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let (app, manager) = app(dir.path(), 4);

        let response = app.oneshot(request(Method::GET, "/api/videostream/cam1/snapshot")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert!(response.headers().contains_key("x-captured-at"));

        let body = body_bytes(response).await;
        assert_eq!(frame_label(&body), "fetch-1-frame-1");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_camera_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), 4);

        let response = app.oneshot(request(Method::GET, "/api/videostream/ghost/snapshot")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"], "Camera with ID ghost not found");
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_full_stream_starts_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (app, manager) = app(dir.path(), 1000);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/videostream/cam1/full"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["url"], "/api/videostream/cam1/playlist.m3u8");
        assert_eq!(body["reused"], false);

        let again: serde_json::Value = serde_json::from_slice(
            &body_bytes(app.clone().oneshot(request(Method::GET, "/api/videostream/cam1/full")).await.unwrap()).await,
        )
        .unwrap();
        assert_eq!(again["job_id"], body["job_id"]);
        assert_eq!(again["reused"], true);

        let playlist = app
            .clone()
            .oneshot(request(Method::GET, "/api/videostream/cam1/playlist.m3u8"))
            .await
            .unwrap();
        assert_eq!(playlist.headers()[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        assert!(body_bytes(playlist).await.starts_with(b"#EXTM3U\n"));

        let stopped = app
            .clone()
            .oneshot(request(Method::DELETE, "/api/videostream/cam1/full"))
            .await
            .unwrap();
        let stopped: serde_json::Value = serde_json::from_slice(&body_bytes(stopped).await).unwrap();
        assert_eq!(stopped["stopped"], true);

        let status = app.oneshot(request(Method::GET, "/api/videostream/cam1/status")).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body_bytes(status).await).unwrap();
        assert_eq!(status["status"]["state"], "cancelled");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_segment_download() {
        let dir = tempfile::tempdir().unwrap();
        let (app, manager) = app(dir.path(), 4);

        manager.start_recording("cam1").await.unwrap();
        manager.recording_job("cam1").await.unwrap().wait().await;

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/videostream/cam1/segments/1.ts"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
        assert!(!body_bytes(response).await.is_empty());

        for uri in ["/api/videostream/cam1/segments/9.ts", "/api/videostream/cam1/segments/latest"] {
            let response = app.clone().oneshot(request(Method::GET, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_mjpeg_passthrough_reframes_source() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(dir.path(), 3);

        let response = app.oneshot(request(Method::GET, "/api/videostream/cam2/mjpeg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let body = body_bytes(response).await;
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text.matches("--frame\r\n").count(), 3);
        assert!(text.contains("fetch-1-frame-3"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(StreamError::busy("x").into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(StreamError::source_unavailable("x").into_response().status(), StatusCode::BAD_GATEWAY);
        assert_eq!(StreamError::transcode("x").into_response().status(), StatusCode::BAD_GATEWAY);
        assert_eq!(StreamError::config("x").into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
