//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::group::GroupConfig;
use crate::log_bus::LogQuery;
use crate::monitor::MonitorConfig;
use crate::recorder::Event;
use crate::state::AppState;
use crate::storage::{crawler, stem_path, RecordingQuery};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(super::health_check))
        // Monitors
        .route("/api/monitor/list", get(monitor_list))
        .route("/api/monitor/configs", get(monitor_configs))
        .route("/api/monitor/set", put(monitor_set))
        .route("/api/monitor/restart", post(monitor_restart))
        .route("/api/monitor/delete", delete(monitor_delete))
        .route("/api/monitor/trigger", post(monitor_trigger))
        // Groups
        .route("/api/group/configs", get(group_configs))
        .route("/api/group/set", put(group_set))
        .route("/api/group/delete", delete(group_delete))
        // Recordings
        .route("/api/recording/query", get(recording_query))
        .route("/api/recording/video/:id", get(recording_video))
        .route("/api/recording/thumbnail/:id", get(recording_thumbnail))
        .route("/api/recording/delete/:id", delete(recording_delete))
        // Logs
        .route("/api/log/query", get(log_query))
        .route("/api/log/sources", get(log_sources))
        .route("/api/logs", get(logs_feed))
        // Live HLS
        .route("/hls/:monitor/:file", get(hls_file))
        .with_state(state)
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

// ========================================
// Monitor Handlers
// ========================================

async fn monitor_list(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor_manager.monitors_info().await)
}

async fn monitor_configs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor_manager.monitor_configs().await)
}

async fn monitor_set(
    State(state): State<AppState>,
    Json(config): Json<MonitorConfig>,
) -> Result<impl IntoResponse> {
    state.monitor_manager.set(config).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn monitor_restart(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
) -> Result<impl IntoResponse> {
    state.monitor_manager.restart(&params.id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn monitor_delete(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
) -> Result<impl IntoResponse> {
    state.monitor_manager.delete(&params.id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn monitor_trigger(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
    Json(event): Json<Event>,
) -> Result<impl IntoResponse> {
    state.monitor_manager.trigger(&params.id, event).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ========================================
// Group Handlers
// ========================================

async fn group_configs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.group_manager.configs().await)
}

async fn group_set(
    State(state): State<AppState>,
    Json(config): Json<GroupConfig>,
) -> Result<impl IntoResponse> {
    state.group_manager.set(config).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn group_delete(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
) -> Result<impl IntoResponse> {
    state.group_manager.delete(&params.id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ========================================
// Recording Handlers
// ========================================

async fn recording_query(
    State(state): State<AppState>,
    Query(query): Query<RecordingQuery>,
) -> Result<impl IntoResponse> {
    let entries = crawler::query_recordings(state.storage.recordings_dir(), &query).await?;
    Ok(Json(entries))
}

async fn recording_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    serve_recording_file(&state, &id, "mdat", "video/mp2t").await
}

async fn recording_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    serve_recording_file(&state, &id, "jpeg", "image/jpeg").await
}

async fn serve_recording_file(
    state: &AppState,
    id: &str,
    extension: &str,
    content_type: &str,
) -> Result<Response> {
    let base = stem_path(state.storage.recordings_dir(), id)
        .ok_or_else(|| Error::Validation(format!("invalid recording id: {id}")))?;
    let bytes = tokio::fs::read(base.with_extension(extension))
        .await
        .map_err(|_| Error::NotFound(format!("recording: {id}")))?;
    Ok(([(header::CONTENT_TYPE, content_type.to_string())], bytes).into_response())
}

async fn recording_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.storage.delete_recording(&id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ========================================
// Log Handlers
// ========================================

#[derive(Debug, Default, Deserialize)]
struct LogQueryParams {
    levels: Option<String>,
    sources: Option<String>,
    monitors: Option<String>,
    /// Microseconds since epoch, exclusive upper bound.
    time: Option<i64>,
    limit: Option<usize>,
}

impl LogQueryParams {
    fn into_query(self) -> LogQuery {
        let csv = |raw: Option<String>| -> Vec<String> {
            raw.unwrap_or_default()
                .split(',')
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .collect()
        };
        LogQuery {
            levels: self
                .levels
                .unwrap_or_default()
                .split(',')
                .filter_map(|v| v.parse().ok())
                .collect(),
            sources: csv(self.sources),
            monitors: csv(self.monitors),
            time: self.time,
            limit: self.limit,
        }
    }
}

async fn log_query(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> Result<impl IntoResponse> {
    let records = state.log_store.query(params.into_query()).await?;
    Ok(Json(records))
}

async fn log_sources(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.logger.sources().to_vec())
}

/// Live log feed. The same filters as the query endpoint, minus `time`.
async fn logs_feed(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut query = params.into_query();
    query.time = None;
    ws.on_upgrade(move |socket| handle_logs_socket(socket, state, query))
}

async fn handle_logs_socket(mut socket: WebSocket, state: AppState, query: LogQuery) {
    let mut feed = state.logger.subscribe().await;
    loop {
        tokio::select! {
            record = feed.recv() => {
                let Some(record) = record else { break };
                if !query.matches(&record) {
                    continue;
                }
                let Ok(text) = serde_json::to_string(&record) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {} // keepalive
                }
            }
        }
    }
    feed.cancel().await;
}

// ========================================
// HLS Serving
// ========================================

async fn hls_file(
    State(state): State<AppState>,
    Path((monitor, file)): Path<(String, String)>,
) -> Result<Response> {
    // Directory names are monitor ids (optionally `_sub`), file names are
    // the playlist or numbered segments. Reject anything else.
    let dir_ok = monitor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    let file_ok = file == "stream.m3u8"
        || (file.ends_with(".ts") && file[..file.len() - 3].chars().all(|c| c.is_ascii_digit()));
    if !dir_ok || !file_ok {
        return Err(Error::Validation(format!("invalid hls path: {monitor}/{file}")));
    }

    let path = state.env.hls_dir().join(&monitor).join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| Error::NotFound(format!("hls: {monitor}/{file}")))?;

    let content_type = if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else {
        "video/mp2t"
    };
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_query_params_parse_csv() {
        let params = LogQueryParams {
            levels: Some("16,24".to_string()),
            sources: Some("a".to_string()),
            monitors: None,
            time: Some(1000),
            limit: Some(5),
        };
        let query = params.into_query();
        assert_eq!(query.levels, vec![16, 24]);
        assert_eq!(query.sources, vec!["a"]);
        assert!(query.monitors.is_empty());
        assert_eq!(query.time, Some(1000));
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn test_log_query_params_empty() {
        let query = LogQueryParams::default().into_query();
        assert!(query.levels.is_empty());
        assert!(query.sources.is_empty());
        assert_eq!(query.time, None);
    }
}
