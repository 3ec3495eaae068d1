//! HTTP + websocket front of the coordinator.
//!
//! Routes:
//!   GET  /ws                          → realtime channel, one per device
//!   GET  /api/health                  → health / roster summary
//!   GET  /api/folders                 → list capture folders
//!   GET  /api/folders/{folder}        → list objects in one capture
//!   PUT  /api/objects/{folder}/{name} → store one object (segment or metadata)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use syncam_common::protocol::{ClientMessage, HealthResponse, ObjectInfo, ServerMessage};

use crate::coordinator::Coordinator;
use crate::storage::{LocalStore, StoreError};

/// Largest accepted upload (one segment).
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Ping periods a device may stay silent (not even a pong) before its
/// channel is dropped.
const PONG_MISSES: u32 = 3;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: LocalStore,
    pub start_time: Instant,
    pub ping_interval: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(channel))
        .route("/api/health", get(health))
        .route("/api/folders", get(list_folders))
        .route("/api/folders/{folder}", get(list_objects))
        .route("/api/objects/{folder}/{name}", put(put_object))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(state: AppState, listen_addr: &str, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Coordinator listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── realtime channel ─────────────────────────────────────────────────────

/// Last inbound traffic on one channel.  Half-open TCP peers never answer
/// pings, so they go overdue instead of lingering in the roster.
struct Liveness {
    last_seen: tokio::time::Instant,
    deadline: Duration,
}

impl Liveness {
    fn new(ping_every: Duration) -> Self {
        Self {
            last_seen: tokio::time::Instant::now(),
            deadline: ping_every * PONG_MISSES,
        }
    }

    fn saw_frame(&mut self) {
        self.last_seen = tokio::time::Instant::now();
    }

    fn is_overdue(&self) -> bool {
        self.last_seen.elapsed() > self.deadline
    }
}

async fn channel(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One device connection: register, pump outbound queue, dispatch inbound
/// frames, unregister when either side ends or the peer stops answering
/// pings.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let device_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    state.coordinator.connect(&device_id, tx);

    let ping_every = state.ping_interval;
    let writer_id = device_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("Cannot encode frame for {writer_id}: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // dropping `rx` here closes the queue, which the sweeper notices
        debug!("Writer for {writer_id} finished");
    });

    let mut liveness = Liveness::new(ping_every);
    let mut check = tokio::time::interval(ping_every);
    check.tick().await;
    loop {
        tokio::select! {
            frame = stream.next() => {
                liveness.saw_frame();
                match frame {
                    Some(Ok(Message::Text(text))) => match ClientMessage::parse(text.as_str()) {
                        Ok(msg) => state.coordinator.handle(&device_id, msg),
                        Err(e) => warn!("Dropping frame from {device_id}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Channel error on {device_id}: {e}");
                        break;
                    }
                }
            }
            _ = check.tick() => {
                if liveness.is_overdue() {
                    warn!("No pong from {device_id} within {:?}, dropping channel", liveness.deadline);
                    break;
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
    state.coordinator.disconnect(&device_id);
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snap = state.coordinator.snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connected_devices: snap.devices.len(),
        session_id: snap.session_id,
        sync_started: snap.sync_started,
        next_counter: snap.next_counter,
    })
}

async fn list_folders(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    state
        .store
        .list_folders()
        .map(Json)
        .map_err(|e| store_status(&e))
}

async fn list_objects(
    State(state): State<AppState>,
    Path(folder): Path<String>,
) -> Result<Json<Vec<ObjectInfo>>, StatusCode> {
    state
        .store
        .list_objects(&folder)
        .map(Json)
        .map_err(|e| store_status(&e))
}

async fn put_object(
    State(state): State<AppState>,
    Path((folder, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    match state.store.put(&folder, &name, &body, content_type).await {
        Ok(_) => StatusCode::CREATED,
        Err(e) => {
            warn!("Upload of {folder}/{name} failed: {e}");
            store_status(&e)
        }
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Settings;

    fn state(dir: &std::path::Path) -> AppState {
        AppState {
            coordinator: Arc::new(Coordinator::new(Settings::default(), 0)),
            store: LocalStore::new(dir),
            start_time: Instant::now(),
            ping_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_put_object_handler() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "video/mp4".parse().unwrap());

        let resp = put_object(
            State(st.clone()),
            Path(("00_20240101_120000_1".into(), "a.mp4".into())),
            headers.clone(),
            Bytes::from_static(b"abc"),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = put_object(
            State(st.clone()),
            Path(("..".into(), "a.mp4".into())),
            headers,
            Bytes::new(),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let Json(folders) = list_folders(State(st.clone())).await.unwrap();
        assert_eq!(folders, vec!["00_20240101_120000_1"]);
        let Json(objects) = list_objects(State(st), Path("00_20240101_120000_1".into()))
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_goes_overdue() {
        let ping = Duration::from_secs(10);
        let mut liveness = Liveness::new(ping);
        tokio::time::advance(ping * 2).await;
        assert!(!liveness.is_overdue());

        // a pong resets the deadline
        liveness.saw_frame();
        tokio::time::advance(ping * PONG_MISSES - Duration::from_secs(1)).await;
        assert!(!liveness.is_overdue());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(liveness.is_overdue());
    }

    #[tokio::test]
    async fn test_health_reports_roster() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();
        st.coordinator.connect("d1", tx);

        let Json(h) = health(State(st)).await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.connected_devices, 1);
        assert!(!h.sync_started);
        assert_eq!(h.next_counter, 0);
    }
}
