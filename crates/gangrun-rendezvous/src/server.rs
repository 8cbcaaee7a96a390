//! HTTP rendezvous server

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use gangrun_core::{GangrunError, GangrunResult, SlotInfo};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::traits::RendezvousService;

type Scope = HashMap<String, Bytes>;

/// Plan and key-value store shared across handlers
#[derive(Default)]
pub struct RendezvousState {
    plan: RwLock<Vec<SlotInfo>>,
    kv: RwLock<HashMap<String, Scope>>,
}

impl RendezvousState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the allocation plan and drop previously exchanged keys
    pub async fn set_plan(&self, plan: Vec<SlotInfo>) {
        *self.plan.write().await = plan;
        self.kv.write().await.clear();
    }
}

/// Create the rendezvous router
pub fn create_router(state: Arc<RendezvousState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slots", get(list_slots))
        .route("/slots/:host/:local_rank", get(get_slot))
        .route("/kv/:scope/:key", get(get_key).put(put_key).delete(delete_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub slots: usize,
}

async fn health(State(state): State<Arc<RendezvousState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        slots: state.plan.read().await.len(),
    })
}

async fn list_slots(State(state): State<Arc<RendezvousState>>) -> Json<Vec<SlotInfo>> {
    Json(state.plan.read().await.clone())
}

/// Look up the slot of the worker at `local_rank` on `host`
async fn get_slot(
    State(state): State<Arc<RendezvousState>>,
    Path((host, local_rank)): Path<(String, u32)>,
) -> Result<Json<SlotInfo>, (StatusCode, String)> {
    let plan = state.plan.read().await;
    plan.iter()
        .find(|s| s.hostname == host && s.local_rank == local_rank)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("No slot for {} local rank {}", host, local_rank),
            )
        })
}

async fn put_key(
    State(state): State<Arc<RendezvousState>>,
    Path((scope, key)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    debug!(scope = %scope, key = %key, bytes = body.len(), "Storing rendezvous key");
    state
        .kv
        .write()
        .await
        .entry(scope)
        .or_default()
        .insert(key, body);
    StatusCode::OK
}

async fn get_key(
    State(state): State<Arc<RendezvousState>>,
    Path((scope, key)): Path<(String, String)>,
) -> Result<Bytes, StatusCode> {
    let kv = state.kv.read().await;
    kv.get(&scope)
        .and_then(|s| s.get(&key))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_key(
    State(state): State<Arc<RendezvousState>>,
    Path((scope, key)): Path<(String, String)>,
) -> StatusCode {
    let mut kv = state.kv.write().await;
    let removed = kv.get_mut(&scope).and_then(|s| s.remove(&key)).is_some();
    if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

struct Running {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Rendezvous service serving the allocation plan over HTTP
pub struct HttpRendezvousServer {
    address: String,
    port: u16,
    state: Arc<RendezvousState>,
    running: Option<Running>,
}

impl HttpRendezvousServer {
    /// Server that will bind `address:port`; port 0 picks a free one
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            state: Arc::new(RendezvousState::new()),
            running: None,
        }
    }

    /// Bound port, once started
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    pub fn state(&self) -> Arc<RendezvousState> {
        self.state.clone()
    }
}

#[async_trait]
impl RendezvousService for HttpRendezvousServer {
    async fn start(&mut self) -> GangrunResult<u16> {
        if let Some(running) = &self.running {
            return Ok(running.port);
        }

        let listener = TcpListener::bind((self.address.as_str(), self.port))
            .await
            .map_err(|e| {
                GangrunError::Rendezvous(format!(
                    "Failed to bind {}:{}: {}",
                    self.address, self.port, e
                ))
            })?;
        let port = listener.local_addr()?.port();

        let (shutdown, signal) = oneshot::channel::<()>();
        let router = create_router(self.state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        info!(address = %self.address, port, "Rendezvous server listening");
        self.running = Some(Running {
            port,
            shutdown,
            task,
        });
        Ok(port)
    }

    async fn init(&mut self, plan: Vec<SlotInfo>) -> GangrunResult<()> {
        if self.running.is_none() {
            return Err(GangrunError::Rendezvous(
                "Rendezvous server must be started before init".to_string(),
            ));
        }
        info!(slots = plan.len(), "Rendezvous plan installed");
        self.state.set_plan(plan).await;
        Ok(())
    }

    async fn stop(&mut self) -> GangrunResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(());
        match running.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Rendezvous server exited with error"),
            Err(e) => warn!(error = %e, "Rendezvous server task failed"),
        }
        info!(port = running.port, "Rendezvous server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn slot(hostname: &str, rank: u32, local_rank: u32) -> SlotInfo {
        SlotInfo {
            hostname: hostname.to_string(),
            rank,
            local_rank,
            cross_rank: 0,
            size: 2,
            local_size: 2,
            cross_size: 1,
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Bytes) {
        let response = router
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes)
    }

    #[tokio::test]
    async fn test_slot_lookup() {
        let state = Arc::new(RendezvousState::new());
        state.set_plan(vec![slot("a", 0, 0), slot("a", 1, 1)]).await;
        let router = create_router(state);

        let (status, body) = send(&router, Method::GET, "/slots/a/1", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let found: SlotInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(found.rank, 1);

        let (status, _) = send(&router, Method::GET, "/slots/b/0", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&router, Method::GET, "/slots", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let all: Vec<SlotInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_key_value_exchange() {
        let router = create_router(Arc::new(RendezvousState::new()));

        let (status, _) =
            send(&router, Method::PUT, "/kv/global/0", Body::from("10.0.0.1:4000")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&router, Method::GET, "/kv/global/0", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"10.0.0.1:4000");

        let (status, _) = send(&router, Method::DELETE, "/kv/global/0", Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&router, Method::GET, "/kv/global/0", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut server = HttpRendezvousServer::new("127.0.0.1", 0);
        assert!(server.init(vec![]).await.is_err());
        server.stop().await.unwrap();

        let port = server.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(server.start().await.unwrap(), port);
        server.init(vec![slot("a", 0, 0)]).await.unwrap();
        assert_eq!(server.port(), Some(port));

        server.stop().await.unwrap();
        assert_eq!(server.port(), None);
        server.stop().await.unwrap();
    }
}
