//! Liveness and readiness.
//!
//! Liveness tracks a heartbeat task: while the runtime keeps scheduling it,
//! the process is alive, whatever its leadership. Readiness requires the
//! cache to have completed its first full list and the leadership state to
//! be known, so a healthy standby is ready too.
//!
//! Both checks are served at `/healthz` and `/readyz`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::SyncFlag;
use crate::leader::LeadershipState;
use crate::shutdown::ShutdownSignal;

/// How often the heartbeat task beats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A heartbeat older than this fails liveness.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(30);

/// Shared probe state.
pub struct HealthSignal {
    last_beat: Mutex<Instant>,
    staleness: Duration,
    synced: SyncFlag,
    leadership: watch::Receiver<LeadershipState>,
}

impl HealthSignal {
    pub fn new(synced: SyncFlag, leadership: watch::Receiver<LeadershipState>) -> Self {
        Self {
            last_beat: Mutex::new(Instant::now()),
            staleness: DEFAULT_STALENESS,
            synced,
            leadership,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Record that the runtime is still making progress.
    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    pub fn check_liveness(&self) -> bool {
        self.last_beat.lock().elapsed() <= self.staleness
    }

    pub fn check_readiness(&self) -> bool {
        self.synced.is_set() && self.leadership.borrow().is_known()
    }

    /// Beat every `interval` until `shutdown` fires.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => self.beat(),
            }
        }
        debug!("Heartbeat stopped");
    }
}

fn router(state: Arc<HealthSignal>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Bind `addr` and serve the probe endpoints until `shutdown` fires.
pub async fn run_health_server(
    state: Arc<HealthSignal>,
    addr: SocketAddr,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_health(state, listener, shutdown).await
}

/// Serve the probe endpoints on an already bound listener.
pub async fn serve_health(
    state: Arc<HealthSignal>,
    listener: TcpListener,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Health check server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
}

/// Liveness probe endpoint.
///
/// Kubernetes restarts the pod once this keeps failing.
async fn healthz(State(state): State<Arc<HealthSignal>>) -> StatusCode {
    if state.check_liveness() {
        StatusCode::OK
    } else {
        debug!("Liveness probe: heartbeat is stale");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readyz(State(state): State<Arc<HealthSignal>>) -> StatusCode {
    if state.check_readiness() {
        StatusCode::OK
    } else {
        debug!(
            synced = state.synced.is_set(),
            leadership = ?*state.leadership.borrow(),
            "Readiness probe: NOT READY"
        );
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn signal(state: LeadershipState) -> (HealthSignal, SyncFlag, watch::Sender<LeadershipState>) {
        let synced = SyncFlag::default();
        let (tx, rx) = watch::channel(state);
        (HealthSignal::new(synced.clone(), rx), synced, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_fails_when_heartbeat_is_stale() {
        let (health, _, _tx) = signal(LeadershipState::Unknown);
        let health = health.with_staleness(Duration::from_secs(10));
        assert!(health.check_liveness());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!health.check_liveness());

        health.beat();
        assert!(health.check_liveness());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_task_keeps_liveness() {
        let (health, _, _tx) = signal(LeadershipState::Follower);
        let health = Arc::new(health.with_staleness(Duration::from_secs(10)));
        let shutdown = Shutdown::new();
        let task = tokio::spawn(
            Arc::clone(&health).run_heartbeat(Duration::from_secs(2), shutdown.signal()),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(health.check_liveness());

        shutdown.trigger();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!health.check_liveness());
    }

    #[tokio::test]
    async fn readiness_needs_sync_and_known_leadership() {
        let (health, synced, tx) = signal(LeadershipState::Unknown);
        assert!(!health.check_readiness());

        synced.set();
        assert!(!health.check_readiness());

        tx.send_replace(LeadershipState::Follower);
        assert!(health.check_readiness());

        tx.send_replace(LeadershipState::Leader);
        assert!(health.check_readiness());
    }

    #[tokio::test]
    async fn readyz_reports_unavailable_before_sync() {
        let (health, synced, _tx) = signal(LeadershipState::Leader);
        let health = Arc::new(health);

        assert_eq!(
            readyz(State(Arc::clone(&health))).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        synced.set();
        assert_eq!(readyz(State(health)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_returns_ok_while_beating() {
        let (health, _, _tx) = signal(LeadershipState::Unknown);
        assert_eq!(healthz(State(Arc::new(health))).await, StatusCode::OK);
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn server_serves_both_probes() {
        let (health, _, _tx) = signal(LeadershipState::Unknown);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve_health(Arc::new(health), listener, shutdown.signal()));

        assert!(http_get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
        assert!(http_get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));
        assert!(http_get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown.trigger();
        server.await.unwrap().unwrap();
    }
}
