//! The relay proper — session lifecycle and the two I/O pumps.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devgrid_cluster::{ClusterRegistry, ExecInput};
use devgrid_core::Principal;
use devgrid_orchestrator::Orchestrator;
use devgrid_state::{EnvStatus, SessionRecord, StateStore};

use crate::bucket::TokenBucket;
use crate::error::{RelayError, RelayResult};
use crate::frame::Frame;

/// Bounded timeout for opening an exec stream against the cluster.
const EXEC_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// The duplex channel handed to the caller-facing transport.
#[derive(Debug)]
pub struct TerminalChannel {
    pub connection_id: String,
    /// Frames from the transport into the relay.
    pub to_relay: mpsc::Sender<Frame>,
    /// Frames from the relay back to the transport.
    pub from_relay: mpsc::Receiver<Frame>,
}

/// In-memory state for one live session. The durable truth is the
/// `SessionRecord` in the store; this is the cache in front of it.
struct LiveSession {
    record: SessionRecord,
    /// Epoch milliseconds of the last heartbeat or input, shared with
    /// the inbound pump.
    last_heartbeat: Arc<AtomicU64>,
    to_client: mpsc::Sender<Frame>,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

/// Terminal session relay.
#[derive(Clone)]
pub struct Relay {
    state: StateStore,
    registry: Arc<ClusterRegistry>,
    orchestrator: Orchestrator,
    sessions: Arc<RwLock<HashMap<String, LiveSession>>>,
    input_burst: u32,
    input_per_sec: u32,
    idle_timeout: Duration,
}

impl Relay {
    pub fn new(
        state: StateStore,
        registry: Arc<ClusterRegistry>,
        orchestrator: Orchestrator,
        input_burst: u32,
        input_per_sec: u32,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            orchestrator,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            input_burst,
            input_per_sec,
            idle_timeout,
        }
    }

    /// Mark every session left live by a previous process as dead.
    ///
    /// Must run before the relay accepts connections so no false
    /// "connected" state survives a restart.
    pub fn recover(&self) -> RelayResult<u32> {
        let reconciled = self.state.mark_all_sessions_dead()?;
        if reconciled > 0 {
            info!(count = reconciled, "orphaned terminal sessions reconciled");
        }
        Ok(reconciled)
    }

    /// Open a terminal session into an environment.
    ///
    /// Requires the environment to be `Running` and owned by the
    /// principal (admins may open any). On success the session is
    /// registered, both pumps are running, and the returned channel is
    /// live.
    pub async fn open(
        &self,
        principal: &Principal,
        environment_id: &str,
    ) -> RelayResult<TerminalChannel> {
        let env = self
            .state
            .get_environment(environment_id)?
            .ok_or_else(|| RelayError::EnvironmentNotFound(environment_id.to_string()))?;

        if env.user_id != principal.user_id && !principal.is_admin {
            return Err(RelayError::Forbidden);
        }
        if env.status != EnvStatus::Running {
            return Err(RelayError::EnvironmentNotReady { status: env.status });
        }

        let cluster_id = env
            .cluster_id
            .clone()
            .ok_or_else(|| RelayError::ExecFailed("no cluster assigned".to_string()))?;
        let client = self.registry.client(&cluster_id).await?;
        let exec = tokio::time::timeout(EXEC_OPEN_TIMEOUT, client.open_exec(environment_id))
            .await
            .map_err(|_| RelayError::ExecFailed("exec open timed out".to_string()))?
            .map_err(|e| RelayError::ExecFailed(e.to_string()))?;

        let connection_id = Uuid::new_v4().to_string();
        let now_millis = epoch_millis();
        let record = SessionRecord {
            connection_id: connection_id.clone(),
            environment_id: environment_id.to_string(),
            user_id: principal.user_id.clone(),
            opened_at: now_millis / 1000,
            last_heartbeat_at: now_millis,
            live: true,
        };
        self.state.put_session(&record)?;

        let (to_relay_tx, to_relay_rx) = mpsc::channel::<Frame>(64);
        let (to_client_tx, to_client_rx) = mpsc::channel::<Frame>(256);
        let last_heartbeat = Arc::new(AtomicU64::new(now_millis));

        // Welcome notice before any exec output.
        let _ = to_client_tx
            .send(Frame::Output {
                data: format!("Connected to {}\r\n", env.name),
            })
            .await;

        let inbound = tokio::spawn(inbound_pump(
            self.clone(),
            connection_id.clone(),
            environment_id.to_string(),
            to_relay_rx,
            exec.input,
            to_client_tx.clone(),
            last_heartbeat.clone(),
        ));
        let outbound = tokio::spawn(outbound_pump(
            self.clone(),
            connection_id.clone(),
            exec.output,
            to_client_tx.clone(),
        ));

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            connection_id.clone(),
            LiveSession {
                record,
                last_heartbeat,
                to_client: to_client_tx,
                inbound,
                outbound,
            },
        );
        drop(sessions);

        info!(%connection_id, %environment_id, user_id = %principal.user_id, "terminal session opened");
        Ok(TerminalChannel {
            connection_id,
            to_relay: to_relay_tx,
            from_relay: to_client_rx,
        })
    }

    /// Tear a session down: stop both pumps, deliver the optional error
    /// frame, and mark the record not-live.
    pub async fn close_session(&self, connection_id: &str, reason: Option<&str>) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(connection_id)
        };

        match session {
            Some(session) => {
                if let Some(message) = reason {
                    let _ = session
                        .to_client
                        .send(Frame::Error {
                            message: message.to_string(),
                        })
                        .await;
                }

                let mut record = session.record;
                record.live = false;
                record.last_heartbeat_at = session.last_heartbeat.load(Ordering::Relaxed);
                if let Err(e) = self.state.put_session(&record) {
                    warn!(%connection_id, error = %e, "failed to persist session close");
                }

                info!(
                    %connection_id,
                    reason = reason.unwrap_or("closed"),
                    "terminal session closed"
                );
                session.inbound.abort();
                session.outbound.abort();
            }
            None => {
                // Not in the cache (already closed, or a pump raced us);
                // make sure the durable record agrees.
                if let Ok(Some(mut record)) = self.state.get_session(connection_id) {
                    if record.live {
                        record.live = false;
                        let _ = self.state.put_session(&record);
                    }
                }
            }
        }
    }

    /// Close every session idle past the timeout. Returns the reaped ids.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let timeout_millis = self.idle_timeout.as_millis() as u64;
        let now = epoch_millis();

        let idle: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| {
                    now.saturating_sub(s.last_heartbeat.load(Ordering::Relaxed)) > timeout_millis
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for connection_id in &idle {
            self.close_session(connection_id, Some("session idle timeout")).await;
        }
        idle
    }

    /// The periodic sweep loop.
    pub async fn run_sweep(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "session sweep started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let reaped = self.sweep_idle().await;
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "idle sessions reaped");
                    }
                }
                _ = shutdown.changed() => {
                    info!("session sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Number of sessions currently live in this process.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Write the current in-memory heartbeat through to the store.
    async fn persist_heartbeat(&self, connection_id: &str) {
        let snapshot = {
            let sessions = self.sessions.read().await;
            sessions.get(connection_id).map(|s| {
                let mut record = s.record.clone();
                record.last_heartbeat_at = s.last_heartbeat.load(Ordering::Relaxed);
                record
            })
        };
        if let Some(record) = snapshot {
            if let Err(e) = self.state.put_session(&record) {
                warn!(%connection_id, error = %e, "failed to persist heartbeat");
            }
        }
    }
}

/// Client frames → exec stream. Input is rate limited; heartbeats are
/// answered and written through; resize travels as a control message.
async fn inbound_pump(
    relay: Relay,
    connection_id: String,
    environment_id: String,
    mut from_transport: mpsc::Receiver<Frame>,
    exec_input: mpsc::Sender<ExecInput>,
    to_client: mpsc::Sender<Frame>,
    heartbeat: Arc<AtomicU64>,
) {
    let mut bucket = TokenBucket::new(relay.input_burst, relay.input_per_sec);

    while let Some(frame) = from_transport.recv().await {
        match frame {
            Frame::Input { data } => {
                if !bucket.try_acquire() {
                    debug!(%connection_id, "input frame dropped by rate limiter");
                    let _ = to_client
                        .send(Frame::Output {
                            data: "\r\n[input rate limit exceeded, dropped]\r\n".to_string(),
                        })
                        .await;
                    continue;
                }
                heartbeat.store(epoch_millis(), Ordering::Relaxed);
                if exec_input.send(ExecInput::Data(data.into_bytes())).await.is_err() {
                    break;
                }
            }
            Frame::Resize { cols, rows } => {
                if exec_input.send(ExecInput::Resize { cols, rows }).await.is_err() {
                    break;
                }
            }
            Frame::Ping => {
                heartbeat.store(epoch_millis(), Ordering::Relaxed);
                relay.persist_heartbeat(&connection_id).await;
                if let Err(e) = relay.orchestrator.record_activity(&environment_id).await {
                    warn!(%connection_id, error = %e, "failed to record environment activity");
                }
                let _ = to_client.send(Frame::Pong).await;
            }
            // Server-to-client frame types arriving inbound are ignored.
            Frame::Pong | Frame::Output { .. } | Frame::Error { .. } => {}
        }
    }

    debug!(%connection_id, "transport side closed");
    relay.close_session(&connection_id, None).await;
}

/// Exec stream → output frames.
async fn outbound_pump(
    relay: Relay,
    connection_id: String,
    mut exec_output: mpsc::Receiver<Vec<u8>>,
    to_client: mpsc::Sender<Frame>,
) {
    while let Some(chunk) = exec_output.recv().await {
        let frame = Frame::Output {
            data: String::from_utf8_lossy(&chunk).into_owned(),
        };
        if to_client.send(frame).await.is_err() {
            break;
        }
    }

    debug!(%connection_id, "exec stream ended");
    relay.close_session(&connection_id, Some("exec stream closed")).await;
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
