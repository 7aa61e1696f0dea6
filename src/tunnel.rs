//! Supervised port-forwarding sessions to remote instrument servers.
//!
//! A [`Tunnel`] owns one forwarding session described by a
//! [`TunnelSpec`](crate::config::TunnelSpec): local port, remote host, remote
//! port. The transport that actually moves bytes is abstracted behind
//! [`TunnelTransport`], so an SSH child process ([`SshTransport`]) and an
//! in-process TCP relay ([`TcpForwardTransport`]) satisfy the same contract.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting → Established ⇄ Degraded → Closed
//! ```
//!
//! While `Established`, a supervisor task pings the remote instrument server
//! through the forward at the configured interval. A failed heartbeat moves
//! the session to `Degraded` and starts reconnect attempts with strictly
//! increasing exponential backoff; only one attempt is ever in flight. When
//! the attempt budget is exhausted the session transitions to `Closed` and a
//! lost notification is emitted exactly once; dependents subscribe via
//! [`Tunnel::subscribe_lost`].
//!
//! Closing a tunnel signals the remote server cooperatively (the `shutdown`
//! request through the forward) when the transport fronts a dedicated remote
//! process, then tears the transport down.

use crate::client::Connection;
use crate::config::TunnelSpec;
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health of a forwarding session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// First establishment in progress.
    Connecting,
    /// Forward is up and heartbeats are passing.
    Established,
    /// Heartbeat failed; reconnecting.
    Degraded,
    /// Session over, by request or by exhausted retries.
    Closed,
}

/// A live forwarding link produced by a transport.
#[async_trait]
pub trait TunnelLink: Send {
    /// Tears the link down. Must be safe to call once, after which the local
    /// port is free again.
    async fn close(&mut self);
}

/// Something able to forward a local port to a remote instrument server.
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    /// Establishes the forward described by `spec`.
    async fn establish(&self, spec: &TunnelSpec) -> LabResult<Box<dyn TunnelLink>>;

    /// Whether the remote end is a dedicated process that should receive a
    /// cooperative shutdown when this tunnel closes.
    fn supports_remote_shutdown(&self) -> bool {
        false
    }
}

// =============================================================================
// SSH transport
// =============================================================================

/// Forwarding via an `ssh -N -L` child process. Authentication comes from the
/// user's agent or key files; nothing is embedded here.
pub struct SshTransport;

struct SshLink {
    child: Child,
}

#[async_trait]
impl TunnelLink for SshLink {
    async fn close(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "ssh child already gone");
        }
        let _ = self.child.wait().await;
    }
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn establish(&self, spec: &TunnelSpec) -> LabResult<Box<dyn TunnelLink>> {
        let forward = format!("{}:127.0.0.1:{}", spec.local_port, spec.remote_port);
        let destination = format!("{}@{}", spec.remote_user, spec.remote_host);
        let child = Command::new("ssh")
            .arg("-N")
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-L", &forward])
            .arg(&destination)
            .kill_on_drop(true)
            .spawn()?;
        info!(%destination, %forward, "ssh forward spawned");
        Ok(Box::new(SshLink { child }))
    }

    fn supports_remote_shutdown(&self) -> bool {
        true
    }
}

// =============================================================================
// In-process TCP relay transport
// =============================================================================

/// Forwarding via an in-process TCP relay, for remotes already reachable on
/// the network and for tests.
pub struct TcpForwardTransport {
    /// Address the relay connects through to reach the remote server.
    pub target: String,
}

struct TcpForwardLink {
    task: JoinHandle<()>,
}

#[async_trait]
impl TunnelLink for TcpForwardLink {
    async fn close(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

#[async_trait]
impl TunnelTransport for TcpForwardTransport {
    async fn establish(&self, spec: &TunnelSpec) -> LabResult<Box<dyn TunnelLink>> {
        let listener = TcpListener::bind(("127.0.0.1", spec.local_port)).await?;
        let target = self.target.clone();
        let task = tokio::spawn(async move {
            // Relays live in the JoinSet so aborting this task severs every
            // forwarded connection, not just the listener.
            let mut relays = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut inbound, _)) = accepted else { break };
                        let target = target.clone();
                        relays.spawn(async move {
                            match TcpStream::connect(&target).await {
                                Ok(mut outbound) => {
                                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                                        .await;
                                }
                                Err(e) => debug!(%target, error = %e, "relay connect failed"),
                            }
                        });
                    }
                    Some(_) = relays.join_next() => {}
                }
            }
        });
        Ok(Box::new(TcpForwardLink { task }))
    }
}

// =============================================================================
// Tunnel session
// =============================================================================

/// A supervised forwarding session.
pub struct Tunnel {
    remote_host: String,
    local_port: u16,
    state_rx: watch::Receiver<TunnelState>,
    lost_tx: broadcast::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
    cooperative_shutdown: bool,
}

impl Tunnel {
    /// Opens a session and starts its supervisor. Returns immediately; await
    /// [`wait_established`](Self::wait_established) before depending on it.
    pub fn open(spec: TunnelSpec, transport: Arc<dyn TunnelTransport>) -> Self {
        let (state_tx, state_rx) = watch::channel(TunnelState::Connecting);
        let (lost_tx, _) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cooperative_shutdown = transport.supports_remote_shutdown();

        let supervisor = tokio::spawn(supervise(
            spec.clone(),
            transport,
            state_tx,
            lost_tx.clone(),
            shutdown_rx,
        ));

        Self {
            remote_host: spec.remote_host,
            local_port: spec.local_port,
            state_rx,
            lost_tx,
            shutdown_tx,
            supervisor: Some(supervisor),
            cooperative_shutdown,
        }
    }

    /// Remote host this session fronts.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Endpoint clients dial to reach the remote server through the forward.
    pub fn local_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    /// Current session state.
    pub fn state(&self) -> TunnelState {
        *self.state_rx.borrow()
    }

    /// Watch the session state.
    pub fn state_changes(&self) -> watch::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    /// Receives the remote host name once, should the session be lost.
    pub fn subscribe_lost(&self) -> broadcast::Receiver<String> {
        self.lost_tx.subscribe()
    }

    /// Waits until the forward passes its first heartbeat.
    pub async fn wait_established(&self, timeout: Duration) -> LabResult<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow() {
                    TunnelState::Established => return Ok(()),
                    TunnelState::Closed => {
                        return Err(LabError::TunnelLost(self.remote_host.clone()))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(LabError::TunnelLost(self.remote_host.clone()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| LabError::Timeout(timeout))?
    }

    /// Closes the session: signals the remote process cooperatively when the
    /// transport fronts one, then tears the forward down. No lost
    /// notification is emitted for a requested close.
    pub async fn close(mut self) {
        if self.cooperative_shutdown && self.state() == TunnelState::Established {
            let endpoint = self.local_endpoint();
            match Connection::connect(&endpoint, Duration::from_secs(2)).await {
                Ok(mut conn) => {
                    if let Err(e) = conn.shutdown_server().await {
                        warn!(host = %self.remote_host, error = %e, "remote shutdown failed");
                    }
                }
                Err(e) => {
                    warn!(host = %self.remote_host, error = %e, "remote unreachable for shutdown")
                }
            }
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.supervisor.take() {
            let _ = task.await;
        }
        info!(host = %self.remote_host, "tunnel closed");
    }
}

/// Ceiling for the doubling reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

async fn supervise(
    spec: TunnelSpec,
    transport: Arc<dyn TunnelTransport>,
    state_tx: watch::Sender<TunnelState>,
    lost_tx: broadcast::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let endpoint = format!("127.0.0.1:{}", spec.local_port);
    let mut backoff = spec.initial_backoff;
    let mut attempts_left = spec.max_reconnect_attempts;

    loop {
        // One attempt in flight at a time, by construction of this loop.
        let attempt = async {
            let mut link = transport.establish(&spec).await?;
            if let Err(e) = heartbeat(&endpoint, spec.heartbeat_timeout).await {
                link.close().await;
                return Err(e);
            }
            Ok::<_, LabError>(link)
        };

        let link = tokio::select! {
            result = attempt => result,
            _ = shutdown_rx.changed() => {
                let _ = state_tx.send(TunnelState::Closed);
                return;
            }
        };

        match link {
            Ok(mut link) => {
                info!(host = %spec.remote_host, port = spec.local_port, "tunnel established");
                let _ = state_tx.send(TunnelState::Established);
                backoff = spec.initial_backoff;
                attempts_left = spec.max_reconnect_attempts;

                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(spec.heartbeat_interval) => {
                            if let Err(e) = heartbeat(&endpoint, spec.heartbeat_timeout).await {
                                warn!(host = %spec.remote_host, error = %e, "heartbeat failed");
                                let _ = state_tx.send(TunnelState::Degraded);
                                link.close().await;
                                break;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            link.close().await;
                            let _ = state_tx.send(TunnelState::Closed);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(host = %spec.remote_host, error = %e, "tunnel attempt failed");
                let _ = state_tx.send(TunnelState::Degraded);
            }
        }

        if attempts_left == 0 {
            warn!(host = %spec.remote_host, "reconnect attempts exhausted; tunnel lost");
            let _ = state_tx.send(TunnelState::Closed);
            // Exactly one lost notification per lost session.
            let _ = lost_tx.send(spec.remote_host.clone());
            return;
        }
        attempts_left -= 1;

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                let _ = state_tx.send(TunnelState::Closed);
                return;
            }
        }
        backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
    }
}

/// One no-op round trip through the forward, bounded by `timeout`.
async fn heartbeat(endpoint: &str, timeout: Duration) -> LabResult<()> {
    let mut conn = Connection::connect(endpoint, timeout).await?;
    conn.ping().await
}

/// Owns at most one session per remote host; re-opening replaces the prior
/// session.
#[derive(Default)]
pub struct TunnelManager {
    sessions: HashMap<String, Tunnel>,
}

impl TunnelManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `spec`, closing any prior session to the same
    /// remote host first.
    pub async fn open(&mut self, spec: TunnelSpec, transport: Arc<dyn TunnelTransport>) -> &Tunnel {
        if let Some(previous) = self.sessions.remove(&spec.remote_host) {
            info!(host = %spec.remote_host, "replacing existing tunnel session");
            previous.close().await;
        }
        let host = spec.remote_host.clone();
        let tunnel = Tunnel::open(spec, transport);
        self.sessions.entry(host).or_insert(tunnel)
    }

    /// The session for `remote_host`, if one is open.
    pub fn get(&self, remote_host: &str) -> Option<&Tunnel> {
        self.sessions.get(remote_host)
    }

    /// Closes the session for `remote_host`.
    pub async fn close(&mut self, remote_host: &str) {
        if let Some(tunnel) = self.sessions.remove(remote_host) {
            tunnel.close().await;
        }
    }

    /// Closes every session.
    pub async fn close_all(&mut self) {
        for (_, tunnel) in self.sessions.drain() {
            tunnel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn spec(max_attempts: u32) -> TunnelSpec {
        TunnelSpec {
            remote_host: "lab-pc".to_string(),
            remote_user: "operator".to_string(),
            local_port: 42067,
            remote_port: 42057,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(1),
            max_reconnect_attempts: max_attempts,
            initial_backoff: Duration::from_millis(100),
        }
    }

    /// Transport that always fails and journals attempt instants.
    struct FailingTransport {
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl TunnelTransport for FailingTransport {
        async fn establish(&self, _spec: &TunnelSpec) -> LabResult<Box<dyn TunnelLink>> {
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push(Instant::now());
            }
            Err(LabError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no route",
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_strictly_increases_and_lost_emitted_once() {
        let transport = Arc::new(FailingTransport {
            attempts: Mutex::new(Vec::new()),
        });
        let tunnel = Tunnel::open(spec(4), transport.clone());
        let mut lost_rx = tunnel.subscribe_lost();

        // Exhausts 1 initial + 4 reconnect attempts, then reports lost.
        let host = lost_rx.recv().await.unwrap();
        assert_eq!(host, "lab-pc");
        assert_eq!(tunnel.state(), TunnelState::Closed);

        let attempts = transport.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0], "backoff not increasing: {gaps:?}");
        }

        // No second notification for the same lost session.
        assert!(matches!(
            lost_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_caps_at_ceiling() {
        let transport = Arc::new(FailingTransport {
            attempts: Mutex::new(Vec::new()),
        });
        let tunnel = Tunnel::open(spec(15), transport.clone());
        let mut lost_rx = tunnel.subscribe_lost();

        lost_rx.recv().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Closed);

        let attempts = transport.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 16);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        for gap in &gaps {
            assert!(*gap <= MAX_BACKOFF, "delay past ceiling: {gaps:?}");
        }
        // Once capped, the delay holds steady instead of doubling on.
        assert_eq!(gaps[gaps.len() - 1], MAX_BACKOFF);
        assert_eq!(gaps[gaps.len() - 2], MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_close_emits_no_lost_event() {
        let transport = Arc::new(FailingTransport {
            attempts: Mutex::new(Vec::new()),
        });
        let tunnel = Tunnel::open(spec(1000), transport);
        let mut lost_rx = tunnel.subscribe_lost();

        tokio::time::sleep(Duration::from_millis(50)).await;
        tunnel.close().await;
        assert!(matches!(
            lost_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
