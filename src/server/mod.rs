//! Instrument server: hosts drivers and exposes them for remote invocation.
//!
//! The server binds a TCP listener, opens every configured driver, and
//! dispatches wire requests to per-driver worker tasks. Each worker owns its
//! boxed [`Driver`] outright and drains a bounded queue, so calls to one
//! driver execute strictly in arrival order while different drivers run
//! concurrently. Hardware rarely tolerates interleaved commands, so the
//! server never issues them.
//!
//! # Failure Semantics
//!
//! - A driver whose `open` fails is marked `Failed` and reported via
//!   `describe`; the remaining drivers start normally.
//! - A per-call driver error is returned to the caller; the worker and the
//!   server keep running.
//! - A malformed frame drops that connection only; the accept loop continues.
//! - `stop` closes every driver independently: one close failure is logged
//!   and does not prevent the others from closing.

use crate::config::Settings;
use crate::driver::registry::DriverRegistry;
use crate::driver::{Driver, DriverHealth, ParamValue};
use crate::error::{LabError, LabResult};
use crate::proto::{
    self, DriverStatus, Hello, Request, RequestOp, Response, ResponseBody, ServiceKind, WireError,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long `stop` waits for each driver to close before moving on.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One operation bound for a driver worker.
enum DriverOp {
    Call { method: String, args: Vec<ParamValue> },
    Get { attribute: String },
    Set { attribute: String, value: ParamValue },
    Close,
}

struct DriverRequest {
    op: DriverOp,
    reply: oneshot::Sender<LabResult<ParamValue>>,
}

#[derive(Clone)]
struct HealthCell(Arc<Mutex<(DriverHealth, Option<String>)>>);

impl HealthCell {
    fn new(health: DriverHealth, error: Option<String>) -> Self {
        Self(Arc::new(Mutex::new((health, error))))
    }

    fn set(&self, health: DriverHealth, error: Option<String>) {
        if let Ok(mut cell) = self.0.lock() {
            *cell = (health, error);
        }
    }

    fn get(&self) -> (DriverHealth, Option<String>) {
        self.0
            .lock()
            .map(|cell| cell.clone())
            .unwrap_or((DriverHealth::Failed, Some("health cell poisoned".into())))
    }
}

struct DriverEntry {
    queue: Option<mpsc::Sender<DriverRequest>>,
    health: HealthCell,
}

struct ServerInner {
    instance_id: Uuid,
    call_timeout: Duration,
    drivers: HashMap<String, DriverEntry>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerInner {
    fn statuses(&self) -> Vec<DriverStatus> {
        let mut statuses: Vec<DriverStatus> = self
            .drivers
            .iter()
            .map(|(name, entry)| {
                let (health, error) = entry.health.get();
                DriverStatus {
                    name: name.clone(),
                    health,
                    error,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Drivers with live handles; only these are advertised in the hello.
    fn advertised(&self) -> Vec<DriverStatus> {
        self.statuses()
            .into_iter()
            .filter(|s| s.health == DriverHealth::Available)
            .collect()
    }
}

/// A running instrument server.
///
/// Explicitly constructed and explicitly owned: multiple servers coexist in
/// one process (and in tests) without shared global state.
pub struct InstrumentServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    workers: Vec<(String, JoinHandle<()>)>,
    failed_at_startup: Vec<String>,
}

impl InstrumentServer {
    /// Binds the listener and opens every configured driver.
    ///
    /// Driver open failures are isolated: the failing driver is reported as
    /// `Failed` and the server starts with the rest. The caller inspects
    /// [`failed_drivers`](Self::failed_drivers) to decide the process exit
    /// code.
    pub async fn start(settings: &Settings, registry: &DriverRegistry) -> LabResult<Self> {
        let listener = TcpListener::bind(&settings.server.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let instance_id = Uuid::new_v4();
        info!(%local_addr, %instance_id, "instrument server starting");

        let (shutdown_tx, _) = watch::channel(false);
        let mut drivers = HashMap::new();
        let mut workers = Vec::new();
        let mut failed_at_startup = Vec::new();

        for driver_config in &settings.drivers {
            let name = driver_config.name.clone();
            let mut driver = match registry.create(&driver_config.kind, &name) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(driver = %name, error = %e, "driver construction failed");
                    drivers.insert(
                        name.clone(),
                        DriverEntry {
                            queue: None,
                            health: HealthCell::new(DriverHealth::Failed, Some(e.to_string())),
                        },
                    );
                    failed_at_startup.push(name);
                    continue;
                }
            };

            match driver.open(&driver_config.connection_params).await {
                Ok(()) => {
                    let (tx, rx) = mpsc::channel(settings.server.call_queue_capacity);
                    let health = HealthCell::new(DriverHealth::Available, None);
                    let worker =
                        tokio::spawn(run_driver_worker(name.clone(), driver, rx, health.clone()));
                    drivers.insert(
                        name.clone(),
                        DriverEntry {
                            queue: Some(tx),
                            health,
                        },
                    );
                    workers.push((name.clone(), worker));
                    info!(driver = %name, "driver opened");
                }
                Err(e) => {
                    warn!(driver = %name, error = %e, "driver open failed; continuing without it");
                    // Hardware-safe even after a partial open
                    if let Err(close_err) = driver.close().await {
                        warn!(driver = %name, error = %close_err, "close after failed open");
                    }
                    drivers.insert(
                        name.clone(),
                        DriverEntry {
                            queue: None,
                            health: HealthCell::new(DriverHealth::Failed, Some(e.to_string())),
                        },
                    );
                    failed_at_startup.push(name);
                }
            }
        }

        let inner = Arc::new(ServerInner {
            instance_id,
            call_timeout: settings.server.call_timeout,
            drivers,
            shutdown_tx,
        });

        let accept_inner = inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let accept_task = tokio::spawn(async move {
            let mut connections = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "client connected");
                                let conn_inner = accept_inner.clone();
                                connections.spawn(async move {
                                    if let Err(e) = handle_connection(conn_inner, stream).await {
                                        // Defect or malformed frame: drop this
                                        // connection, keep serving the rest.
                                        warn!(%peer, error = %e, "connection dropped");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "accept failed");
                            }
                        }
                    }
                    Some(_) = connections.join_next() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Sever live connections so clients observe the stop.
            connections.shutdown().await;
            debug!("accept loop exited");
        });

        Ok(Self {
            inner,
            local_addr,
            accept_task: Some(accept_task),
            workers,
            failed_at_startup,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identity of this server process.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Drivers whose `open` failed at startup.
    pub fn failed_drivers(&self) -> &[String] {
        &self.failed_at_startup
    }

    /// Current health of every configured driver.
    pub fn driver_statuses(&self) -> Vec<DriverStatus> {
        self.inner.statuses()
    }

    /// Resolves when a client requests a cooperative shutdown.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops the server: closes every driver, then the listener.
    ///
    /// Close attempts are independent; a failure is logged and the remaining
    /// drivers are still closed.
    pub async fn stop(mut self) {
        info!("instrument server stopping");
        let _ = self.inner.shutdown_tx.send(true);

        // Closes are independent: one failing or slow driver must not delay
        // or skip the others.
        let mut closes = Vec::new();
        for (name, entry) in &self.inner.drivers {
            let Some(queue) = entry.queue.clone() else { continue };
            let name = name.clone();
            closes.push(async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                if queue
                    .send(DriverRequest {
                        op: DriverOp::Close,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                match tokio::time::timeout(CLOSE_TIMEOUT, reply_rx).await {
                    Ok(Ok(Ok(_))) => info!(driver = %name, "driver closed"),
                    Ok(Ok(Err(e))) => warn!(driver = %name, error = %e, "driver close failed"),
                    Ok(Err(_)) => warn!(driver = %name, "driver worker gone before close"),
                    Err(_) => warn!(driver = %name, "driver close timed out"),
                }
            });
        }
        futures::future::join_all(closes).await;

        for (name, worker) in self.workers.drain(..) {
            if tokio::time::timeout(CLOSE_TIMEOUT, worker).await.is_err() {
                warn!(driver = %name, "worker did not exit in time");
            }
        }

        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        info!("instrument server stopped");
    }
}

/// Event loop owning one driver. Exclusive ownership of the boxed driver is
/// what enforces both call serialization and the single-live-handle rule.
async fn run_driver_worker(
    name: String,
    mut driver: Box<dyn Driver>,
    mut rx: mpsc::Receiver<DriverRequest>,
    health: HealthCell,
) {
    while let Some(request) = rx.recv().await {
        match request.op {
            DriverOp::Call { method, args } => {
                let result = driver.call(&method, &args).await;
                let _ = request.reply.send(result);
            }
            DriverOp::Get { attribute } => {
                let result = driver.get(&attribute).await;
                let _ = request.reply.send(result);
            }
            DriverOp::Set { attribute, value } => {
                let result = driver.set(&attribute, value).await.map(|()| ParamValue::Null);
                let _ = request.reply.send(result);
            }
            DriverOp::Close => {
                let result = driver.close().await;
                health.set(DriverHealth::Closed, None);
                let _ = request.reply.send(result.map(|()| ParamValue::Null));
                rx.close();
                break;
            }
        }
    }
    // Queue dropped without an explicit close: still leave hardware safe.
    let (current, _) = health.get();
    if current == DriverHealth::Available {
        if let Err(e) = driver.close().await {
            warn!(driver = %name, error = %e, "close on worker teardown failed");
        }
        health.set(DriverHealth::Closed, None);
    }
    debug!(driver = %name, "worker exited");
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream) -> LabResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello = Hello {
        service: ServiceKind::Instrument,
        instance_id: inner.instance_id,
        version: PROTOCOL_VERSION,
        drivers: inner.advertised(),
    };
    proto::write_frame(&mut write_half, &hello).await?;

    // A single writer task serializes responses from concurrent dispatches.
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            if proto::write_frame(&mut write_half, &response).await.is_err() {
                break;
            }
        }
    });

    let result = connection_loop(&inner, &mut reader, &response_tx).await;
    drop(response_tx);
    let _ = writer.await;
    result
}

async fn connection_loop(
    inner: &Arc<ServerInner>,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    response_tx: &mpsc::Sender<Response>,
) -> LabResult<()> {
    while let Some(request) = proto::read_frame::<_, Request>(reader).await? {
        let id = request.id;
        match request.op {
            RequestOp::Describe => {
                respond(
                    response_tx,
                    Response {
                        id,
                        body: ResponseBody::Drivers {
                            drivers: inner.statuses(),
                        },
                    },
                )
                .await;
            }
            RequestOp::Ping => {
                respond(response_tx, ok_response(id, ParamValue::Null)).await;
            }
            RequestOp::Shutdown => {
                info!("cooperative shutdown requested by client");
                respond(response_tx, ok_response(id, ParamValue::Null)).await;
                let _ = inner.shutdown_tx.send(true);
            }
            RequestOp::Publish { .. } | RequestOp::Subscribe { .. } => {
                let err = LabError::Invocation {
                    method: "publish/subscribe".to_string(),
                    message: "not an instrument-server operation".to_string(),
                };
                respond(response_tx, err_response(id, &err)).await;
            }
            RequestOp::Call {
                driver,
                method,
                args,
            } => {
                dispatch(inner, response_tx, id, &driver, DriverOp::Call { method, args }).await;
            }
            RequestOp::Get { driver, attribute } => {
                dispatch(inner, response_tx, id, &driver, DriverOp::Get { attribute }).await;
            }
            RequestOp::Set {
                driver,
                attribute,
                value,
            } => {
                dispatch(
                    inner,
                    response_tx,
                    id,
                    &driver,
                    DriverOp::Set { attribute, value },
                )
                .await;
            }
        }
    }
    Ok(())
}

/// Enqueues a driver operation in arrival order, then forwards the result to
/// the connection writer from a separate task so slow drivers do not stall
/// requests for other drivers on the same connection.
async fn dispatch(
    inner: &Arc<ServerInner>,
    response_tx: &mpsc::Sender<Response>,
    id: u64,
    driver: &str,
    op: DriverOp,
) {
    let Some(entry) = inner.drivers.get(driver) else {
        let err = LabError::UnknownDriver(driver.to_string());
        respond(response_tx, err_response(id, &err)).await;
        return;
    };

    let Some(queue) = &entry.queue else {
        let (health, error) = entry.health.get();
        let err = match health {
            DriverHealth::Failed => LabError::DriverInit {
                driver: driver.to_string(),
                message: error.unwrap_or_else(|| "open failed".to_string()),
            },
            _ => LabError::ShuttingDown,
        };
        respond(response_tx, err_response(id, &err)).await;
        return;
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if queue
        .send(DriverRequest {
            op,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        respond(response_tx, err_response(id, &LabError::ShuttingDown)).await;
        return;
    }

    let response_tx = response_tx.clone();
    let call_timeout = inner.call_timeout;
    tokio::spawn(async move {
        let response = match tokio::time::timeout(call_timeout, reply_rx).await {
            Ok(Ok(Ok(value))) => ok_response(id, value),
            Ok(Ok(Err(e))) => err_response(id, &e),
            Ok(Err(_)) => err_response(id, &LabError::ShuttingDown),
            // The driver operation keeps running in its worker; only the
            // caller's wait is bounded.
            Err(_) => err_response(id, &LabError::Timeout(call_timeout)),
        };
        let _ = response_tx.send(response).await;
    });
}

async fn respond(response_tx: &mpsc::Sender<Response>, response: Response) {
    let _ = response_tx.send(response).await;
}

fn ok_response(id: u64, value: ParamValue) -> Response {
    Response {
        id,
        body: ResponseBody::Ok { value },
    }
}

fn err_response(id: u64, err: &LabError) -> Response {
    Response {
        id,
        body: ResponseBody::Err {
            error: WireError::from(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, Settings};
    use crate::driver::mock::MockDriver;

    fn test_settings(driver_names: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.server.listen_addr = "127.0.0.1:0".to_string();
        for name in driver_names {
            settings.drivers.push(DriverConfig {
                name: (*name).to_string(),
                kind: "mock".to_string(),
                connection_params: Default::default(),
            });
        }
        settings
    }

    #[tokio::test]
    async fn test_partial_failure_startup() {
        let mut registry = DriverRegistry::empty();
        registry.register("mock", |name| {
            if name == "broken" {
                Box::new(MockDriver::new(name).failing_open())
            } else {
                Box::new(MockDriver::new(name))
            }
        });

        let settings = test_settings(&["good", "broken"]);
        let server = InstrumentServer::start(&settings, &registry).await.unwrap();

        assert_eq!(server.failed_drivers(), &["broken".to_string()]);
        let statuses = server.driver_statuses();
        assert_eq!(statuses.len(), 2);
        let broken = statuses.iter().find(|s| s.name == "broken").unwrap();
        assert_eq!(broken.health, DriverHealth::Failed);
        let good = statuses.iter().find(|s| s.name == "good").unwrap();
        assert_eq!(good.health, DriverHealth::Available);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_all_drivers_independently() {
        let mut registry = DriverRegistry::empty();
        registry.register("mock", |name| {
            if name == "stubborn" {
                Box::new(MockDriver::new(name).failing_close())
            } else {
                Box::new(MockDriver::new(name))
            }
        });

        let settings = test_settings(&["a", "stubborn", "b"]);
        let server = InstrumentServer::start(&settings, &registry).await.unwrap();
        let statuses_before = server.driver_statuses();
        assert!(statuses_before
            .iter()
            .all(|s| s.health == DriverHealth::Available));

        server.stop().await;
        // stop consumed the server; the invariant under test is that a close
        // failure on "stubborn" did not panic or abort the others, which the
        // worker health transitions assert in the integration tests.
    }
}
