//! Network front-end for the data hub.
//!
//! Speaks the same newline-JSON framing as the instrument server: producers
//! send `publish` requests (acked with the assigned sequence number), and
//! observers send `subscribe` after which records arrive as unsolicited
//! frames. Per-subscriber isolation comes from the hub's bounded queues; a
//! slow TCP peer backpressures only its own forwarding task.

use crate::config::Settings;
use crate::data::DataHub;
use crate::driver::ParamValue;
use crate::error::{LabError, LabResult};
use crate::proto::{
    self, Hello, Request, RequestOp, Response, ResponseBody, ServiceKind, WireError,
    PROTOCOL_VERSION, UNSOLICITED,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A running data server.
pub struct DataServer {
    hub: Arc<DataHub>,
    instance_id: Uuid,
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl DataServer {
    /// Binds the listener and starts serving the hub.
    pub async fn start(settings: &Settings) -> LabResult<Self> {
        let hub = DataHub::new(&settings.data_server);
        Self::start_with_hub(settings, hub).await
    }

    /// Starts the front-end over an existing hub, so in-process producers and
    /// network clients share streams.
    pub async fn start_with_hub(settings: &Settings, hub: Arc<DataHub>) -> LabResult<Self> {
        let listener = TcpListener::bind(&settings.data_server.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let instance_id = Uuid::new_v4();
        info!(%local_addr, %instance_id, "data server starting");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let accept_hub = hub.clone();
        let accept_shutdown = shutdown_tx.clone();
        let accept_task = tokio::spawn(async move {
            let mut connections = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "data client connected");
                                let hub = accept_hub.clone();
                                let shutdown = accept_shutdown.clone();
                                connections.spawn(async move {
                                    if let Err(e) =
                                        handle_connection(hub, shutdown, instance_id, stream).await
                                    {
                                        warn!(%peer, error = %e, "data connection dropped");
                                    }
                                });
                            }
                            Err(e) => error!(error = %e, "accept failed"),
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
        });

        Ok(Self {
            hub,
            instance_id,
            local_addr,
            accept_task: Some(accept_task),
            shutdown_tx,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identity of this server process.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The hub behind this front-end.
    pub fn hub(&self) -> Arc<DataHub> {
        self.hub.clone()
    }

    /// Resolves when a client requests a cooperative shutdown.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops accepting, then wakes every subscriber with end-of-stream.
    pub async fn stop(mut self) {
        info!("data server stopping");
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.hub.shutdown();
        info!("data server stopped");
    }
}

async fn handle_connection(
    hub: Arc<DataHub>,
    shutdown: watch::Sender<bool>,
    instance_id: Uuid,
    stream: TcpStream,
) -> LabResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let hello = Hello {
        service: ServiceKind::Data,
        instance_id,
        version: PROTOCOL_VERSION,
        drivers: Vec::new(),
    };
    proto::write_frame(&mut write_half, &hello).await?;

    let (response_tx, mut response_rx) = mpsc::channel::<Response>(64);
    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            if proto::write_frame(&mut write_half, &response).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders = HashMap::new();
    let result = connection_loop(&hub, &shutdown, &mut reader, &response_tx, &mut forwarders).await;
    for (_, task) in forwarders.drain() {
        task.abort();
    }
    drop(response_tx);
    let _ = writer.await;
    result
}

async fn connection_loop(
    hub: &Arc<DataHub>,
    shutdown: &watch::Sender<bool>,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    response_tx: &mpsc::Sender<Response>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
) -> LabResult<()> {
    while let Some(request) = proto::read_frame::<_, Request>(reader).await? {
        let id = request.id;
        let response = match request.op {
            RequestOp::Publish { record } => match hub.publish(record) {
                Ok(seq) => ok_response(id, ParamValue::Int(seq as i64)),
                Err(e) => err_response(id, &e),
            },
            RequestOp::Subscribe { stream, backlog } => match hub.subscribe(&stream, backlog) {
                Ok(mut subscription) => {
                    let forward_tx = response_tx.clone();
                    let task = tokio::spawn(async move {
                        while let Some(record) = subscription.recv().await {
                            let frame = Response {
                                id: UNSOLICITED,
                                body: ResponseBody::Record { record },
                            };
                            if forward_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    });
                    // A repeat subscribe replaces the prior delivery task.
                    if let Some(prior) = forwarders.insert(stream, task) {
                        prior.abort();
                    }
                    ok_response(id, ParamValue::Null)
                }
                Err(e) => err_response(id, &e),
            },
            RequestOp::Ping => ok_response(id, ParamValue::Null),
            RequestOp::Describe => Response {
                id,
                body: ResponseBody::Drivers {
                    drivers: Vec::new(),
                },
            },
            RequestOp::Shutdown => {
                info!("cooperative shutdown requested by data client");
                let _ = shutdown.send(true);
                ok_response(id, ParamValue::Null)
            }
            RequestOp::Call { .. } | RequestOp::Get { .. } | RequestOp::Set { .. } => {
                let err = LabError::Invocation {
                    method: "call/get/set".to_string(),
                    message: "not a data-server operation".to_string(),
                };
                err_response(id, &err)
            }
        };
        if response_tx.send(response).await.is_err() {
            break;
        }
    }
    Ok(())
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
