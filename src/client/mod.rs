//! Client side of the wire protocol.
//!
//! [`Connection`] is the framed transport primitive: it owns one TCP
//! connection, matches responses to requests by id, and routes unsolicited
//! record frames to stream subscribers. [`InstrumentClient`] and
//! [`DataClient`] are thin typed wrappers; controller code usually goes
//! through the [`registry::InstrumentManager`] instead, which adds name
//! resolution and the single-retry policy.

pub mod registry;

use crate::driver::ParamValue;
use crate::error::{LabError, LabResult};
use crate::proto::{
    self, DriverStatus, Hello, Record, Request, RequestOp, Response, ResponseBody, UNSOLICITED,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Capacity of each subscription's client-side delivery channel.
const SUBSCRIPTION_BUFFER: usize = 256;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseBody>>>>;
type StreamRoutes = Arc<Mutex<HashMap<String, mpsc::Sender<Record>>>>;

/// One framed connection to an instrument or data server.
pub struct Connection {
    hello: Hello,
    endpoint: String,
    writer: OwnedWriteHalf,
    pending: PendingMap,
    routes: StreamRoutes,
    next_id: u64,
    timeout: Duration,
    read_task: JoinHandle<()>,
}

impl Connection {
    /// Connects and reads the server hello, all within `timeout`.
    pub async fn connect(endpoint: &str, timeout: Duration) -> LabResult<Self> {
        let connect = async {
            let stream = TcpStream::connect(endpoint).await?;
            stream.set_nodelay(true)?;
            let (read_half, writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let hello: Hello = proto::read_frame(&mut reader)
                .await?
                .ok_or_else(|| LabError::RemoteCall("server closed before hello".to_string()))?;
            Ok::<_, LabError>((reader, writer, hello))
        };
        let (reader, writer, hello) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| LabError::Timeout(timeout))??;
        debug!(endpoint, instance = %hello.instance_id, "connected");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routes: StreamRoutes = Arc::new(Mutex::new(HashMap::new()));
        let read_task = tokio::spawn(read_loop(reader, pending.clone(), routes.clone()));

        Ok(Self {
            hello,
            endpoint: endpoint.to_string(),
            writer,
            pending,
            routes,
            next_id: 1,
            timeout,
            read_task,
        })
    }

    /// Server hello captured at connect time.
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Identity of the server process behind this connection.
    pub fn instance_id(&self) -> Uuid {
        self.hello.instance_id
    }

    /// Endpoint this connection was dialed against.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one request and awaits its response within the timeout.
    pub async fn request(&mut self, op: RequestOp) -> LabResult<ResponseBody> {
        let id = self.next_id;
        self.next_id += 1;

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, reply_tx);
        }

        let frame = Request { id, op };
        if let Err(e) = proto::write_frame(&mut self.writer, &frame).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(LabError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection closed mid-request",
            ))),
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(LabError::Timeout(self.timeout))
            }
        }
    }

    /// Sends one request expecting a plain value result.
    pub async fn request_value(&mut self, op: RequestOp) -> LabResult<ParamValue> {
        match self.request(op).await? {
            ResponseBody::Ok { value } => Ok(value),
            ResponseBody::Err { error } => Err(error.into_error()),
            other => Err(LabError::RemoteCall(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// No-op round trip; also what tunnel heartbeats ride on.
    pub async fn ping(&mut self) -> LabResult<()> {
        self.request_value(RequestOp::Ping).await.map(|_| ())
    }

    /// Asks the server process to shut down cooperatively.
    pub async fn shutdown_server(&mut self) -> LabResult<()> {
        self.request_value(RequestOp::Shutdown).await.map(|_| ())
    }

    /// Registers a route for unsolicited records on `stream`.
    fn route_stream(&self, stream: &str) -> mpsc::Receiver<Record> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(stream.to_string(), tx);
        }
        rx
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn read_loop(
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    pending: PendingMap,
    routes: StreamRoutes,
) {
    loop {
        let frame: Option<Response> = match proto::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Some(response) = frame else { break };

        if response.id == UNSOLICITED {
            if let ResponseBody::Record { record } = response.body {
                let sender = routes
                    .lock()
                    .ok()
                    .and_then(|r| r.get(&record.stream).cloned());
                if let Some(sender) = sender {
                    // A full client-side buffer waits: hub-side isolation
                    // already protects producers and other subscribers.
                    if sender.send(record).await.is_err() {
                        if let Ok(mut r) = routes.lock() {
                            r.retain(|_, tx| !tx.is_closed());
                        }
                    }
                }
            }
            continue;
        }

        let reply = pending.lock().ok().and_then(|mut p| p.remove(&response.id));
        if let Some(reply) = reply {
            let _ = reply.send(response.body);
        }
    }
    // Connection gone: fail every in-flight request.
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}

/// Typed client for an instrument server.
pub struct InstrumentClient {
    conn: Connection,
}

impl InstrumentClient {
    /// Connects to an instrument server.
    pub async fn connect(endpoint: &str, timeout: Duration) -> LabResult<Self> {
        let conn = Connection::connect(endpoint, timeout).await?;
        Ok(Self { conn })
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Identity of the server process.
    pub fn instance_id(&self) -> Uuid {
        self.conn.instance_id()
    }

    /// Drivers advertised at connect time.
    pub fn advertised_drivers(&self) -> &[DriverStatus] {
        &self.conn.hello().drivers
    }

    /// Invokes a driver method.
    pub async fn call(
        &mut self,
        driver: &str,
        method: &str,
        args: Vec<ParamValue>,
    ) -> LabResult<ParamValue> {
        self.conn
            .request_value(RequestOp::Call {
                driver: driver.to_string(),
                method: method.to_string(),
                args,
            })
            .await
    }

    /// Reads a driver attribute.
    pub async fn get(&mut self, driver: &str, attribute: &str) -> LabResult<ParamValue> {
        self.conn
            .request_value(RequestOp::Get {
                driver: driver.to_string(),
                attribute: attribute.to_string(),
            })
            .await
    }

    /// Writes a driver attribute.
    pub async fn set(
        &mut self,
        driver: &str,
        attribute: &str,
        value: ParamValue,
    ) -> LabResult<()> {
        self.conn
            .request_value(RequestOp::Set {
                driver: driver.to_string(),
                attribute: attribute.to_string(),
                value,
            })
            .await
            .map(|_| ())
    }

    /// Full health report, failed drivers included.
    pub async fn describe(&mut self) -> LabResult<Vec<DriverStatus>> {
        match self.conn.request(RequestOp::Describe).await? {
            ResponseBody::Drivers { drivers } => Ok(drivers),
            ResponseBody::Err { error } => Err(error.into_error()),
            other => Err(LabError::RemoteCall(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// No-op round trip.
    pub async fn ping(&mut self) -> LabResult<()> {
        self.conn.ping().await
    }

    /// Asks the server to shut down cooperatively.
    pub async fn shutdown_server(&mut self) -> LabResult<()> {
        self.conn.shutdown_server().await
    }
}

/// Typed client for the data server.
pub struct DataClient {
    conn: Connection,
}

impl DataClient {
    /// Connects to a data server.
    pub async fn connect(endpoint: &str, timeout: Duration) -> LabResult<Self> {
        let conn = Connection::connect(endpoint, timeout).await?;
        Ok(Self { conn })
    }

    /// Publishes a payload on `stream`, stamped now. Returns the assigned
    /// sequence number.
    pub async fn publish(&mut self, stream: &str, payload: serde_json::Value) -> LabResult<u64> {
        self.publish_record(Record::new(stream, payload)).await
    }

    /// Publishes a prepared record.
    pub async fn publish_record(&mut self, record: Record) -> LabResult<u64> {
        let value = self
            .conn
            .request_value(RequestOp::Publish { record })
            .await?;
        value
            .as_i64()
            .map(|seq| seq as u64)
            .ok_or_else(|| LabError::RemoteCall("publish ack without sequence".to_string()))
    }

    /// Subscribes to `stream`; records arrive on the returned channel in
    /// publish order.
    pub async fn subscribe(
        &mut self,
        stream: &str,
        backlog: bool,
    ) -> LabResult<mpsc::Receiver<Record>> {
        let rx = self.conn.route_stream(stream);
        self.conn
            .request_value(RequestOp::Subscribe {
                stream: stream.to_string(),
                backlog,
            })
            .await?;
        Ok(rx)
    }

    /// No-op round trip.
    pub async fn ping(&mut self) -> LabResult<()> {
        self.conn.ping().await
    }
}
