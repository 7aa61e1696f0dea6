//! Wire protocol shared by the instrument server, data server, and clients.
//!
//! Framing is newline-delimited JSON: every frame is one serde-serialized
//! object followed by `\n`. On connect the server sends a [`Hello`] line
//! carrying its service kind, a per-process instance UUID, and the drivers it
//! currently advertises. After that the client sends [`Request`] frames with
//! monotonically increasing ids and the server answers each with a
//! [`Response`] carrying the same id. Subscription deliveries are unsolicited
//! [`Response`] frames with id [`UNSOLICITED`].
//!
//! The instance UUID is what lets a client detect that "the same host:port"
//! is now a different server process, so a cached handle is never silently
//! reused against a restarted server.

use crate::driver::{DriverHealth, ParamValue};
use crate::error::{LabError, LabResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Protocol revision; bumped on incompatible frame changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request id used for unsolicited server-to-client frames.
pub const UNSOLICITED: u64 = 0;

/// Which service a connection landed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Instrument server hosting drivers.
    Instrument,
    /// Data server (pub/sub hub).
    Data,
}

/// First frame a server sends on every new connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    /// Service behind this port.
    pub service: ServiceKind,
    /// Identity of this server process. Changes on restart.
    pub instance_id: Uuid,
    /// Protocol revision spoken by the server.
    pub version: u32,
    /// Drivers this server currently holds, with health. Empty for the data
    /// server.
    pub drivers: Vec<DriverStatus>,
}

/// Advertised name and health of one driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverStatus {
    /// Driver alias, unique within its server.
    pub name: String,
    /// Current health.
    pub health: DriverHealth,
    /// Failure description when health is not `Available`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A client-to-server frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen id echoed in the matching [`Response`].
    pub id: u64,
    /// The operation.
    #[serde(flatten)]
    pub op: RequestOp,
}

/// Operations understood by the servers. Instrument-only and data-only
/// operations are rejected with an invocation error by the other service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestOp {
    /// Invoke a driver method.
    Call {
        /// Target driver alias.
        driver: String,
        /// Method name.
        method: String,
        /// Typed arguments.
        #[serde(default)]
        args: Vec<ParamValue>,
    },
    /// Read a driver attribute.
    Get {
        /// Target driver alias.
        driver: String,
        /// Attribute name.
        attribute: String,
    },
    /// Write a driver attribute.
    Set {
        /// Target driver alias.
        driver: String,
        /// Attribute name.
        attribute: String,
        /// New value.
        value: ParamValue,
    },
    /// Report every driver with its health.
    Describe,
    /// No-op round trip, used for tunnel heartbeats and handle validation.
    Ping,
    /// Cooperative shutdown of the server process.
    Shutdown,
    /// Push one measurement record into the hub.
    Publish {
        /// The record; `seq` is assigned by the hub.
        record: Record,
    },
    /// Subscribe this connection to a stream. Deliveries arrive as
    /// unsolicited `record` frames.
    Subscribe {
        /// Stream name.
        stream: String,
        /// Replay the bounded backlog before live records.
        #[serde(default)]
        backlog: bool,
    },
}

/// A server-to-client frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers, or [`UNSOLICITED`].
    pub id: u64,
    /// Outcome.
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Outcome payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Success, with the operation's return value (`null` for unit ops).
    Ok {
        /// Return value.
        value: ParamValue,
    },
    /// Answer to `describe`.
    Drivers {
        /// Every driver with health, failed ones included.
        drivers: Vec<DriverStatus>,
    },
    /// One subscription delivery.
    Record {
        /// The record, in publish order for its stream.
        record: Record,
    },
    /// Failure.
    Err {
        /// The error.
        error: WireError,
    },
}

/// A measurement record as carried on the wire.
///
/// Timestamps are producer-supplied epoch **microseconds** (UTC). The hub
/// forwards records verbatim and assigns `seq` in publish order per stream;
/// it does not inspect or reorder by timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stream this record belongs to.
    pub stream: String,
    /// Publish-order sequence number within the stream, assigned by the hub.
    #[serde(default)]
    pub seq: u64,
    /// Producer timestamp, epoch microseconds UTC.
    pub timestamp_us: i64,
    /// Opaque payload; structured JSON, or bytes encoded by the producer.
    pub payload: serde_json::Value,
}

impl Record {
    /// A record on `stream` stamped with the current time.
    pub fn new(stream: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            stream: stream.into(),
            seq: 0,
            timestamp_us: chrono::Utc::now().timestamp_micros(),
            payload,
        }
    }
}

/// Error classes carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// Startup/configuration fault.
    Configuration,
    /// Driver failed to open.
    DriverInit,
    /// Driver call failed.
    Invocation,
    /// Attribute write rejected.
    Validation,
    /// No such driver on this server.
    UnknownDriver,
    /// No such stream (static-stream mode).
    UnknownStream,
    /// Bounded wait expired server-side.
    Timeout,
    /// Server is tearing down.
    ShuttingDown,
    /// Defect in the server itself.
    Internal,
}

/// Serializable error envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    /// Error class.
    pub kind: WireErrorKind,
    /// What the error is about: driver, method, attribute, or stream name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl From<&LabError> for WireError {
    fn from(err: &LabError) -> Self {
        let (kind, subject, message) = match err {
            LabError::Configuration(m) => (WireErrorKind::Configuration, None, m.clone()),
            LabError::DriverInit { driver, message } => (
                WireErrorKind::DriverInit,
                Some(driver.clone()),
                message.clone(),
            ),
            LabError::Invocation { method, message } => (
                WireErrorKind::Invocation,
                Some(method.clone()),
                message.clone(),
            ),
            LabError::Validation { attribute, message } => (
                WireErrorKind::Validation,
                Some(attribute.clone()),
                message.clone(),
            ),
            LabError::UnknownDriver(name) => (
                WireErrorKind::UnknownDriver,
                Some(name.clone()),
                format!("unknown driver '{name}'"),
            ),
            LabError::DriverNotFound(name) => (
                WireErrorKind::UnknownDriver,
                Some(name.clone()),
                format!("driver '{name}' not found"),
            ),
            LabError::UnknownStream(name) => (
                WireErrorKind::UnknownStream,
                Some(name.clone()),
                format!("unknown stream '{name}'"),
            ),
            LabError::Timeout(d) => (WireErrorKind::Timeout, None, format!("timed out after {d:?}")),
            LabError::ShuttingDown => (
                WireErrorKind::ShuttingDown,
                None,
                "server is shutting down".to_string(),
            ),
            other => (WireErrorKind::Internal, None, other.to_string()),
        };
        Self {
            kind,
            subject,
            message,
        }
    }
}

impl WireError {
    /// Reconstructs a [`LabError`] on the client side.
    pub fn into_error(self) -> LabError {
        let subject = self.subject.unwrap_or_default();
        match self.kind {
            WireErrorKind::Configuration => LabError::Configuration(self.message),
            WireErrorKind::DriverInit => LabError::DriverInit {
                driver: subject,
                message: self.message,
            },
            WireErrorKind::Invocation => LabError::Invocation {
                method: subject,
                message: self.message,
            },
            WireErrorKind::Validation => LabError::Validation {
                attribute: subject,
                message: self.message,
            },
            WireErrorKind::UnknownDriver => LabError::UnknownDriver(subject),
            WireErrorKind::UnknownStream => LabError::UnknownStream(subject),
            WireErrorKind::Timeout => LabError::RemoteCall(self.message),
            WireErrorKind::ShuttingDown => LabError::ShuttingDown,
            WireErrorKind::Internal => LabError::RemoteCall(self.message),
        }
    }
}

/// Writes one frame followed by a newline and flushes.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> LabResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection.
pub async fn read_frame<R, T>(reader: &mut R) -> LabResult<Option<T>>
where
    R: AsyncBufReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = Request {
            id: 7,
            op: RequestOp::Call {
                driver: "cwave".into(),
                method: "get_status".into(),
                args: vec![],
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["op"], "call");
        assert_eq!(json["driver"], "cwave");
    }

    #[test]
    fn test_record_round_trip() {
        let record = Record::new("wavelength", serde_json::json!({"nm": 637.2}));
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(back.timestamp_us > 0);
    }

    #[test]
    fn test_error_round_trip() {
        let err = LabError::Validation {
            attribute: "wavelength".into(),
            message: "out of range".into(),
        };
        let wire = WireError::from(&err);
        match wire.into_error() {
            LabError::Validation { attribute, message } => {
                assert_eq!(attribute, "wavelength");
                assert_eq!(message, "out of range");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framing_round_trip() {
        let mut buf = Vec::new();
        let req = Request {
            id: 1,
            op: RequestOp::Ping,
        };
        write_frame(&mut buf, &req).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let back: Request = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(matches!(back.op, RequestOp::Ping));
        let eof: Option<Request> = read_frame(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }
}
