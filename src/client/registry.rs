//! Driver-name resolution across gateways, with cached handles and a
//! single-retry invoke policy.
//!
//! Controller code registers one gateway per instrument server it can reach
//! (directly, or through a tunnel's local port) and addresses drivers purely
//! by name. The manager resolves a name to a [`ClientHandle`] bound to a
//! specific server *instance*: if that server restarts, the handle is stale
//! and the manager re-resolves instead of silently calling into a different
//! process that happens to own the same port.
//!
//! Transport-level failures are retried exactly once, after reconnecting and
//! re-resolving; application-level errors (validation, unknown method) are
//! returned untouched, since retrying them would re-issue a hardware command
//! that already executed or was already rejected.

use crate::client::Connection;
use crate::driver::{DriverHealth, ParamValue};
use crate::error::{LabError, LabResult};
use crate::proto::{DriverStatus, RequestOp, ResponseBody};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A resolved binding from a driver name to the server instance holding it.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    /// Driver alias.
    pub driver: String,
    /// Gateway endpoint ("host:port") serving the driver.
    pub endpoint: String,
    /// Identity of the server process the binding was resolved against.
    pub instance_id: Uuid,
}

/// Resolves driver names to live network locations and proxies calls.
pub struct InstrumentManager {
    endpoints: Vec<String>,
    connections: HashMap<String, Connection>,
    handles: HashMap<String, ClientHandle>,
    timeout: Duration,
}

impl InstrumentManager {
    /// Manager with no gateways and the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            endpoints: Vec::new(),
            connections: HashMap::new(),
            handles: HashMap::new(),
            timeout,
        }
    }

    /// Registers a gateway endpoint. For servers behind a tunnel this is the
    /// tunnel's local endpoint.
    pub fn register_gateway(&mut self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        if !self.endpoints.contains(&endpoint) {
            self.endpoints.push(endpoint);
        }
    }

    /// Registered gateway endpoints, in resolution order.
    pub fn gateways(&self) -> &[String] {
        &self.endpoints
    }

    /// Resolves `driver` to a handle, consulting the cache first.
    ///
    /// Each gateway probe is bounded by the request timeout, so resolution of
    /// a nonexistent name fails with [`LabError::DriverNotFound`] rather than
    /// hanging.
    pub async fn resolve(&mut self, driver: &str) -> LabResult<ClientHandle> {
        if let Some(handle) = self.handles.get(driver) {
            let still_valid = self
                .connections
                .get(&handle.endpoint)
                .map(|conn| conn.instance_id() == handle.instance_id)
                .unwrap_or(false);
            if still_valid {
                return Ok(handle.clone());
            }
            let endpoint = handle.endpoint.clone();
            self.invalidate(&endpoint);
        }

        for endpoint in self.endpoints.clone() {
            let conn = match self.connection(&endpoint).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(endpoint, error = %e, "gateway unreachable during resolve");
                    continue;
                }
            };
            let instance_id = conn.instance_id();
            let drivers = match describe(conn).await {
                Ok(drivers) => drivers,
                Err(e) => {
                    warn!(endpoint, error = %e, "describe failed during resolve");
                    self.invalidate(&endpoint);
                    continue;
                }
            };
            let found = drivers
                .iter()
                .any(|s| s.name == driver && s.health == DriverHealth::Available);
            if found {
                let handle = ClientHandle {
                    driver: driver.to_string(),
                    endpoint: endpoint.clone(),
                    instance_id,
                };
                self.handles.insert(driver.to_string(), handle.clone());
                return Ok(handle);
            }
        }
        Err(LabError::DriverNotFound(driver.to_string()))
    }

    /// Invokes a driver method through a handle, retrying once on a
    /// transport-level failure.
    pub async fn invoke(
        &mut self,
        handle: &ClientHandle,
        method: &str,
        args: Vec<ParamValue>,
    ) -> LabResult<ParamValue> {
        let op = RequestOp::Call {
            driver: handle.driver.clone(),
            method: method.to_string(),
            args,
        };
        self.with_retry(handle, op).await
    }

    /// Reads a driver attribute through a handle.
    pub async fn read(&mut self, handle: &ClientHandle, attribute: &str) -> LabResult<ParamValue> {
        let op = RequestOp::Get {
            driver: handle.driver.clone(),
            attribute: attribute.to_string(),
        };
        self.with_retry(handle, op).await
    }

    /// Writes a driver attribute through a handle.
    pub async fn write(
        &mut self,
        handle: &ClientHandle,
        attribute: &str,
        value: ParamValue,
    ) -> LabResult<()> {
        let op = RequestOp::Set {
            driver: handle.driver.clone(),
            attribute: attribute.to_string(),
            value,
        };
        self.with_retry(handle, op).await.map(|_| ())
    }

    /// Health report from every reachable gateway.
    pub async fn describe_all(&mut self) -> Vec<(String, LabResult<Vec<DriverStatus>>)> {
        let mut report = Vec::new();
        for endpoint in self.endpoints.clone() {
            let result = match self.connection(&endpoint).await {
                Ok(conn) => describe(conn).await,
                Err(e) => Err(e),
            };
            if result.is_err() {
                self.invalidate(&endpoint);
            }
            report.push((endpoint, result));
        }
        report
    }

    async fn with_retry(&mut self, handle: &ClientHandle, op: RequestOp) -> LabResult<ParamValue> {
        match self.try_op(handle, op.clone()).await {
            Err(e) if e.is_transport() => {
                warn!(
                    driver = %handle.driver,
                    endpoint = %handle.endpoint,
                    error = %e,
                    "transport failure; reconnecting and retrying once"
                );
                self.invalidate(&handle.endpoint);
                let fresh = match self.resolve(&handle.driver).await {
                    Ok(fresh) => fresh,
                    Err(resolve_err) => {
                        return Err(LabError::RemoteCall(format!(
                            "retry failed: {resolve_err}"
                        )))
                    }
                };
                self.try_op(&fresh, op)
                    .await
                    .map_err(|retry_err| match retry_err {
                        e if e.is_transport() => LabError::RemoteCall(e.to_string()),
                        other => other,
                    })
            }
            other => other,
        }
    }

    async fn try_op(&mut self, handle: &ClientHandle, op: RequestOp) -> LabResult<ParamValue> {
        let timeout = self.timeout;
        let conn = match self.connections.get_mut(&handle.endpoint) {
            Some(conn) => conn,
            None => {
                let conn = Connection::connect(&handle.endpoint, timeout).await?;
                self.connections.insert(handle.endpoint.clone(), conn);
                self.connections
                    .get_mut(&handle.endpoint)
                    .ok_or(LabError::ShuttingDown)?
            }
        };
        if conn.instance_id() != handle.instance_id {
            // The server behind this endpoint is a different process now;
            // fail fast instead of silently calling into it.
            return Err(LabError::RemoteCall(format!(
                "handle for '{}' is stale: server instance changed",
                handle.driver
            )));
        }
        conn.request_value(op).await
    }

    async fn connection(&mut self, endpoint: &str) -> LabResult<&mut Connection> {
        if !self.connections.contains_key(endpoint) {
            let conn = Connection::connect(endpoint, self.timeout).await?;
            self.connections.insert(endpoint.to_string(), conn);
        }
        self.connections
            .get_mut(endpoint)
            .ok_or(LabError::ShuttingDown)
    }

    fn invalidate(&mut self, endpoint: &str) {
        self.connections.remove(endpoint);
        self.handles.retain(|_, handle| handle.endpoint != endpoint);
    }
}

async fn describe(conn: &mut Connection) -> LabResult<Vec<DriverStatus>> {
    match conn.request(RequestOp::Describe).await? {
        ResponseBody::Drivers { drivers } => Ok(drivers),
        ResponseBody::Err { error } => Err(error.into_error()),
        other => Err(LabError::RemoteCall(format!(
            "unexpected response: {other:?}"
        ))),
    }
}
