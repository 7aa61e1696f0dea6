//! Custom error types for the application.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of a distributed
//! instrument deployment, from configuration and I/O problems to per-driver
//! and per-transport faults.
//!
//! ## Error Taxonomy
//!
//! The variants map onto blast radii:
//!
//! - **`Configuration`**: semantic configuration errors, fatal at startup for
//!   the affected server only.
//! - **`DriverInit`**: one driver failed to open. Isolated; the server keeps
//!   serving its remaining drivers and reports the failure via `describe`.
//! - **`Invocation` / `Validation`**: a single call failed. Returned to the
//!   caller; the server and the driver stay up.
//! - **`UnknownDriver` / `DriverNotFound` / `UnknownStream`**: a naming or
//!   configuration mismatch. Caller-visible, never retried.
//! - **`TunnelLost`**: a forwarding session exhausted its reconnect budget.
//!   Escalated to every dependent of that tunnel, since it invalidates all
//!   in-flight operations on the transport.
//! - **`Timeout`**: a bounded wait expired. Caller-visible; the proxy layer
//!   retries transport-level timeouts at most once.
//! - **`RemoteCall`**: a transport-level failure that survived the proxy's
//!   single retry.
//!
//! With `#[from]` conversions, `LabError` composes with the `?` operator
//! throughout the crate; binaries map it to a process exit code via
//! [`LabError::exit_code`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Unified error type for servers, tunnels, drivers, and clients.
#[derive(Error, Debug)]
pub enum LabError {
    /// Semantic configuration error (invalid value, missing section).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A driver failed to open; other drivers on the server are unaffected.
    #[error("Driver '{driver}' failed to initialize: {message}")]
    DriverInit {
        /// Name of the driver that failed.
        driver: String,
        /// Underlying failure description.
        message: String,
    },

    /// A driver method call failed.
    #[error("Invocation of '{method}' failed: {message}")]
    Invocation {
        /// Method that was invoked.
        method: String,
        /// Underlying failure description.
        message: String,
    },

    /// An attribute write was rejected (out of range, read-only, wrong type).
    #[error("Validation failed for '{attribute}': {message}")]
    Validation {
        /// Attribute that was written.
        attribute: String,
        /// Why the value was rejected.
        message: String,
    },

    /// The addressed driver is not registered on this server.
    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),

    /// No registered gateway advertises a driver with this name.
    #[error("Driver '{0}' not found on any registered gateway")]
    DriverNotFound(String),

    /// Publish/subscribe against a stream the hub does not know (static mode).
    #[error("Unknown stream '{0}'")]
    UnknownStream(String),

    /// A forwarding session exhausted its reconnect budget.
    #[error("Tunnel to {0} lost")]
    TunnelLost(String),

    /// A bounded wait expired.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Transport-level failure that survived the proxy's single retry.
    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    /// Malformed frame on the wire.
    #[error("Wire protocol error: {0}")]
    Wire(#[from] serde_json::Error),

    /// Operation arrived while the server was tearing down.
    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Process exit codes for the CLI front-ends.
pub mod exit_code {
    /// Clean shutdown.
    pub const CLEAN: i32 = 0;
    /// Configuration error.
    pub const CONFIG: i32 = 1;
    /// One or more drivers failed to initialize.
    pub const DRIVER_INIT: i32 = 2;
    /// Fatal transport error.
    pub const TRANSPORT: i32 = 3;
}

impl LabError {
    /// Maps an error to the exit-code contract of the CLI front-ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            LabError::Configuration(_) => exit_code::CONFIG,
            LabError::DriverInit { .. } => exit_code::DRIVER_INIT,
            _ => exit_code::TRANSPORT,
        }
    }

    /// True for failures of the transport itself, as opposed to failures the
    /// far side reported. The proxy layer retries only these.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LabError::Io(_) | LabError::Timeout(_) | LabError::TunnelLost(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::DriverInit {
            driver: "cwave".to_string(),
            message: "no route to host".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Driver 'cwave' failed to initialize: no route to host"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(LabError::Configuration("bad port".into()).exit_code(), 1);
        assert_eq!(
            LabError::DriverInit {
                driver: "wavemeter".into(),
                message: "dll missing".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(LabError::TunnelLost("lab-pc".into()).exit_code(), 3);
    }

    #[test]
    fn test_transport_classification() {
        assert!(LabError::Timeout(std::time::Duration::from_secs(1)).is_transport());
        assert!(!LabError::UnknownDriver("laser".into()).is_transport());
        assert!(!LabError::Validation {
            attribute: "wavelength".into(),
            message: "out of range".into()
        }
        .is_transport());
    }
}
