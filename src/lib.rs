//! Networked instrument control for laboratory setups.
//!
//! The crate splits into a few layers:
//!
//! - [`driver`]: the [`Driver`](driver::Driver) capability trait, the factory
//!   [`registry`](driver::registry), and simulated instruments.
//! - [`server`]: the instrument server that hosts drivers behind a TCP
//!   endpoint, serializing calls per driver while running drivers
//!   concurrently.
//! - [`data`]: the in-process [`DataHub`](data::DataHub) pub/sub fabric and
//!   the [`DataServer`](data::server::DataServer) that exposes it on the
//!   network.
//! - [`tunnel`]: supervised port forwards to instrument servers on other
//!   machines, with heartbeats and bounded reconnection.
//! - [`client`]: typed clients for both servers plus the
//!   [`InstrumentManager`](client::registry::InstrumentManager), which
//!   resolves driver names across gateways and survives server restarts.
//!
//! Everything on the wire is the newline-delimited JSON protocol in [`proto`].

pub mod client;
pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod logging;
pub mod proto;
pub mod server;
pub mod tunnel;

pub use config::Settings;
pub use error::{LabError, LabResult};
