//! # Converge Client
//!
//! Keeps a device's local replicas in sync with a Converge server.
//!
//! Local writes are applied immediately through `converge-engine`, stored
//! as pending deltas and pushed by a debounced sync. Among the contexts of
//! a device (tabs, windows, workers) one leader is elected through a
//! heartbeat lease; only the leader talks to the server and it relays what
//! it receives to the others over the [`TabBus`].
//!
//! ```no_run
//! use converge_client::{ClientConfig, Device, SyncCoordinator, WebSocketTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> converge_client::Result<()> {
//! let device = Device::in_memory("device_1");
//! let config = ClientConfig::new("ws://localhost:3000/sync", "session_1");
//! let coordinator = SyncCoordinator::start("tab_1", config, device, Arc::new(WebSocketTransport));
//!
//! coordinator.set("todos", &[], "title", json!("Buy milk"))?;
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod leader;
pub mod store;
pub mod transport;

pub use backoff::Backoff;
pub use bus::{TabBus, TabEnvelope, TabMessage};
pub use config::ClientConfig;
pub use coordinator::{Device, SyncCoordinator, SyncStatus};
pub use error::{Error, Result, TransportError};
pub use leader::{LeaderElection, Lease, LeaseStore, MemoryLeaseStore};
pub use store::{ClientStore, MemoryStore};
pub use transport::{Link, Transport, WebSocketTransport};
