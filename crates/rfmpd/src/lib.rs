//! RFMP store-and-forward daemon.
//!
//! Wires the sans-IO protocol crates into a running node: a TCP connector to
//! the KISS TNC, a persistent store (redb in production, in-memory for
//! tests), and the orchestrator that owns the ingest handlers and the four
//! background loops (sync, cleanup, transmission, connector events).
//!
//! The HTTP/WebSocket surface lives outside this crate; it drives the
//! daemon through [`Daemon::send_message`], the query accessors, and the
//! [`Daemon::subscribe`] push stream.

pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod store;
pub mod tnc;

pub use config::Config;
pub use daemon::{Daemon, DaemonStatus, SendMessage};
pub use error::DaemonError;
pub use events::{ClientMessage, PushEvent};
pub use store::{MemoryStore, RedbStore, Store};
pub use tnc::{TncConfig, TncConnector, TncEvent};
