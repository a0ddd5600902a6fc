//! Coordination Hub for the Starlight Protocol.
//!
//! The Hub is the central process of a browser-automation mission: it owns
//! the page, serializes a command queue from one Intent client, and runs a
//! pre-execution handshake with registered Sentinels before every command.

pub mod auth;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod messages;
pub mod queue;
pub mod quorum;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};
pub use hub::Hub;

/// Wire protocol version advertised to participants at registration.
pub const PROTOCOL_VERSION: &str = "1.0";
/// Hub crate version, surfaced on `/health`.
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");
