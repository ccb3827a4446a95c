//! # organ-bridge
//!
//! A local bridge between the organs (an external process that periodically
//! writes `telemetry.json` and `blackboard.md`) and remote consumers.
//!
//! - [`push`]: background replication of the snapshot to a collector.
//! - [`session`]: per-connection live streaming over WebSocket.
//! - [`gateway`]: bearer-authenticated dispatch of a closed command set.
//! - [`state`]: uncached read access to the organs' artifacts.
//! - [`web`]: HTTP routing and process composition.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pacer;
pub mod push;
pub mod session;
pub mod state;
pub mod web;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use gateway::{CommandGateway, CommandOutcome, CommandRequest};
pub use state::{FileStateStore, NotFound, Snapshot, StateStore, StatusDocument};
