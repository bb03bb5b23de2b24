//! # Ensign
//!
//! A single node event broker. Publishers stream events into topics over gRPC, the
//! dispatcher commits them with monotonically increasing RLIDs and fans them out to
//! subscriber streams, and committed events can be queried with EnSQL.
//!
//! The crate is the node itself: [`server::Server`] wires the stores, the dispatcher
//! and the interceptor chain together and serves the `ensign.v1beta1.Ensign` and
//! `grpc.health.v1.Health` services.

pub mod auth;
pub mod config;
pub mod context;
pub mod duplicates;
pub mod ensql;
pub mod events;
pub mod health;
pub mod info;
pub mod interceptors;
pub mod o11y;
pub mod pubsub;
pub mod query;
pub mod server;
pub mod status;
pub mod streams;
pub mod topics;

pub use config::Config;
pub use server::{Node, Server, ServerError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
