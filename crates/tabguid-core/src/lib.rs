//! tabguid-core: durable identities for browser tabs
//!
//! Host tab ids are volatile: they change across browser restarts and get
//! reused after a tab closes. This crate assigns each tab a guid that
//! survives both, by matching returning tabs on strip position and a content
//! fingerprint.
//!
//! # Architecture
//!
//! ```text
//! Host events → EventRouter → TabRegistry → Matcher → RecordStore
//!                                  ↓                  (current / removed / prev)
//!                          PersistenceBridge → SnapshotStore (memory / json / sqlite)
//! ```
//!
//! # Modules
//!
//! - `guid`: random identity tokens
//! - `record`: tab records and the three partitions
//! - `query`: typed predicates over a partition
//! - `matcher`: reconciliation of observed tabs against history
//! - `persist`: ordered write-through of `current` to a store
//! - `store`: snapshot store backends
//! - `registry`: the registry service and its lifecycle
//! - `attributes`: per-tab annotations
//! - `router`: host event dispatch
//! - `host`: host collaborator traits and scripted mocks
//! - `config`: configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod attributes;
pub mod config;
pub mod error;
pub mod guid;
pub mod host;
pub mod logging;
pub mod matcher;
pub mod persist;
pub mod query;
pub mod record;
pub mod registry;
pub mod router;
pub mod store;

pub use error::{ConfigError, Error, RegistryError, Result, StoreError};
pub use guid::Guid;
pub use host::{TabId, TabInfo};
pub use record::{Observation, Partition, TabRecord};
pub use registry::TabRegistry;
pub use router::{EventRouter, HostEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
