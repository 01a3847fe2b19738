//! Endpoint state restoration for a container-networking policy agent.
//!
//! When the agent restarts, the workloads it manages keep running; tearing
//! their network attachments down and recreating them would break every
//! connection on the node. This crate rebuilds the agent's in-memory
//! endpoint state from the per-endpoint snapshots the previous process
//! persisted, re-establishes each endpoint's security identity, and drives
//! the datapath regeneration that syncs the recovered state back to the
//! host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               RestoreManager                 │
//! │  partition dirs → load state → rebuild EPs  │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼  map of id → Endpoint
//! ┌─────────────────────────────────────────────┐
//! │         RestoreDriver (per endpoint)        │
//! │  ifindex → identity → metadata → datapath   │
//! └─────────────────────────────────────────────┘
//!          │               │              │
//!          ▼               ▼              ▼
//!   ┌────────────┐  ┌────────────┐  ┌──────────┐
//!   │ Identity   │  │ Controller │  │ Datapath │
//!   │ Allocator  │  │  Manager   │  │  (build) │
//!   └────────────┘  └────────────┘  └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use netwarden::config::AgentConfig;
//! use netwarden::endpoint::ParseContext;
//! use netwarden::node::HostEndpointRegistry;
//! use netwarden::options::endpoint_mutable_options;
//! use netwarden::restore::RestoreManager;
//! use std::sync::Arc;
//!
//! let config = AgentConfig::new("/var/run/netwarden");
//! let parse_ctx = ParseContext {
//!     config: config.clone(),
//!     option_library: Arc::new(endpoint_mutable_options()),
//! };
//! let host_registry = Arc::new(HostEndpointRegistry::new());
//!
//! let manager = RestoreManager::new(&config.state_dir, parse_ctx, host_registry);
//! let dir_names = manager.scan_state_dir().expect("scan state directory");
//! let endpoints = manager.read_endpoints_from_dirs(&dir_names);
//! // Hand `endpoints` to a RestoreDriver to re-establish identities and
//! // regenerate the datapath, one concurrent task per endpoint.
//! ```
//!
//! # Crash consistency
//!
//! Snapshot writers stage updates in a `<id>_next` directory and atomically
//! rename it over `<id>`. The restore pass therefore treats a suffixed
//! directory with an unsuffixed sibling as a discardable leftover and a
//! suffixed directory alone as the authoritative copy, so a crash at any
//! point of the persist protocol leaves a recoverable state directory.
//!
//! # Failure isolation
//!
//! Every failure during restore is scoped to one endpoint: unreadable or
//! malformed directories are skipped, endpoints deleted mid-restore abort
//! quietly, and a failed datapath build marks only that endpoint as failed.
//! The agent always comes up with whatever subset of endpoints it could
//! recover.

pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod fqdn;
pub mod identity;
pub mod labels;
pub mod node;
pub mod options;
pub mod regeneration;
pub mod restore;
pub mod types;

pub use config::AgentConfig;
pub use endpoint::{Endpoint, ParseContext, SerializableEndpoint};
pub use error::{Error, Result};
pub use restore::{RestoreDriver, RestoreManager, RestoreStats};
pub use types::{EndpointId, EndpointState, IdentityId};
