//! Edgeward: authorization and session-admission core for a zero-trust
//! network control plane.
//!
//! Identities, services, edge routers and posture checks are related by
//! attribute-based policies. The crate maintains the policy link index,
//! answers reachability questions, evaluates endpoint posture and issues
//! sessions idempotently. All mutations of replicated entities flow through
//! a [`replication::Replicator`].
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;

pub mod roles;
pub mod store;
pub mod types;

pub mod replication;

pub mod posture;
pub mod reachability;
pub mod services;

pub mod activity;
pub mod admission;
pub mod advisor;
pub mod api_sessions;
pub mod cascade;

pub mod env;

pub use env::Env;
pub use error::{AdmissionError, ErrorCode, FieldError, ReplicationError, StoreError};
