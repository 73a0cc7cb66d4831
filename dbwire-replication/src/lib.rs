//! Replication groups for dbwire clients.
//!
//! A [`Group`] is a named set of endpoints serving the same data. The
//! [`FailoverManager`] picks an endpoint for each request, opens sessions
//! against it and moves on to the next candidate when a server cannot be
//! reached. Unreachable endpoints are probed in the background until they
//! accept connections again.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod failover;
pub mod group;

pub use config::{ConfigError, EndpointConfig, GroupConfig, ReplicationConfig};
pub use endpoint::{Endpoint, EndpointRole};
pub use error::ReplicationError;
pub use failover::FailoverManager;
pub use group::{EndpointSelector, Group, SelectionStrategy, SelectorRegistry};
