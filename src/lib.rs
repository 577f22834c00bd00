//! Change-data-capture control plane and per-database consumption engine
//! for PostgreSQL replication sets.
//!
//! A cluster is a named group of Postgres databases plus a coordination
//! store holding the cluster's configuration. An administrator declares
//! *replication sets* — subsets of member databases and the tables to
//! capture from them — via [`admin`]; [`trigger`] installs the row-level
//! triggers that turn ordinary writes into a change stream, and
//! [`consumer`]/[`coordinator`] run the per-database capture loop that
//! reads that stream off PGQ and hands batches downstream through
//! [`validator`], [`batched`], and [`publisher`].

pub mod acquire;
pub mod admin;
pub mod batched;
pub mod bootstrap;
pub mod cluster;
pub mod codec;
pub mod consumer;
pub mod coordination_store;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod pgq;
pub mod publisher;
pub mod settings;
pub mod trigger;
pub mod validator;
pub mod wire;

pub use cluster::Cluster;
pub use error::{RelsetError, RelsetErrorKind};
pub use settings::Settings;
