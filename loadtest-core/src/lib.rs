//! The core of the load-testing harness.
//!
//! Workers talk to the database under test through a [`QueryClient`](client::QueryClient).
//! Wrapping a client in a [`LoggedClient`](logged::LoggedClient) times every query and reports
//! exactly one success or failure [`Event`](events::Event) per call to an
//! [`EventSink`](events::EventSink), which is where statistics are aggregated.
//!
//! The remaining modules coordinate many concurrent workers:
//!
//! - [`nodes`] hands out cluster nodes in round-robin order,
//! - [`barrier`] holds back a measurement phase until every worker finished its setup,
//! - [`warmup`] makes sure a cache warmup runs on exactly one worker,
//! - [`staging`] drives a worker through setup, warmup, rendezvous and measurement,
//! - [`tasks`] runs weighted random tasks with wait times in between,
//! - [`swarm`] spawns and joins the workers themselves.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod barrier;
pub mod client;
pub mod error;
pub mod events;
pub mod logged;
pub mod nodes;
pub mod staging;
pub mod swarm;
pub mod tasks;
pub mod warmup;

pub use crate::client::{BoxedClient, ClientError, Query, QueryClient, Rows};
pub use crate::error::{BarrierTimeout, ConfigError, WorkerError};
pub use crate::events::{EventSink, Stats};
pub use crate::logged::LoggedClient;
