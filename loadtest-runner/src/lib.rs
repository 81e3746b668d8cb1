//! Runs load tests against an Impala cluster.
//!
//! A run is described by a [`Config`](config::Config): the cluster to connect to, how many
//! concurrent users to start, and which [scenario](scenarios) they execute. Queries are read
//! from a directory of `.sql` files, see [`sql`]. When all users are done, the aggregated
//! results are printed and optionally exported by [`report`].
//!
//! Independently of load tests, [`confirm`] checks that a cluster under test returns the same
//! results as a reference cluster.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod confirm;
pub mod observability;
pub mod report;
pub mod scenarios;
pub mod sql;
