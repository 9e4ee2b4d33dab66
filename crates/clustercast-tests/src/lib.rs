//! Clustercast test & validation infrastructure.
//!
//! Scenario, loss-injection, and property tests for the transport crate,
//! built around an in-process loopback cluster harness: one master and N
//! slaves in the same process, talking over 127.0.0.1 with per-test port
//! allocation.

pub mod harness;
pub mod loss_tests;
pub mod proptest_transport;

pub use harness::{run_within, TestCluster};
