//! Test infrastructure for Pulse.
//!
//! Provides event fixtures, an in-memory pipeline harness driven by a
//! manual clock, PostgreSQL helpers for `#[ignore]`d database tests, and
//! proptest strategies.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod env;
pub mod fixtures;
pub mod property;

pub use database::TestDatabase;
pub use env::{TestEnv, TestEnvBuilder};
pub use fixtures::EventBuilder;
pub use pulse_core::{Clock, TestClock};
