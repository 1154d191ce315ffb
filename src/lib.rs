//! Per-cycle active/reactive power distribution across nested clusters of
//! energy storage systems.
//!
//! A cycle is opened with [`controller::CycleScheduler::initialize_cycle`] on
//! a topology snapshot, controllers add linear constraints, and
//! [`controller::CycleScheduler::run_cycle`] solves, rounds and dispatches
//! the set-points through an [`hardware::EssWriter`].

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod optimizer;
pub mod telemetry;
