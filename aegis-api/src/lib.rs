//! # AEGIS Control API
//!
//! REST surface for dashboards and operators: open incidents, query
//! derived state and event streams (every response carries the current
//! incident version for optimistic concurrency), trigger canned demo
//! scenarios, and inject Byzantine faults for chaos testing behind an
//! operator-role guard.

mod rest;
mod scenarios;

pub use rest::ControlApi;
pub use scenarios::demo_batch;
