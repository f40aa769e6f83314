//! Coordinator core of a request-telemetry statistics aggregation service.
//!
//! Parsed packet batches from an upstream repacker are fanned out to a
//! dynamic set of independently configured reports, each hosted on its own
//! worker. A synchronous in-process control plane manages report lifecycles
//! and extracts immutable snapshots of their state.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod globals;
pub mod health;
pub mod report;
pub mod ticker;
