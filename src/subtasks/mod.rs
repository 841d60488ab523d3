//! Subtask leasing and lifecycle — the core of the broker.

pub mod engine;
pub mod heartbeat;
pub mod lifecycle;
pub mod model;
pub mod routes;
