//! gridbroker — subtask leasing engine for distributed GPU compute.

pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod subtasks;
pub mod tasks;
