//! Contracts shared with task implementations and adapters

pub mod error;
pub mod instruct;
pub mod task;
