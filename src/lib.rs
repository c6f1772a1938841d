//! storyline-rs: a process orchestration engine
//!
//! Stories are graphs of service tasks, gateways and sub-processes. They
//! are preheated once into an executable form and then fired any number of
//! times, each run walking the graph on a bounded worker pool.

pub mod sdk;
pub mod storyline;
