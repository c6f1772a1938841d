// SPDX-License-Identifier: MIT

pub mod builder;
pub mod bus;
pub mod condition;
pub mod config;
pub mod engine;
pub mod flow;
pub mod instruct;
pub mod loader;
pub mod preheat;
pub mod registry;
pub mod role;
pub mod server;
pub mod types;
