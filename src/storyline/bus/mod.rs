// SPDX-License-Identifier: MIT

//! Scope data bus
//!
//! Every run owns three path-addressed scopes:
//! - `req`: the run input
//! - `sta`: accumulated results, each path written once
//! - `var`: working data, copied per concurrent branch

mod scope;
mod store;
mod view;

pub use scope::{get_in, set_in, ScopeKind, ScopePath, Segment};
pub use store::ScopeDataBus;
pub use view::{ScopeOperator, ScopeView};
