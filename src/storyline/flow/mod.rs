//! Process graph model

mod element;
mod walk;

pub use element::{
    FlowIdx, Guard, IterationDirective, Node, NodeIdx, NodeKind, ProcessGraph, ResourceLimit,
    SequenceFlow, ServiceTask, SubProcess,
};
pub use walk::{walk, JoinCounter, Walk};
