//! Runtime: fragments, worker pool, run handles and the story engine

mod context;
mod fragment;
mod handle;
mod limiter;
mod pool;
mod story;
mod traversal;

pub use context::{ContextScope, FragmentContext};
pub use fragment::{FragmentMode, FragmentReport, FragmentState, FragmentTask, RunEnv};
pub use handle::{FragmentStats, RunHandle};
pub use limiter::{AcquireContext, AcquireDecision, AcquireFailStrategy};
pub use pool::{WorkerPool, WorkerSlot};
pub use story::{RunStatus, StoryEngine, StoryRequest, StoryResult};
pub use traversal::Cursor;
