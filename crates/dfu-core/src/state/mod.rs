//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, run_machine};
pub use machine::{DfuState, StateMachineContext};
