//! The interpreter core: call stacks, dispatch, exception unwinding and
//! cooperative cancellation.

pub mod cancel;
pub mod frame;
pub mod interpreter;
mod ops;
pub mod unwind;

pub use cancel::CancelToken;
pub use frame::{CallFrame, CallStack};
pub use interpreter::{ExecState, Interpreter};
pub use unwind::Exception;
