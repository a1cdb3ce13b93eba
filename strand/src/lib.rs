//! An interpreter for linked bytecode modules.
//!
//! Guest code runs in fibers, each with a private heap, multiplexed over a
//! small pool of worker threads. Every op answers with a [`Step`]; an op
//! that needs the result of a nested call pushes a child [`Frame`] and
//! attaches a continuation to it instead of blocking, so a suspended call
//! stack costs no thread.

mod call_chain;
mod container;
mod error;
mod exception;
mod fiber;
mod frame;
mod future;
mod heap;
mod interpreter;
mod native;
mod runtime;
mod scheduler;
mod supervisor;
mod types;
mod value;

pub use call_chain::{CallChain, CallChainCache};
pub use container::{ClassId, ClassInfo, Container, MAX_FIELDS, MAX_REGISTERS, MethodId, MethodInfo};
pub use error::{Fault, HostError, LoadError, RuntimeError};
pub use exception::{Exception, ExceptionKind};
pub use fiber::{FiberId, FiberShared, FiberState, ServiceProxy};
pub use frame::{Continuation, Ctx, Frame, Step};
pub use future::{FutureCell, FutureRef, FutureResult};
pub use heap::{Heap, HeapObject};
pub use native::{NATIVE_METHODS, NativeContext, NativeFn, NativeMethod, NativeRegistry, NativeType};
pub use runtime::{Runtime, RuntimeConfig};
pub use scheduler::{Runner, ScaleConfig, Scheduler, WorkerId};
pub use supervisor::{FiberOutcome, FiberReport, Supervisor};
pub use types::TypeRef;
pub use value::{Deferred, FrozenObject, HeapRef, PendingCall, Portable, Value};

pub(crate) use frame::chain;
