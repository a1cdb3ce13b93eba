use std::{collections::VecDeque, fmt, sync::Arc};

use strand_bytecode::{Arg, Instruction};

use crate::{
    CallChain, Container, Deferred, ExceptionKind, Fault, FiberShared, FutureRef, Heap,
    HostError, MethodInfo, PendingCall, Value, runtime::Shared,
};

/// Outcome of dispatching one op, one native method or one continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Completed; continue with the following op.
    Next,
    /// Completed; continue at a resolved branch target.
    Jump(usize),
    /// A child frame is pending in [`Frame::next`]; this frame waits for it.
    Call,
    /// A fault is stored in the frame's exception slot.
    Exception,
    /// The frame finished with [`Frame::result`].
    Return,
}

/// Deferred completion work, run with the waiting frame once the frame it
/// was attached to has returned.
pub type Continuation = Box<dyn FnOnce(&mut Frame, &mut Ctx<'_>) -> Step + Send>;

/// What executing code may touch besides its own frame.
pub struct Ctx<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) fiber: &'a Arc<FiberShared>,
    pub(crate) rt: &'a Arc<Shared>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(heap: &'a mut Heap, fiber: &'a Arc<FiberShared>, rt: &'a Arc<Shared>) -> Self {
        Self { heap, fiber, rt }
    }

    pub fn container(&self) -> &'a Container {
        &self.rt.container
    }

    pub fn heap(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    pub(crate) fn rt(&self) -> &'a Arc<Shared> {
        self.rt
    }
}

/// Where a request's outermost frame delivers its outcome.
pub(crate) enum Reply {
    /// The body of an entry fiber; its end is the fiber's end.
    Entry,
    /// A service constructor running on the new object.
    Construct(Value),
    /// A call from another fiber.
    Future(FutureRef),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Guard {
    pub handler: usize,
    pub var: Arg,
}

pub(crate) enum FrameCode {
    Guest {
        method: Arc<MethodInfo>,
        ops: Arc<[Instruction]>,
        /// Set when the method was reached through a call chain, for `Super`.
        chain: Option<(Arc<CallChain>, usize)>,
    },
    /// Waits on a cross-fiber result and returns it.
    Await(FutureRef),
}

/// One activation.
pub struct Frame {
    pub(crate) code: FrameCode,
    pub(crate) registers: Vec<Value>,
    pub(crate) stack: Vec<Value>,
    pub(crate) pc: usize,
    pub(crate) this: Option<Value>,
    pub(crate) continuations: VecDeque<Continuation>,
    pub(crate) exception: Option<Fault>,
    pub(crate) guards: Vec<Guard>,
    pub(crate) caller: Option<Box<Frame>>,
    /// The child this frame is about to wait on.
    pub(crate) next: Option<Box<Frame>>,
    /// Where the caller receives this frame's result.
    pub(crate) ret: Arg,
    pub(crate) result: Option<Value>,
    pub(crate) reply: Option<Reply>,
    pub(crate) depth: usize,
}

impl Frame {
    fn with_code(code: FrameCode, registers: Vec<Value>, ret: Arg) -> Box<Self> {
        Box::new(Self {
            code,
            registers,
            stack: Vec::new(),
            pc: 0,
            this: None,
            continuations: VecDeque::new(),
            exception: None,
            guards: Vec::new(),
            caller: None,
            next: None,
            ret,
            result: None,
            reply: None,
            depth: 0,
        })
    }

    /// A frame for `method` with `args` in the leading registers.
    pub(crate) fn call(
        method: &Arc<MethodInfo>,
        this: Option<Value>,
        args: Vec<Value>,
        ret: Arg,
    ) -> Result<Box<Self>, Fault> {
        Self::call_in_chain(method, None, this, args, ret)
    }

    /// Enter the implementation at `depth` of a call chain.
    pub(crate) fn call_chain(
        chain: Arc<CallChain>,
        depth: usize,
        this: Value,
        args: Vec<Value>,
        ret: Arg,
    ) -> Result<Box<Self>, Fault> {
        let Some(method) = chain.get(depth).cloned() else {
            return Err(Fault::guest(
                ExceptionKind::Unsupported,
                "no further implementation in the call chain",
            ));
        };
        Self::call_in_chain(&method, Some((chain, depth)), Some(this), args, ret)
    }

    fn call_in_chain(
        method: &Arc<MethodInfo>,
        chain: Option<(Arc<CallChain>, usize)>,
        this: Option<Value>,
        mut args: Vec<Value>,
        ret: Arg,
    ) -> Result<Box<Self>, Fault> {
        if args.len() != method.arity() {
            return Err(Fault::guest(
                ExceptionKind::IllegalArgument,
                format!(
                    "{} takes {} arguments, got {}",
                    method.qualified_name,
                    method.arity(),
                    args.len()
                ),
            ));
        }
        let ops = method.linked().map_err(HostError::from)?;
        let size = (method.registers as usize).max(args.len());
        args.resize(size, Value::Null);
        let mut frame = Self::with_code(
            FrameCode::Guest {
                method: Arc::clone(method),
                ops,
                chain,
            },
            args,
            ret,
        );
        frame.this = this;
        Ok(frame)
    }

    pub(crate) fn await_future(future: FutureRef, ret: Arg) -> Box<Self> {
        Self::with_code(FrameCode::Await(future), Vec::new(), ret)
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn method(&self) -> Option<&Arc<MethodInfo>> {
        match &self.code {
            FrameCode::Guest { method, .. } => Some(method),
            FrameCode::Await(_) => None,
        }
    }

    pub(crate) fn ops(&self) -> Option<Arc<[Instruction]>> {
        match &self.code {
            FrameCode::Guest { ops, .. } => Some(Arc::clone(ops)),
            FrameCode::Await(_) => None,
        }
    }

    /// Read an operand.
    ///
    /// A register or stack slot holding an unfinished future reads as a
    /// deferred value; a finished one is replaced by its result.
    pub fn get(&mut self, arg: Arg, ctx: &Ctx<'_>) -> Result<Value, Fault> {
        match arg {
            Arg::Reg(reg) => {
                let slot = self
                    .registers
                    .get_mut(reg as usize)
                    .ok_or(HostError::BadRegister { reg })?;
                let pending = match &*slot {
                    Value::Future(future) => Some(Arc::clone(future)),
                    _ => None,
                };
                if let Some(future) = pending {
                    match read_future(future)? {
                        deferred @ Value::Deferred(_) => return Ok(deferred),
                        value => *slot = value,
                    }
                }
                Ok(slot.clone())
            }
            Arg::Stack => match self.pop()? {
                Value::Future(future) => read_future(future),
                value => Ok(value),
            },
            Arg::This => self.this.clone().ok_or(HostError::NoThis.into()),
            Arg::Const(index) => Ok(ctx.container().constant(index)?),
            Arg::Ignore => Err(HostError::NotReadable(arg).into()),
        }
    }

    pub fn assign(&mut self, arg: Arg, value: Value) -> Result<(), Fault> {
        if value.is_deferred() {
            return Err(HostError::DeferredRead.into());
        }
        match arg {
            Arg::Reg(reg) => {
                let slot = self
                    .registers
                    .get_mut(reg as usize)
                    .ok_or(HostError::BadRegister { reg })?;
                *slot = value;
                Ok(())
            }
            Arg::Stack => {
                self.stack.push(value);
                Ok(())
            }
            Arg::Ignore => Ok(()),
            Arg::This | Arg::Const(_) => Err(HostError::NotAssignable(arg).into()),
        }
    }

    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(HostError::StackUnderflow.into())
    }

    /// Store `fault` in the exception slot. Guest exceptions get the stack
    /// trace of this frame if they have none yet.
    pub fn raise(&mut self, fault: Fault) -> Step {
        let fault = match fault {
            Fault::Guest(mut exception) => {
                if exception.trace.is_empty() {
                    Arc::make_mut(&mut exception).trace = self.trace();
                }
                Fault::Guest(exception)
            }
            host => host,
        };
        self.exception = Some(fault);
        Step::Exception
    }

    /// False while the frame awaits an unfinished future.
    pub(crate) fn is_ready(&self) -> bool {
        match &self.code {
            FrameCode::Await(future) => future.is_done(),
            FrameCode::Guest { .. } => true,
        }
    }

    /// Take the reply slot of the outermost frame of this stack.
    pub(crate) fn take_root_reply(&mut self) -> Option<Reply> {
        match self.caller.as_deref_mut() {
            Some(caller) => caller.take_root_reply(),
            None => self.reply.take(),
        }
    }

    /// Make `child` the frame this one waits on.
    pub(crate) fn push_child(&mut self, child: Box<Frame>) -> Step {
        self.next = Some(child);
        Step::Call
    }

    pub fn trace(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut frame = Some(self);
        while let Some(f) = frame {
            lines.push(f.describe());
            frame = f.caller.as_deref();
        }
        lines
    }

    fn describe(&self) -> String {
        match &self.code {
            FrameCode::Guest { method, .. } => format!("{} @{}", method.qualified_name, self.pc),
            FrameCode::Await(_) => "<await>".to_string(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("at", &self.describe())
            .field("depth", &self.depth)
            .field("continuations", &self.continuations.len())
            .field("pending", &self.next.is_some())
            .finish()
    }
}

/// Run `cont` now if `step` completed, or once the pending child returns.
///
/// This is how completion logic is written once and shared by the
/// immediate and the deferred path.
pub(crate) fn chain<F>(frame: &mut Frame, ctx: &mut Ctx<'_>, step: Step, cont: F) -> Step
where
    F: FnOnce(&mut Frame, &mut Ctx<'_>) -> Step + Send + 'static,
{
    match step {
        Step::Next => cont(frame, ctx),
        Step::Call => match frame.next.as_mut() {
            Some(child) => {
                child.continuations.push_back(Box::new(cont));
                Step::Call
            }
            None => {
                let pc = frame.pc;
                frame.raise(HostError::NoPendingFrame { pc }.into())
            }
        },
        other => other,
    }
}

/// Resolve deferred values in `args` left to right, then run `then`.
///
/// Each deferred argument suspends the frame once; its continuation
/// re-enters this function with the value filled in.
pub(crate) fn resolve_args<F>(frame: &mut Frame, ctx: &mut Ctx<'_>, mut args: Vec<Value>, then: F) -> Step
where
    F: FnOnce(&mut Frame, &mut Ctx<'_>, Vec<Value>) -> Result<Step, Fault> + Send + 'static,
{
    let Some(index) = args.iter().position(Value::is_deferred) else {
        return match then(frame, ctx, args) {
            Ok(step) => step,
            Err(fault) => frame.raise(fault),
        };
    };
    match std::mem::take(&mut args[index]) {
        Value::Deferred(deferred) => deferred.proceed(frame, ctx, move |frame, ctx| {
            match frame.pop() {
                Ok(value) => {
                    args[index] = value;
                    resolve_args(frame, ctx, args, then)
                }
                Err(fault) => frame.raise(fault),
            }
        }),
        _ => frame.raise(HostError::DeferredRead.into()),
    }
}

/// The result of `future` if it has one, else a deferred read of it.
fn read_future(future: FutureRef) -> Result<Value, Fault> {
    match future.peek() {
        None => Ok(Value::Deferred(Deferred::Future(future))),
        Some(Ok(value)) => Ok(value.into_value()),
        Some(Err(exception)) => Err(Fault::Guest(exception)),
    }
}

impl Deferred {
    /// Start the computation behind this value as a child of `frame`; its
    /// result arrives on the frame's stack before `cont` runs.
    pub(crate) fn proceed<F>(self, frame: &mut Frame, _ctx: &mut Ctx<'_>, cont: F) -> Step
    where
        F: FnOnce(&mut Frame, &mut Ctx<'_>) -> Step + Send + 'static,
    {
        let mut child = match self {
            Deferred::Call(call) => {
                let PendingCall { method, this, args } = *call;
                match Frame::call(&method, this, args, Arg::Stack) {
                    Ok(child) => child,
                    Err(fault) => return frame.raise(fault),
                }
            }
            Deferred::Future(future) => Frame::await_future(future, Arg::Stack),
        };
        child.continuations.push_back(Box::new(cont));
        frame.push_child(child)
    }
}
