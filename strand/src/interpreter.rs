use std::sync::Arc;

use log::{debug, error, trace, warn};
use strand_bytecode::{Arg, BinaryCond, Branch, Instruction, UnaryCond};

use crate::{
    ClassInfo, Ctx, Deferred, Exception, ExceptionKind, Fault, Frame, FutureCell, FutureRef,
    HeapObject, HeapRef, HostError, NativeType, PendingCall, Portable, ServiceProxy, Step, Value,
    fiber::Request,
    frame::{FrameCode, Guard, Reply, chain, resolve_args},
    native::{expected, invoke_native},
    types::{self, TypeRef, class_of},
};

/// How a request's frame stack ended.
pub(crate) enum Exit {
    Returned(Value, Reply),
    Faulted(Arc<Exception>, Reply),
    Host(HostError, Vec<String>, Option<Reply>),
}

pub(crate) enum Progress {
    /// Keep executing this frame.
    Running(Box<Frame>),
    /// The frame awaits an unfinished future; the fiber has been registered
    /// as a waiter.
    Parked(Box<Frame>),
    Exit(Exit),
}

/// Execute one op of `frame`, or poll the future it awaits, and settle
/// the outcome.
pub(crate) fn execute(mut frame: Box<Frame>, ctx: &mut Ctx<'_>) -> Progress {
    let step = match frame.ops() {
        Some(ops) => match ops.get(frame.pc) {
            Some(op) => dispatch(op, &mut frame, ctx),
            None => {
                let method = frame
                    .method()
                    .map(|m| m.qualified_name.clone())
                    .unwrap_or_default();
                frame.raise(HostError::FellOffEnd { method }.into())
            }
        },
        None => match poll_await(&mut frame, ctx) {
            Some(step) => step,
            None => return Progress::Parked(frame),
        },
    };
    settle(frame, step, ctx)
}

fn poll_await(frame: &mut Frame, ctx: &mut Ctx<'_>) -> Option<Step> {
    let future = match &frame.code {
        FrameCode::Await(future) => Arc::clone(future),
        FrameCode::Guest { .. } => return Some(Step::Next),
    };
    match future.poll(ctx.fiber)? {
        Ok(value) => {
            frame.result = Some(value.into_value());
            Some(Step::Return)
        }
        Err(exception) => Some(frame.raise(Fault::Guest(exception))),
    }
}

/// Apply `step` to `frame` until a frame is ready to run its next op or the
/// request's stack is done.
fn settle(mut frame: Box<Frame>, mut step: Step, ctx: &mut Ctx<'_>) -> Progress {
    loop {
        match step {
            Step::Next => {
                frame.pc += 1;
                return Progress::Running(frame);
            }
            Step::Jump(target) => {
                frame.pc = target;
                return Progress::Running(frame);
            }
            Step::Call => {
                let Some(mut child) = frame.next.take() else {
                    let pc = frame.pc;
                    step = frame.raise(HostError::NoPendingFrame { pc }.into());
                    continue;
                };
                let depth = frame.depth + 1;
                if depth > ctx.rt().config.max_call_depth {
                    step = frame.raise(Fault::guest(
                        ExceptionKind::StackOverflow,
                        format!("call depth exceeds {}", ctx.rt().config.max_call_depth),
                    ));
                    continue;
                }
                child.depth = depth;
                debug!("push {child:?}");
                child.caller = Some(frame);
                return Progress::Running(child);
            }
            Step::Return => {
                let value = frame.result.take().unwrap_or_default();
                debug!("pop {frame:?}");
                match frame.caller.take() {
                    Some(caller) => (frame, step) = resume_caller(frame, caller, value, ctx),
                    None => {
                        return Progress::Exit(match frame.reply.take() {
                            Some(reply) => Exit::Returned(value, reply),
                            None => Exit::Host(HostError::NoReply, frame.trace(), None),
                        });
                    }
                }
            }
            Step::Exception => match frame.exception.take() {
                Some(Fault::Guest(exception)) => {
                    if let Some(guard) = frame.guards.pop() {
                        trace!("caught {exception} at {}", guard.handler);
                        frame.stack.clear();
                        frame.next = None;
                        step = match frame.assign(guard.var, Value::Exception(exception)) {
                            Ok(()) => Step::Jump(guard.handler),
                            Err(fault) => frame.raise(fault),
                        };
                        continue;
                    }
                    match frame.caller.take() {
                        Some(mut caller) => {
                            trace!("unwind {frame:?}");
                            caller.exception = Some(Fault::Guest(exception));
                            frame = caller;
                        }
                        None => {
                            return Progress::Exit(match frame.reply.take() {
                                Some(reply) => Exit::Faulted(exception, reply),
                                None => {
                                    Exit::Host(HostError::NoReply, exception.trace.clone(), None)
                                }
                            });
                        }
                    }
                }
                Some(Fault::Host(err)) => {
                    let trace = frame.trace();
                    error!("host error in {frame:?}: {err}");
                    let reply = frame.take_root_reply();
                    return Progress::Exit(Exit::Host(err, trace, reply));
                }
                None => {
                    let trace = frame.trace();
                    let reply = frame.take_root_reply();
                    return Progress::Exit(Exit::Host(HostError::MissingException, trace, reply));
                }
            },
        }
    }
}

/// Deliver a returning child's value to its caller and fire the child's
/// continuations with the caller, in registration order.
///
/// A continuation that answers `Call` moves the ones still queued onto the
/// new child, behind those it registered itself. A `Jump` answer is
/// remembered and applied once the whole chain is through.
fn resume_caller(
    mut child: Box<Frame>,
    mut caller: Box<Frame>,
    value: Value,
    ctx: &mut Ctx<'_>,
) -> (Box<Frame>, Step) {
    let ret = child.ret;
    let mut continuations = std::mem::take(&mut child.continuations);
    drop(child);

    if let Err(fault) = caller.assign(ret, value) {
        let step = caller.raise(fault);
        return (caller, step);
    }

    let mut resume = Step::Next;
    while let Some(continuation) = continuations.pop_front() {
        trace!("continuation for {caller:?}");
        match continuation(&mut caller, ctx) {
            Step::Next => {}
            Step::Jump(target) => resume = Step::Jump(target),
            Step::Call => {
                let step = match caller.next.as_mut() {
                    Some(next) => {
                        if let Step::Jump(target) = resume {
                            next.continuations
                                .push_front(Box::new(move |_: &mut Frame, _: &mut Ctx<'_>| {
                                    Step::Jump(target)
                                }));
                        }
                        next.continuations.extend(continuations);
                        Step::Call
                    }
                    None => {
                        let pc = caller.pc;
                        caller.raise(HostError::NoPendingFrame { pc }.into())
                    }
                };
                return (caller, step);
            }
            other => return (caller, other),
        }
    }
    (caller, resume)
}

pub(crate) fn dispatch(op: &Instruction, frame: &mut Frame, ctx: &mut Ctx<'_>) -> Step {
    trace!("{:>4} {op}", frame.pc);
    let result = match op {
        // a guard onto the next op still has to open its scope
        _ if op.is_redundant() && !matches!(op, Instruction::GuardStart { .. }) => {
            skip_redundant(op, frame)
        }
        Instruction::Nop => Ok(Step::Next),
        Instruction::Move { dst, src } => op_move(frame, ctx, *dst, *src),
        Instruction::Add { dst, lhs, rhs } => op_arith(frame, ctx, "add", *dst, *lhs, *rhs),
        Instruction::Sub { dst, lhs, rhs } => op_arith(frame, ctx, "sub", *dst, *lhs, *rhs),
        Instruction::Jump { branch } => branch_target(frame, branch).map(Step::Jump),
        Instruction::JumpUnary { cond, arg, branch } => {
            op_jump_unary(frame, ctx, *cond, *arg, branch)
        }
        Instruction::JumpBinary {
            cond,
            ty,
            lhs,
            rhs,
            branch,
        } => op_jump_binary(frame, ctx, *cond, *ty, *lhs, *rhs, branch),
        Instruction::Call { dst, method, args } => op_call(frame, ctx, *dst, *method, args),
        Instruction::Invoke {
            dst,
            target,
            name,
            args,
        } => op_invoke(frame, ctx, *dst, *target, *name, args, false),
        Instruction::InvokeAsync {
            dst,
            target,
            name,
            args,
        } => op_invoke(frame, ctx, *dst, *target, *name, args, true),
        Instruction::Super { dst, args } => op_super(frame, ctx, *dst, args),
        Instruction::New { dst, class, args } => op_new(frame, ctx, *dst, *class, args),
        Instruction::GetField { dst, target, field } => {
            op_get_field(frame, ctx, *dst, *target, *field)
        }
        Instruction::SetField {
            target,
            field,
            value,
        } => op_set_field(frame, ctx, *target, *field, *value),
        Instruction::NewService { dst, class, args } => {
            op_new_service(frame, ctx, *dst, *class, args)
        }
        Instruction::Freeze { dst, src } => op_freeze(frame, ctx, *dst, *src),
        Instruction::NewRef { dst, src } => op_new_ref(frame, ctx, *dst, *src),
        Instruction::NewLazy { dst, method } => op_new_lazy(frame, ctx, *dst, *method),
        Instruction::RefGet { dst, target } => op_ref_get(frame, ctx, *dst, *target),
        Instruction::RefSet { target, value } => op_ref_set(frame, ctx, *target, *value),
        Instruction::GuardStart { var, branch } => branch_target(frame, branch).map(|handler| {
            frame.guards.push(Guard { handler, var: *var });
            Step::Next
        }),
        Instruction::GuardEnd => {
            frame.guards.pop();
            Ok(Step::Next)
        }
        Instruction::Throw { arg } => op_throw(frame, ctx, *arg),
        Instruction::Return { arg } => op_return(frame, ctx, *arg),
        Instruction::ReturnVoid => {
            frame.result = Some(Value::Null);
            Ok(Step::Return)
        }
    };
    finish(frame, result)
}

/// Fall through a jump onto the next op. Operands are not evaluated, but
/// those passed on the stack are still consumed.
fn skip_redundant(op: &Instruction, frame: &mut Frame) -> Result<Step, Fault> {
    let operands = match op {
        Instruction::JumpUnary { arg, .. } => vec![*arg],
        Instruction::JumpBinary { lhs, rhs, .. } => vec![*lhs, *rhs],
        _ => Vec::new(),
    };
    for arg in operands {
        if arg == Arg::Stack {
            frame.pop()?;
        }
    }
    Ok(Step::Next)
}

fn finish(frame: &mut Frame, result: Result<Step, Fault>) -> Step {
    match result {
        Ok(step) => step,
        Err(fault) => frame.raise(fault),
    }
}

fn branch_target(frame: &Frame, branch: &Branch) -> Result<usize, Fault> {
    branch
        .target()
        .ok_or(HostError::Unlinked { pc: frame.pc }.into())
}

fn read(frame: &mut Frame, ctx: &Ctx<'_>, args: &[Arg]) -> Result<Vec<Value>, Fault> {
    args.iter().map(|arg| frame.get(*arg, ctx)).collect()
}

fn two(values: Vec<Value>) -> Result<(Value, Value), Fault> {
    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(HostError::StackUnderflow.into()),
    }
}

fn unsupported(message: String) -> Fault {
    Fault::guest(ExceptionKind::Unsupported, message)
}

fn null_dereference(what: &str) -> Fault {
    Fault::guest(ExceptionKind::NullDereference, format!("{what} on Null"))
}

fn op_move(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, src: Arg) -> Result<Step, Fault> {
    let value = frame.get(src, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, _, mut values| {
        frame.assign(dst, values.pop().unwrap_or_default())?;
        Ok(Step::Next)
    }))
}

fn op_arith(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    name: &'static str,
    dst: Arg,
    lhs: Arg,
    rhs: Arg,
) -> Result<Step, Fault> {
    let values = read(frame, ctx, &[lhs, rhs])?;
    Ok(resolve_args(frame, ctx, values, move |frame, ctx, values| {
        let (lhs, rhs) = two(values)?;
        Ok(invoke(frame, ctx, lhs, name, vec![rhs], dst))
    }))
}

fn op_jump_unary(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    cond: UnaryCond,
    arg: Arg,
    branch: &Branch,
) -> Result<Step, Fault> {
    let target = branch_target(frame, branch)?;
    let value = frame.get(arg, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |_, _, mut values| {
        let value = values.pop().unwrap_or_default();
        let taken = match (cond, &value) {
            (UnaryCond::True, Value::Bool(b)) => *b,
            (UnaryCond::False, Value::Bool(b)) => !*b,
            (UnaryCond::True | UnaryCond::False, other) => return Err(expected("Boolean", other)),
            (UnaryCond::Null, other) => matches!(other, Value::Null),
            (UnaryCond::NotNull, other) => !matches!(other, Value::Null),
        };
        Ok(if taken { Step::Jump(target) } else { Step::Next })
    }))
}

fn op_jump_binary(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    cond: BinaryCond,
    ty: u32,
    lhs: Arg,
    rhs: Arg,
    branch: &Branch,
) -> Result<Step, Fault> {
    let target = branch_target(frame, branch)?;
    let ty = ctx.container().type_ref(ty)?;
    let values = read(frame, ctx, &[lhs, rhs])?;
    Ok(resolve_args(frame, ctx, values, move |frame, ctx, values| {
        let (lhs, rhs) = two(values)?;
        Ok(compare_and_branch(frame, ctx, &ty, cond, lhs, rhs, target))
    }))
}

/// The completion of a two-operand jump, shared by the immediate path and
/// every resumption after a deferred operand.
fn compare_and_branch(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    ty: &TypeRef,
    cond: BinaryCond,
    lhs: Value,
    rhs: Value,
    target: usize,
) -> Step {
    let step = if cond.is_equality() {
        types::call_equals(frame, ctx, ty, lhs, rhs)
    } else {
        types::call_compare(frame, ctx, ty, lhs, rhs)
    };
    chain(frame, ctx, step, move |frame, _| {
        let decision = decide(frame, cond, target);
        finish(frame, decision)
    })
}

fn decide(frame: &mut Frame, cond: BinaryCond, target: usize) -> Result<Step, Fault> {
    let taken = match frame.pop()? {
        Value::Bool(equal) if cond.is_equality() => cond.holds_for_equality(equal),
        Value::Ordered(ordering) => cond.holds_for_ordering(ordering),
        other => {
            return Err(Fault::guest(
                ExceptionKind::IllegalArgument,
                format!("comparison produced {}", other.type_name()),
            ));
        }
    };
    Ok(if taken { Step::Jump(target) } else { Step::Next })
}

fn op_call(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    dst: Arg,
    method: u32,
    args: &[Arg],
) -> Result<Step, Fault> {
    let method = Arc::clone(ctx.container().method(method)?);
    let values = read(frame, ctx, args)?;
    Ok(resolve_args(frame, ctx, values, move |frame, _, values| {
        let child = Frame::call(&method, None, values, dst)?;
        Ok(frame.push_child(child))
    }))
}

fn op_invoke(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    dst: Arg,
    target: Arg,
    name: u32,
    args: &[Arg],
    asynchronous: bool,
) -> Result<Step, Fault> {
    let name = ctx.container().string(name)?;
    let mut values = Vec::with_capacity(args.len() + 1);
    values.push(frame.get(target, ctx)?);
    values.extend(read(frame, ctx, args)?);
    Ok(resolve_args(frame, ctx, values, move |frame, ctx, mut values| {
        let target = values.remove(0);
        if !asynchronous {
            return Ok(invoke(frame, ctx, target, &name, values, dst));
        }
        let Value::Service(proxy) = &target else {
            return Err(expected("Service", &target));
        };
        let future = send(ctx, proxy, &name, values)?;
        frame.assign(dst, Value::Future(future))?;
        Ok(Step::Next)
    }))
}

/// Virtual call of `name` on `target`: guest objects through their call
/// chain, built-in values through the native registry, services through
/// their fiber.
pub(crate) fn invoke(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    target: Value,
    name: &str,
    args: Vec<Value>,
    dst: Arg,
) -> Step {
    let result = invoke_target(frame, ctx, target, name, args, dst);
    finish(frame, result)
}

fn invoke_target(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    target: Value,
    name: &str,
    args: Vec<Value>,
    dst: Arg,
) -> Result<Step, Fault> {
    match target {
        Value::Null => Err(null_dereference(name)),
        Value::Service(ref proxy) => {
            let future = send(ctx, proxy, name, args)?;
            Ok(frame.push_child(Frame::await_future(future, dst)))
        }
        Value::Object(_) | Value::Frozen(_) => {
            let Some(class) = class_of(&target, &*ctx.heap)? else {
                return Err(expected("Object", &target));
            };
            let methods = ctx.container().call_chain(&class, name);
            if methods.is_empty() {
                return Err(unsupported(format!("{} has no method {name}", class.name)));
            }
            let child = Frame::call_chain(methods, 0, target, args, dst)?;
            Ok(frame.push_child(child))
        }
        _ => {
            let native = NativeType::of(&target)
                .and_then(|ty| ctx.container().natives().lookup(ty, name));
            match native {
                Some(method) => Ok(invoke_native(frame, ctx, method, target, args, dst)),
                None => Err(unsupported(format!(
                    "{} has no method {name}",
                    target.type_name()
                ))),
            }
        }
    }
}

fn mask_all(values: &[Value]) -> Result<Vec<Portable>, Fault> {
    values
        .iter()
        .map(|value| {
            Portable::mask(value).map_err(|exception| {
                warn!("refused at fiber boundary: {exception}");
                Fault::from(exception)
            })
        })
        .collect()
}

/// Queue a call of `name` on the service behind `proxy`.
pub(crate) fn send(
    ctx: &Ctx<'_>,
    proxy: &ServiceProxy,
    name: &str,
    args: Vec<Value>,
) -> Result<FutureRef, Fault> {
    let args = mask_all(&args)?;
    let reply = FutureCell::new();
    ctx.rt().request(
        proxy.fiber(),
        Request::Invoke {
            name: name.to_string(),
            args,
            reply: Arc::clone(&reply),
        },
    );
    Ok(reply)
}

fn op_super(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, args: &[Arg]) -> Result<Step, Fault> {
    let (methods, depth) = match &frame.code {
        FrameCode::Guest {
            chain: Some((methods, depth)),
            ..
        } => (Arc::clone(methods), *depth),
        _ => return Err(unsupported("Super outside of a virtual call".to_string())),
    };
    let this = frame.this.clone().ok_or(HostError::NoThis)?;
    let values = read(frame, ctx, args)?;
    Ok(resolve_args(frame, ctx, values, move |frame, _, values| {
        let child = Frame::call_chain(methods, depth + 1, this, values, dst)?;
        Ok(frame.push_child(child))
    }))
}

fn init_fields(ctx: &mut Ctx<'_>, object: &Value, values: Vec<Value>) -> Result<(), Fault> {
    let Value::Object(r) = object else {
        return Err(expected("Object", object));
    };
    let capacity = ctx.heap().class_of(*r)?.fields as usize;
    if values.len() > capacity {
        return Err(Fault::guest(
            ExceptionKind::IllegalArgument,
            format!("{} initializers for {capacity} fields", values.len()),
        ));
    }
    for (i, value) in values.into_iter().enumerate() {
        ctx.heap().set_field(*r, i as u32, value)?;
    }
    Ok(())
}

/// Allocate an instance of `class`. Returns the object and, if the class
/// has a `construct` chain, the constructor frame still to run on it;
/// otherwise the fields are filled positionally.
pub(crate) fn instantiate(
    ctx: &mut Ctx<'_>,
    class: &Arc<ClassInfo>,
    values: Vec<Value>,
) -> Result<(Value, Option<Box<Frame>>), Fault> {
    let ctor = ctx.container().call_chain(class, "construct");
    let object = ctx
        .heap()
        .new_object(Arc::clone(class), vec![Value::Null; class.fields as usize]);
    if ctor.is_empty() {
        init_fields(ctx, &object, values)?;
        return Ok((object, None));
    }
    let child = Frame::call_chain(ctor, 0, object.clone(), values, Arg::Ignore)?;
    Ok((object, Some(child)))
}

fn op_new(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    dst: Arg,
    class: u32,
    args: &[Arg],
) -> Result<Step, Fault> {
    let class = Arc::clone(ctx.container().class(class)?);
    let values = read(frame, ctx, args)?;
    Ok(resolve_args(frame, ctx, values, move |frame, ctx, values| {
        let (object, ctor) = instantiate(ctx, &class, values)?;
        let step = match ctor {
            Some(child) => frame.push_child(child),
            None => Step::Next,
        };
        Ok(chain(frame, ctx, step, move |frame, _| {
            let result = frame.assign(dst, object).map(|()| Step::Next);
            finish(frame, result)
        }))
    }))
}

fn op_get_field(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    dst: Arg,
    target: Arg,
    field: u32,
) -> Result<Step, Fault> {
    let value = frame.get(target, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, ctx, mut values| {
        let value = match values.pop().unwrap_or_default() {
            Value::Object(r) => ctx.heap().field(r, field)?,
            Value::Frozen(object) => match object.fields.get(field as usize) {
                Some(value) => value.value().clone(),
                None => {
                    return Err(HostError::BadField {
                        class: object.class.name.clone(),
                        field,
                    }
                    .into());
                }
            },
            Value::Null => return Err(null_dereference("field read")),
            other => return Err(expected("Object", &other)),
        };
        frame.assign(dst, value)?;
        Ok(Step::Next)
    }))
}

fn op_set_field(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    target: Arg,
    field: u32,
    value: Arg,
) -> Result<Step, Fault> {
    let values = read(frame, ctx, &[target, value])?;
    Ok(resolve_args(frame, ctx, values, move |_, ctx, values| {
        let (target, value) = two(values)?;
        match target {
            Value::Object(r) => ctx.heap().set_field(r, field, value)?,
            Value::Frozen(object) => {
                return Err(Fault::guest(
                    ExceptionKind::ReadOnly,
                    format!("{} is frozen", object.class.name),
                ));
            }
            Value::Null => return Err(null_dereference("field write")),
            other => return Err(expected("Object", &other)),
        }
        Ok(Step::Next)
    }))
}

fn op_new_service(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    dst: Arg,
    class: u32,
    args: &[Arg],
) -> Result<Step, Fault> {
    let class = Arc::clone(ctx.container().class(class)?);
    let values = read(frame, ctx, args)?;
    Ok(resolve_args(frame, ctx, values, move |frame, ctx, values| {
        let args = mask_all(&values)?;
        let proxy = ctx.rt().spawn_service(class, args);
        frame.assign(dst, Value::Service(proxy))?;
        Ok(Step::Next)
    }))
}

fn op_freeze(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, src: Arg) -> Result<Step, Fault> {
    let value = frame.get(src, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, ctx, mut values| {
        let frozen = ctx.heap().freeze(&values.pop().unwrap_or_default())?;
        frame.assign(dst, frozen.into_value())?;
        Ok(Step::Next)
    }))
}

fn op_new_ref(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, src: Arg) -> Result<Step, Fault> {
    let value = frame.get(src, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, ctx, mut values| {
        let r = ctx.heap().alloc(HeapObject::Ref {
            value: Some(values.pop().unwrap_or_default()),
            init: None,
        });
        frame.assign(dst, Value::Ref(r))?;
        Ok(Step::Next)
    }))
}

fn op_new_lazy(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, method: u32) -> Result<Step, Fault> {
    let init = Arc::clone(ctx.container().method(method)?);
    if init.arity() != 0 {
        return Err(Fault::guest(
            ExceptionKind::IllegalArgument,
            format!("lazy initializer {} takes arguments", init.qualified_name),
        ));
    }
    let r = ctx.heap().alloc(HeapObject::Ref {
        value: None,
        init: Some(init),
    });
    frame.assign(dst, Value::Ref(r))?;
    Ok(Step::Next)
}

fn ref_cell(target: Value) -> Result<HeapRef, Fault> {
    match target {
        Value::Ref(r) => Ok(r),
        Value::Null => Err(null_dereference("reference access")),
        other => Err(expected("Ref", &other)),
    }
}

fn op_ref_get(frame: &mut Frame, ctx: &mut Ctx<'_>, dst: Arg, target: Arg) -> Result<Step, Fault> {
    let value = frame.get(target, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, ctx, mut values| {
        let r = ref_cell(values.pop().unwrap_or_default())?;
        let (value, init) = match ctx.heap().get(r)? {
            HeapObject::Ref { value, init } => (value.clone(), init.clone()),
            HeapObject::Object { .. } => return Err(HostError::WrongObject { index: r.index }.into()),
        };
        if let Some(value) = value {
            frame.assign(dst, value)?;
            return Ok(Step::Next);
        }
        let Some(init) = init else {
            return Err(HostError::WrongObject { index: r.index }.into());
        };
        trace!("initializing lazy reference {r}");
        let pending = Deferred::Call(Box::new(PendingCall {
            method: init,
            this: None,
            args: Vec::new(),
        }));
        Ok(pending.proceed(frame, ctx, move |frame, ctx| {
            let result = frame
                .pop()
                .and_then(|computed| store_lazy(ctx, r, computed))
                .and_then(|value| frame.assign(dst, value))
                .map(|()| Step::Next);
            finish(frame, result)
        }))
    }))
}

// first assignment wins
fn store_lazy(ctx: &mut Ctx<'_>, r: HeapRef, computed: Value) -> Result<Value, Fault> {
    match ctx.heap().get_mut(r)? {
        HeapObject::Ref { value, .. } => Ok(value.get_or_insert(computed).clone()),
        HeapObject::Object { .. } => Err(HostError::WrongObject { index: r.index }.into()),
    }
}

fn op_ref_set(frame: &mut Frame, ctx: &mut Ctx<'_>, target: Arg, value: Arg) -> Result<Step, Fault> {
    let values = read(frame, ctx, &[target, value])?;
    Ok(resolve_args(frame, ctx, values, move |_, ctx, values| {
        let (target, value) = two(values)?;
        let r = ref_cell(target)?;
        match ctx.heap().get_mut(r)? {
            HeapObject::Ref { value: slot, init } => {
                if init.is_some() && slot.is_some() {
                    return Err(Fault::guest(
                        ExceptionKind::ReadOnly,
                        "lazy reference is already assigned",
                    ));
                }
                *slot = Some(value);
            }
            HeapObject::Object { .. } => return Err(HostError::WrongObject { index: r.index }.into()),
        }
        Ok(Step::Next)
    }))
}

fn op_throw(frame: &mut Frame, ctx: &mut Ctx<'_>, arg: Arg) -> Result<Step, Fault> {
    let value = frame.get(arg, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |_, _, mut values| {
        let exception = match values.pop().unwrap_or_default() {
            Value::Exception(exception) => return Err(Fault::Guest(exception)),
            Value::Str(message) => Exception::new(ExceptionKind::Thrown, message.to_string()),
            other => {
                let exception = Exception::new(ExceptionKind::Thrown, other.to_string());
                match Portable::mask(&other) {
                    Ok(value) => exception.with_value(value),
                    Err(_) => exception,
                }
            }
        };
        Err(exception.into())
    }))
}

fn op_return(frame: &mut Frame, ctx: &mut Ctx<'_>, arg: Arg) -> Result<Step, Fault> {
    let value = frame.get(arg, ctx)?;
    Ok(resolve_args(frame, ctx, vec![value], move |frame, _, mut values| {
        frame.result = Some(values.pop().unwrap_or_default());
        Ok(Step::Return)
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use strand_bytecode::{ClassDef, CodeBuilder, Constant, MethodDef, Module};

    use super::*;
    use crate::{Continuation, FiberId, FiberShared, Heap, Runtime, RuntimeConfig, ScaleConfig};

    fn runtime(module: &Module) -> Runtime {
        let config = RuntimeConfig {
            scale: ScaleConfig {
                max_pool_workers: 0,
                ..ScaleConfig::default()
            },
            ..RuntimeConfig::default()
        };
        Runtime::new(module, config).unwrap()
    }

    /// `main(a, b)` branching on `a <cond> b` under type `ty`.
    fn branch_module(cond: BinaryCond, ty: &str) -> Module {
        let mut module = Module::new("branch");
        let ty = module.constant(Constant::Type(ty.into()));
        let yes = module.constant(Constant::Bool(true));
        let no = module.constant(Constant::Bool(false));
        let mut b = CodeBuilder::new();
        let taken = b.jump_cmp(cond, ty, Arg::Reg(0), Arg::Reg(1));
        b.ret(Arg::Const(no));
        b.bind(taken);
        b.ret(Arg::Const(yes));
        module.add_method(MethodDef {
            name: "main".into(),
            params: vec![None, None],
            registers: 2,
            code: b.finish(),
        });
        module
    }

    /// Adds `Version` whose `compare` delegates to a static helper, so an
    /// ordering always needs a nested frame.
    fn with_version(module: &mut Module) -> u32 {
        let compare_name = module.constant(Constant::String("compare".into()));
        let mut helper = CodeBuilder::new();
        helper.invoke(Arg::Reg(2), Arg::Reg(0), compare_name, &[Arg::Reg(1)]);
        helper.ret(Arg::Reg(2));
        let helper = module.add_method(MethodDef {
            name: "compareInts".into(),
            params: vec![None, None],
            registers: 3,
            code: helper.finish(),
        });

        let mut compare = CodeBuilder::new();
        compare.get_field(Arg::Reg(1), Arg::This, 0);
        compare.get_field(Arg::Reg(2), Arg::Reg(0), 0);
        compare.call(Arg::Reg(3), helper, &[Arg::Reg(1), Arg::Reg(2)]);
        compare.ret(Arg::Reg(3));
        let compare = module.add_method(MethodDef {
            name: "compare".into(),
            params: vec![None],
            registers: 4,
            code: compare.finish(),
        });
        module.add_class(ClassDef {
            name: "Version".into(),
            fields: 1,
            methods: vec![compare],
            ..ClassDef::default()
        })
    }

    struct Harness {
        runtime: Runtime,
        fiber: Arc<FiberShared>,
        heap: Heap,
    }

    impl Harness {
        fn new(module: &Module) -> Self {
            Self {
                runtime: runtime(module),
                fiber: FiberShared::new(FiberId(99), "test", None),
                heap: Heap::new(FiberId(99)),
            }
        }

        fn main(&self, args: Vec<Value>) -> Box<Frame> {
            let method = self.runtime.container().function("main").unwrap();
            Frame::call(method, None, args, Arg::Ignore).unwrap()
        }

        fn version(&mut self, n: i64) -> Value {
            let class = Arc::clone(self.runtime.container().class_named("Version").unwrap());
            self.heap.new_object(class, vec![Value::Int(n)])
        }

        fn first_step(&mut self, frame: &mut Frame) -> Step {
            let shared = Arc::clone(self.runtime.shared());
            let mut ctx = Ctx::new(&mut self.heap, &self.fiber, &shared);
            let ops = frame.ops().unwrap();
            dispatch(&ops[0], frame, &mut ctx)
        }

        /// Run `frame` after a dispatch answered `step` until the outermost
        /// frame is about to execute again; returns its pc.
        fn resume(&mut self, frame: Box<Frame>, step: Step) -> usize {
            let shared = Arc::clone(self.runtime.shared());
            let mut ctx = Ctx::new(&mut self.heap, &self.fiber, &shared);
            let mut progress = settle(frame, step, &mut ctx);
            loop {
                match progress {
                    Progress::Running(frame) if frame.depth == 0 => return frame.pc,
                    Progress::Running(frame) => progress = execute(frame, &mut ctx),
                    Progress::Parked(_) => panic!("parked without a future"),
                    Progress::Exit(_) => panic!("stack ended early"),
                }
            }
        }
    }

    fn target_of(frame: &Frame) -> usize {
        frame.ops().unwrap()[0].branch().unwrap().target().unwrap()
    }

    #[test]
    fn equal_ints_branch_immediately() {
        let mut h = Harness::new(&branch_module(BinaryCond::Eq, "Int"));
        let mut frame = h.main(vec![Value::Int(5), Value::Int(5)]);
        let step = h.first_step(&mut frame);
        assert_eq!(step, Step::Jump(target_of(&frame)));
        assert!(frame.next.is_none());
    }

    #[test]
    fn unequal_ints_fall_through_immediately() {
        let mut h = Harness::new(&branch_module(BinaryCond::Eq, "Int"));
        let mut frame = h.main(vec![Value::Int(5), Value::Int(6)]);
        assert_eq!(h.first_step(&mut frame), Step::Next);
    }

    #[test]
    fn user_ordering_suspends_and_decides_like_a_direct_comparison() {
        for (a, b) in [(3, 2), (2, 3), (4, 4)] {
            let mut module = branch_module(BinaryCond::Gte, "Version");
            with_version(&mut module);
            let mut h = Harness::new(&module);
            let (lhs, rhs) = (h.version(a), h.version(b));
            let mut frame = h.main(vec![lhs, rhs]);
            let target = target_of(&frame);

            let step = h.first_step(&mut frame);
            assert_eq!(step, Step::Call);
            assert_eq!(frame.next.as_ref().unwrap().continuations.len(), 1);

            let pc = h.resume(frame, step);
            let expected = if a >= b { target } else { 1 };
            assert_eq!(pc, expected, "{a} >= {b}");
        }
    }

    #[test]
    fn identity_is_the_default_equality_for_classes() {
        let mut module = branch_module(BinaryCond::Eq, "Version");
        with_version(&mut module);
        let mut h = Harness::new(&module);
        let (a, b) = (h.version(1), h.version(1));

        let mut frame = h.main(vec![a.clone(), b]);
        assert_eq!(h.first_step(&mut frame), Step::Next);

        let mut frame = h.main(vec![a.clone(), a]);
        assert!(matches!(h.first_step(&mut frame), Step::Jump(_)));
    }

    #[test]
    fn redundant_branches_are_not_evaluated() {
        let mut module = Module::new("redundant");
        let five = module.constant(Constant::Int(5));
        let mut b = CodeBuilder::new();
        let next = b.jump_if(UnaryCond::True, Arg::Const(five));
        b.bind(next);
        b.ret_void();
        module.add_method(MethodDef {
            name: "main".into(),
            registers: 0,
            code: b.finish(),
            ..MethodDef::default()
        });
        let mut h = Harness::new(&module);
        let mut frame = h.main(Vec::new());
        assert_eq!(h.first_step(&mut frame), Step::Next);
        assert!(frame.exception.is_none());
    }

    #[test]
    fn redundant_branches_still_consume_stack_operands() {
        let mut module = Module::new("redundant-stack");
        let ty = module.constant(Constant::Type("Int".into()));
        let mut b = CodeBuilder::new();
        let next = b.jump_cmp(BinaryCond::Lt, ty, Arg::Stack, Arg::Stack);
        b.bind(next);
        b.ret_void();
        module.add_method(MethodDef {
            name: "main".into(),
            code: b.finish(),
            ..MethodDef::default()
        });
        let mut h = Harness::new(&module);
        let mut frame = h.main(Vec::new());
        frame.stack.extend([Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert_eq!(h.first_step(&mut frame), Step::Next);
        assert_eq!(frame.stack.len(), 1);
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, step: Step) -> Continuation {
        let log = Arc::clone(log);
        Box::new(move |_: &mut Frame, _: &mut Ctx<'_>| {
            log.lock().unwrap().push(name);
            step
        })
    }

    fn leaf_module() -> Module {
        let mut module = Module::new("leaf");
        let mut b = CodeBuilder::new();
        b.ret_void();
        module.add_method(MethodDef {
            name: "main".into(),
            code: b.finish(),
            ..MethodDef::default()
        });
        module
    }

    #[test]
    fn continuations_fire_in_registration_order() {
        let mut h = Harness::new(&leaf_module());
        let log = Arc::new(Mutex::new(Vec::new()));
        let caller = h.main(Vec::new());
        let mut child = h.main(Vec::new());
        child.ret = Arg::Stack;
        child.continuations.push_back(recorder(&log, "first", Step::Next));
        child.continuations.push_back(recorder(&log, "second", Step::Next));
        child.continuations.push_back(recorder(&log, "third", Step::Next));

        let shared = Arc::clone(h.runtime.shared());
        let mut ctx = Ctx::new(&mut h.heap, &h.fiber, &shared);
        let (mut caller, step) = resume_caller(child, caller, Value::Int(1), &mut ctx);
        assert_eq!(step, Step::Next);
        assert_eq!(*log.lock().unwrap(), ["first", "second", "third"]);
        assert!(matches!(caller.pop(), Ok(Value::Int(1))));
    }

    #[test]
    fn a_suspending_continuation_carries_the_rest_to_the_new_child() {
        let mut h = Harness::new(&leaf_module());
        let log = Arc::new(Mutex::new(Vec::new()));
        let caller = h.main(Vec::new());
        let mut child = h.main(Vec::new());
        let method = Arc::clone(h.runtime.container().function("main").unwrap());
        {
            let log = Arc::clone(&log);
            child.continuations.push_back(Box::new(move |frame: &mut Frame, _: &mut Ctx<'_>| {
                log.lock().unwrap().push("suspends");
                let mut grandchild = Frame::call(&method, None, Vec::new(), Arg::Ignore).unwrap();
                grandchild.continuations.push_back(Box::new(move |_: &mut Frame, _: &mut Ctx<'_>| {
                    log.lock().unwrap().push("nested");
                    Step::Next
                }));
                frame.push_child(grandchild)
            }));
        }
        child.continuations.push_back(recorder(&log, "later", Step::Jump(0)));

        let shared = Arc::clone(h.runtime.shared());
        let mut ctx = Ctx::new(&mut h.heap, &h.fiber, &shared);
        let (mut caller, step) = resume_caller(child, caller, Value::Null, &mut ctx);
        assert_eq!(step, Step::Call);
        assert_eq!(*log.lock().unwrap(), ["suspends"]);

        let grandchild = caller.next.take().unwrap();
        assert_eq!(grandchild.continuations.len(), 2);
        let (_, step) = resume_caller(grandchild, caller, Value::Null, &mut ctx);
        assert_eq!(step, Step::Jump(0));
        assert_eq!(*log.lock().unwrap(), ["suspends", "nested", "later"]);
    }
}
