//! Operations whose meaning depends on a type: equality, ordering and
//! string conversion.
//!
//! Each one leaves its result on the frame's stack and answers `Next`, or
//! starts a guest implementation and answers `Call`; callers continue
//! with [`chain`](crate::chain) either way.

use std::sync::Arc;

use strand_bytecode::Arg;

use crate::{
    CallChain, ClassInfo, Ctx, ExceptionKind, Fault, Frame, Heap, HostError, NativeType,
    ServiceProxy, Step, Value, interpreter::send, native::invoke_native,
};

/// The common type named by a two-operand jump.
#[derive(Debug, Clone)]
pub enum TypeRef {
    Native(NativeType),
    Class(Arc<ClassInfo>),
    /// No type-specific behavior: identity equality, no ordering.
    Object,
}

pub(crate) fn class_of(value: &Value, heap: &Heap) -> Result<Option<Arc<ClassInfo>>, HostError> {
    match value {
        Value::Object(r) => heap.class_of(*r).map(|c| Some(Arc::clone(c))),
        Value::Frozen(object) => Ok(Some(Arc::clone(&object.class))),
        Value::Service(proxy) => Ok(proxy.class().cloned()),
        _ => Ok(None),
    }
}

fn push(frame: &mut Frame, value: Value) -> Step {
    frame.stack.push(value);
    Step::Next
}

fn call_user(frame: &mut Frame, chain: Arc<CallChain>, lhs: Value, args: Vec<Value>) -> Step {
    match Frame::call_chain(chain, 0, lhs, args, Arg::Stack) {
        Ok(child) => frame.push_child(child),
        Err(fault) => frame.raise(fault),
    }
}

/// Ask the service behind `proxy` to run `name`; the reply lands on the
/// stack once the await frame returns.
fn call_service(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    proxy: &ServiceProxy,
    name: &str,
    args: Vec<Value>,
) -> Step {
    match send(ctx, proxy, name, args) {
        Ok(future) => frame.push_child(Frame::await_future(future, Arg::Stack)),
        Err(fault) => frame.raise(fault),
    }
}

fn call_native(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    ty: NativeType,
    name: &str,
    lhs: Value,
    rhs: Value,
) -> Step {
    if NativeType::of(&lhs) != Some(ty) {
        return frame.raise(crate::native::expected(ty.name(), &lhs));
    }
    match ctx.container().natives().lookup(ty, name) {
        Some(method) => invoke_native(frame, ctx, method, lhs, vec![rhs], Arg::Stack),
        None if name == "equals" => push(frame, Value::Bool(lhs.same(&rhs))),
        None => frame.raise(Fault::guest(
            ExceptionKind::Unsupported,
            format!("{} has no {name}", ty.name()),
        )),
    }
}

fn checked_class(ctx: &Ctx<'_>, class: &ClassInfo, value: &Value) -> Result<(), Fault> {
    match class_of(value, &*ctx.heap)? {
        Some(actual) if actual.is_a(&class.name) => Ok(()),
        _ => Err(crate::native::expected(&class.name, value)),
    }
}

/// Push `Bool(lhs == rhs)` as `ty` defines it.
pub(crate) fn call_equals(frame: &mut Frame, ctx: &mut Ctx<'_>, ty: &TypeRef, lhs: Value, rhs: Value) -> Step {
    match ty {
        TypeRef::Native(native) => call_native(frame, ctx, *native, "equals", lhs, rhs),
        TypeRef::Class(class) => {
            if let Err(fault) = checked_class(ctx, class, &lhs) {
                return frame.raise(fault);
            }
            let chain = ctx.container().call_chain(class, "equals");
            // proxies name a fiber, not state this fiber can read
            if chain.is_empty() || matches!(lhs, Value::Service(_)) {
                push(frame, Value::Bool(lhs.same(&rhs)))
            } else {
                call_user(frame, chain, lhs, vec![rhs])
            }
        }
        TypeRef::Object => push(frame, Value::Bool(lhs.same(&rhs))),
    }
}

/// Push `Ordered(lhs <=> rhs)` as `ty` defines it.
pub(crate) fn call_compare(frame: &mut Frame, ctx: &mut Ctx<'_>, ty: &TypeRef, lhs: Value, rhs: Value) -> Step {
    match ty {
        TypeRef::Native(native) => call_native(frame, ctx, *native, "compare", lhs, rhs),
        TypeRef::Class(class) => {
            if let Err(fault) = checked_class(ctx, class, &lhs) {
                return frame.raise(fault);
            }
            let chain = ctx.container().call_chain(class, "compare");
            if let Value::Service(proxy) = &lhs {
                if !chain.is_empty() {
                    return call_service(frame, ctx, proxy, "compare", vec![rhs]);
                }
            }
            if chain.is_empty() {
                frame.raise(Fault::guest(
                    ExceptionKind::Unsupported,
                    format!("{} is not orderable", class.name),
                ))
            } else {
                call_user(frame, chain, lhs, vec![rhs])
            }
        }
        TypeRef::Object => frame.raise(Fault::guest(
            ExceptionKind::Unsupported,
            "Object is not orderable",
        )),
    }
}

/// Push the string form of `value`, asking guest objects for `toString`.
pub(crate) fn to_string(frame: &mut Frame, ctx: &mut Ctx<'_>, value: Value) -> Step {
    let class = match &value {
        Value::Str(_) => return push(frame, value),
        Value::Object(_) | Value::Frozen(_) => match class_of(&value, &*ctx.heap) {
            Ok(class) => class,
            Err(error) => return frame.raise(error.into()),
        },
        other => return push(frame, Value::str(&other.to_string())),
    };
    let chain = class.map(|c| ctx.container().call_chain(&c, "toString"));
    match chain {
        Some(chain) if !chain.is_empty() => call_user(frame, chain, value, Vec::new()),
        _ => {
            let text = match &value {
                Value::Object(r) => format!("{}@{r}", value_class_name(ctx, *r)),
                other => other.to_string(),
            };
            push(frame, Value::str(&text))
        }
    }
}

fn value_class_name(ctx: &Ctx<'_>, r: crate::HeapRef) -> String {
    ctx.heap
        .class_of(r)
        .map(|c| c.name.clone())
        .unwrap_or_else(|_| "Object".to_string())
}
