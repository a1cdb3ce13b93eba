use std::sync::Arc;

use crate::{Fault, Step, Value, chain, types};

use super::{NativeContext, expected};

fn this(cx: &NativeContext<'_, '_>) -> Result<Arc<str>, Fault> {
    match &cx.this {
        Value::Str(s) => Ok(Arc::clone(s)),
        other => Err(expected("String", other)),
    }
}

fn operands(cx: &NativeContext<'_, '_>) -> Result<(Arc<str>, Arc<str>), Fault> {
    let a = this(cx)?;
    match cx.arg(0) {
        Value::Str(b) => Ok((a, b)),
        other => Err(expected("String", &other)),
    }
}

pub(super) fn equals(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx).map(|(a, b)| Value::Bool(a == b));
    cx.finish(result)
}

pub(super) fn compare(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx).map(|(a, b)| Value::Ordered(a.cmp(&b)));
    cx.finish(result)
}

pub(super) fn size(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = this(cx).map(|s| Value::Int(s.chars().count() as i64));
    cx.finish(result)
}

pub(super) fn to_string(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = this(cx).map(Value::Str);
    cx.finish(result)
}

/// Concatenation. The right side is converted with its own `toString`,
/// which for guest objects runs guest code first.
pub(super) fn add(cx: &mut NativeContext<'_, '_>) -> Step {
    let lhs = match this(cx) {
        Ok(lhs) => lhs,
        Err(fault) => return cx.raise(fault),
    };
    let rhs = cx.arg(0);
    let ret = cx.ret;
    let step = types::to_string(cx.frame, cx.ctx, rhs);
    chain(cx.frame, cx.ctx, step, move |frame, _| {
        let joined = match frame.pop() {
            Ok(Value::Str(rhs)) => Value::str(&format!("{lhs}{rhs}")),
            Ok(other) => return frame.raise(expected("String", &other)),
            Err(fault) => return frame.raise(fault),
        };
        match frame.assign(ret, joined) {
            Ok(()) => Step::Next,
            Err(fault) => frame.raise(fault),
        }
    })
}
