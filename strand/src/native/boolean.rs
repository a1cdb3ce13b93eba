use crate::{Fault, Step, Value};

use super::{NativeContext, expected};

fn this(cx: &NativeContext<'_, '_>) -> Result<bool, Fault> {
    match cx.this {
        Value::Bool(b) => Ok(b),
        ref other => Err(expected("Boolean", other)),
    }
}

pub(super) fn equals(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = this(cx).and_then(|a| match cx.arg(0) {
        Value::Bool(b) => Ok(Value::Bool(a == b)),
        other => Err(expected("Boolean", &other)),
    });
    cx.finish(result)
}

pub(super) fn not(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = this(cx).map(|b| Value::Bool(!b));
    cx.finish(result)
}

pub(super) fn to_string(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = this(cx).map(|b| Value::str(if b { "true" } else { "false" }));
    cx.finish(result)
}
