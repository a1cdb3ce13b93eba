use crate::{ExceptionKind, Fault, Step, Value};

use super::{NativeContext, expected};

fn operands(cx: &NativeContext<'_, '_>) -> Result<(i64, i64), Fault> {
    match (&cx.this, &cx.arg(0)) {
        (Value::Int(a), Value::Int(b)) => Ok((*a, *b)),
        (Value::Int(_), other) | (other, _) => Err(expected("Int", other)),
    }
}

fn overflow(op: &str, a: i64, b: i64) -> Fault {
    Fault::guest(ExceptionKind::Arithmetic, format!("{a} {op} {b} overflows"))
}

pub(super) fn equals(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx).map(|(a, b)| Value::Bool(a == b));
    cx.finish(result)
}

pub(super) fn compare(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx).map(|(a, b)| Value::Ordered(a.cmp(&b)));
    cx.finish(result)
}

pub(super) fn add(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx)
        .and_then(|(a, b)| a.checked_add(b).map(Value::Int).ok_or_else(|| overflow("+", a, b)));
    cx.finish(result)
}

pub(super) fn sub(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx)
        .and_then(|(a, b)| a.checked_sub(b).map(Value::Int).ok_or_else(|| overflow("-", a, b)));
    cx.finish(result)
}

pub(super) fn mul(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = operands(cx)
        .and_then(|(a, b)| a.checked_mul(b).map(Value::Int).ok_or_else(|| overflow("*", a, b)));
    cx.finish(result)
}

pub(super) fn neg(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = match cx.this {
        Value::Int(a) => a.checked_neg().map(Value::Int).ok_or_else(|| {
            Fault::guest(ExceptionKind::Arithmetic, format!("-{a} overflows"))
        }),
        ref other => Err(expected("Int", other)),
    };
    cx.finish(result)
}

pub(super) fn to_string(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = match cx.this {
        Value::Int(a) => Ok(Value::str(&a.to_string())),
        ref other => Err(expected("Int", other)),
    };
    cx.finish(result)
}
