//! Methods of the built-in types.
//!
//! A native method gets the calling frame and its arguments and answers
//! with a [`Step`], exactly like an op: it delivers a value and returns
//! `Next`, pushes a child frame and returns `Call`, or raises.

mod boolean;
mod int;
mod string;

use std::{cmp::Ordering, collections::HashMap};

use log::trace;
use strand_bytecode::Arg;

use crate::{Ctx, ExceptionKind, Fault, Frame, Step, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Int,
    String,
    Boolean,
    Ordered,
    Exception,
}

impl NativeType {
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Int(_) => Some(NativeType::Int),
            Value::Str(_) => Some(NativeType::String),
            Value::Bool(_) => Some(NativeType::Boolean),
            Value::Ordered(_) => Some(NativeType::Ordered),
            Value::Exception(_) => Some(NativeType::Exception),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Int" => Some(NativeType::Int),
            "String" => Some(NativeType::String),
            "Boolean" => Some(NativeType::Boolean),
            "Ordered" => Some(NativeType::Ordered),
            "Exception" => Some(NativeType::Exception),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NativeType::Int => "Int",
            NativeType::String => "String",
            NativeType::Boolean => "Boolean",
            NativeType::Ordered => "Ordered",
            NativeType::Exception => "Exception",
        }
    }
}

pub type NativeFn = fn(&mut NativeContext<'_, '_>) -> Step;

pub struct NativeContext<'a, 'c> {
    pub frame: &'a mut Frame,
    pub ctx: &'a mut Ctx<'c>,
    pub this: Value,
    pub args: Vec<Value>,
    /// Destination of the result in the calling frame.
    pub ret: Arg,
}

impl NativeContext<'_, '_> {
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }

    pub fn ret(&mut self, value: Value) -> Step {
        match self.frame.assign(self.ret, value) {
            Ok(()) => Step::Next,
            Err(fault) => self.frame.raise(fault),
        }
    }

    pub fn raise(&mut self, fault: Fault) -> Step {
        self.frame.raise(fault)
    }

    pub fn finish(&mut self, result: Result<Value, Fault>) -> Step {
        match result {
            Ok(value) => self.ret(value),
            Err(fault) => self.raise(fault),
        }
    }
}

pub struct NativeMethod {
    pub ty: NativeType,
    pub name: &'static str,
    pub arity: usize,
    pub func: NativeFn,
}

impl NativeMethod {
    pub const fn new(ty: NativeType, name: &'static str, arity: usize, func: NativeFn) -> Self {
        Self {
            ty,
            name,
            arity,
            func,
        }
    }
}

pub const NATIVE_METHODS: &[NativeMethod] = &[
    NativeMethod::new(NativeType::Int, "equals", 1, int::equals),
    NativeMethod::new(NativeType::Int, "compare", 1, int::compare),
    NativeMethod::new(NativeType::Int, "add", 1, int::add),
    NativeMethod::new(NativeType::Int, "sub", 1, int::sub),
    NativeMethod::new(NativeType::Int, "mul", 1, int::mul),
    NativeMethod::new(NativeType::Int, "neg", 0, int::neg),
    NativeMethod::new(NativeType::Int, "toString", 0, int::to_string),
    NativeMethod::new(NativeType::String, "equals", 1, string::equals),
    NativeMethod::new(NativeType::String, "compare", 1, string::compare),
    NativeMethod::new(NativeType::String, "add", 1, string::add),
    NativeMethod::new(NativeType::String, "size", 0, string::size),
    NativeMethod::new(NativeType::String, "toString", 0, string::to_string),
    NativeMethod::new(NativeType::Boolean, "equals", 1, boolean::equals),
    NativeMethod::new(NativeType::Boolean, "not", 0, boolean::not),
    NativeMethod::new(NativeType::Boolean, "toString", 0, boolean::to_string),
    NativeMethod::new(NativeType::Ordered, "equals", 1, ordered_equals),
    NativeMethod::new(NativeType::Ordered, "reverse", 0, ordered_reverse),
    NativeMethod::new(NativeType::Ordered, "toString", 0, display),
    NativeMethod::new(NativeType::Exception, "message", 0, exception_message),
    NativeMethod::new(NativeType::Exception, "toString", 0, display),
];

/// Native methods by type and name, built from [`NATIVE_METHODS`].
pub struct NativeRegistry {
    methods: HashMap<NativeType, HashMap<&'static str, &'static NativeMethod>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        let mut methods: HashMap<NativeType, HashMap<_, _>> = HashMap::new();
        for method in NATIVE_METHODS {
            methods.entry(method.ty).or_default().insert(method.name, method);
        }
        Self { methods }
    }

    pub fn lookup(&self, ty: NativeType, name: &str) -> Option<&'static NativeMethod> {
        self.methods.get(&ty)?.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Call a native method with the result going to `ret` in `frame`.
pub(crate) fn invoke_native(
    frame: &mut Frame,
    ctx: &mut Ctx<'_>,
    method: &NativeMethod,
    this: Value,
    args: Vec<Value>,
    ret: Arg,
) -> Step {
    if args.len() != method.arity {
        return frame.raise(Fault::guest(
            ExceptionKind::IllegalArgument,
            format!(
                "{}.{} takes {} arguments, got {}",
                method.ty.name(),
                method.name,
                method.arity,
                args.len()
            ),
        ));
    }
    trace!("native {}.{}", method.ty.name(), method.name);
    let mut cx = NativeContext {
        frame,
        ctx,
        this,
        args,
        ret,
    };
    (method.func)(&mut cx)
}

pub(crate) fn expected(ty: &str, got: &Value) -> Fault {
    Fault::guest(
        ExceptionKind::IllegalArgument,
        format!("expected {ty}, got {}", got.type_name()),
    )
}

fn ordered(value: &Value) -> Result<Ordering, Fault> {
    match value {
        Value::Ordered(o) => Ok(*o),
        other => Err(expected("Ordered", other)),
    }
}

fn ordered_equals(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = ordered(&cx.this)
        .and_then(|a| Ok(Value::Bool(a == ordered(&cx.arg(0))?)));
    cx.finish(result)
}

fn ordered_reverse(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = ordered(&cx.this).map(|o| Value::Ordered(o.reverse()));
    cx.finish(result)
}

fn exception_message(cx: &mut NativeContext<'_, '_>) -> Step {
    let result = match &cx.this {
        Value::Exception(e) => Ok(Value::str(&e.message)),
        other => Err(expected("Exception", other)),
    };
    cx.finish(result)
}

fn display(cx: &mut NativeContext<'_, '_>) -> Step {
    let s = cx.this.to_string();
    cx.ret(Value::str(&s))
}
