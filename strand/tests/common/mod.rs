#![allow(dead_code)]

use std::time::Duration;

use strand::{
    ExceptionKind, FiberOutcome, FiberReport, Portable, Runtime, RuntimeConfig, ScaleConfig, Value,
};
use strand_bytecode::{Arg, ClassDef, CodeBuilder, Constant, MethodDef, Module};

pub fn r(n: u32) -> Arg {
    Arg::Reg(n)
}

pub fn config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        scale: ScaleConfig {
            max_pool_workers: workers,
            ..ScaleConfig::default()
        },
        timeout: Duration::from_secs(10),
        ..RuntimeConfig::default()
    }
}

/// Serialize `module` and load it back, so every test also exercises the
/// module format.
pub fn load(module: &Module, workers: usize) -> Runtime {
    Runtime::load(&module.encode(), config(workers)).expect("module loads")
}

pub fn run(module: &Module, args: Vec<Value>) -> FiberReport {
    load(module, 2).run("main", args).expect("entry fiber finishes")
}

pub fn returned(report: &FiberReport) -> &Value {
    match &report.outcome {
        FiberOutcome::Returned(value) => value.value(),
        other => panic!("expected a return, got {other:?}"),
    }
}

pub fn int(report: &FiberReport) -> i64 {
    match returned(report) {
        Value::Int(n) => *n,
        other => panic!("expected an Int, got {other:?}"),
    }
}

pub fn boolean(report: &FiberReport) -> bool {
    match returned(report) {
        Value::Bool(b) => *b,
        other => panic!("expected a Boolean, got {other:?}"),
    }
}

pub fn string(report: &FiberReport) -> String {
    match returned(report) {
        Value::Str(s) => s.to_string(),
        other => panic!("expected a String, got {other:?}"),
    }
}

pub fn fault(report: &FiberReport) -> ExceptionKind {
    match &report.outcome {
        FiberOutcome::Faulted(exception) => exception.kind,
        other => panic!("expected a fault, got {other:?}"),
    }
}

pub fn portable_int(value: &Portable) -> i64 {
    match value.value() {
        Value::Int(n) => *n,
        other => panic!("expected an Int, got {other:?}"),
    }
}

/// Builds modules for tests.
pub struct ModuleBuilder {
    pub module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    pub fn int(&mut self, n: i64) -> Arg {
        Arg::Const(self.module.constant(Constant::Int(n)))
    }

    pub fn boolean(&mut self, b: bool) -> Arg {
        Arg::Const(self.module.constant(Constant::Bool(b)))
    }

    pub fn string(&mut self, s: &str) -> Arg {
        Arg::Const(self.module.constant(Constant::String(s.into())))
    }

    pub fn null(&mut self) -> Arg {
        Arg::Const(self.module.constant(Constant::Null))
    }

    /// Constant index of a member name.
    pub fn name(&mut self, s: &str) -> u32 {
        self.module.constant(Constant::String(s.into()))
    }

    pub fn ty(&mut self, s: &str) -> u32 {
        self.module.constant(Constant::Type(s.into()))
    }

    pub fn method(&mut self, name: &str, params: usize, registers: u32, code: CodeBuilder) -> u32 {
        self.typed_method(name, vec![None; params], registers, code)
    }

    pub fn typed_method(
        &mut self,
        name: &str,
        params: Vec<Option<String>>,
        registers: u32,
        code: CodeBuilder,
    ) -> u32 {
        self.module.add_method(MethodDef {
            name: name.into(),
            params,
            registers,
            code: code.finish(),
        })
    }

    pub fn class(&mut self, name: &str, fields: u32, methods: Vec<u32>) -> u32 {
        self.module.add_class(ClassDef {
            name: name.into(),
            fields,
            methods,
            ..ClassDef::default()
        })
    }

    /// A service answering `echo(x)` with `x`.
    pub fn echo(&mut self) -> u32 {
        let mut b = CodeBuilder::new();
        b.ret(r(0));
        let echo = self.method("echo", 1, 1, b);
        self.class("Echo", 0, vec![echo])
    }

    /// A service holding a number: `construct(start)`, `increment(by)`,
    /// `get()`.
    pub fn counter(&mut self) -> u32 {
        let mut b = CodeBuilder::new();
        b.set_field(Arg::This, 0, r(0));
        b.ret_void();
        let construct = self.typed_method("construct", vec![Some("Int".into())], 1, b);

        let mut b = CodeBuilder::new();
        b.get_field(r(1), Arg::This, 0);
        b.add(r(1), r(1), r(0));
        b.set_field(Arg::This, 0, r(1));
        b.ret(r(1));
        let increment = self.typed_method("increment", vec![Some("Int".into())], 2, b);

        let mut b = CodeBuilder::new();
        b.get_field(r(0), Arg::This, 0);
        b.ret(r(0));
        let get = self.method("get", 0, 1, b);

        self.class("Counter", 1, vec![construct, increment, get])
    }

    pub fn main(&mut self, params: usize, registers: u32, code: CodeBuilder) -> u32 {
        self.method("main", params, registers, code)
    }

    pub fn finish(self) -> Module {
        self.module
    }
}
