mod common;

use common::{ModuleBuilder, config, fault, int, load, r, run, string};
use strand::{ExceptionKind, FiberOutcome, HostError, LoadError, Runtime, RuntimeError, Value};
use strand_bytecode::{Branch, ClassDef, CodeBuilder, Instruction, LinkError};

#[test]
fn a_guard_catches_a_throw() {
    let mut m = ModuleBuilder::new("guard");
    let oops = m.string("oops");
    let message = m.name("message");
    let mut b = CodeBuilder::new();
    let handler = b.guard(r(0));
    b.throw(oops);
    b.guard_end();
    b.bind(handler);
    b.invoke(r(1), r(0), message, &[]);
    b.ret(r(1));
    m.main(0, 2, b);

    assert_eq!(string(&run(&m.finish(), Vec::new())), "oops");
}

#[test]
fn exceptions_unwind_to_a_guard_in_a_calling_frame() {
    let mut m = ModuleBuilder::new("unwind");
    let deep = m.string("deep");
    let mut b = CodeBuilder::new();
    b.throw(deep);
    let inner = m.method("inner", 0, 0, b);
    let one = m.int(1);
    let mut b = CodeBuilder::new();
    let handler = b.guard(r(0));
    b.call(r(1), inner, &[]);
    b.guard_end();
    b.ret(r(1));
    b.bind(handler);
    b.ret(one);
    m.main(0, 2, b);

    assert_eq!(int(&run(&m.finish(), Vec::new())), 1);
}

#[test]
fn unhandled_exceptions_report_where_they_were_raised() {
    let mut m = ModuleBuilder::new("unhandled");
    let deep = m.string("deep");
    let mut b = CodeBuilder::new();
    b.throw(deep);
    let inner = m.method("inner", 0, 0, b);
    let mut b = CodeBuilder::new();
    b.call(r(0), inner, &[]);
    b.ret(r(0));
    m.main(0, 1, b);

    let report = run(&m.finish(), Vec::new());
    assert_eq!(fault(&report), ExceptionKind::Thrown);
    assert_eq!(report.exception().unwrap().message, "deep");
    assert_eq!(report.trace(), ["inner @0", "main @0"]);
}

#[test]
fn integer_overflow_is_an_arithmetic_exception() {
    let mut m = ModuleBuilder::new("overflow");
    let (max, one) = (m.int(i64::MAX), m.int(1));
    let mut b = CodeBuilder::new();
    b.add(r(0), max, one);
    b.ret(r(0));
    m.main(0, 1, b);

    assert_eq!(fault(&run(&m.finish(), Vec::new())), ExceptionKind::Arithmetic);
}

#[test]
fn runaway_recursion_overflows_the_stack() {
    let mut m = ModuleBuilder::new("runaway");
    let mut b = CodeBuilder::new();
    b.call(r(0), 0, &[]);
    b.ret(r(0));
    m.main(0, 1, b);

    let mut config = config(1);
    config.max_call_depth = 32;
    let runtime = Runtime::load(&m.finish().encode(), config).unwrap();
    let report = runtime.run("main", Vec::new()).unwrap();
    assert_eq!(fault(&report), ExceptionKind::StackOverflow);
    let trace = report.trace();
    assert!(trace.len() > 30);
    assert!(trace.iter().all(|line| line == "main @0"));
}

#[test]
fn lazy_references_compute_on_first_read() {
    let mut m = ModuleBuilder::new("lazy");
    let seven = m.int(7);
    let mut b = CodeBuilder::new();
    b.ret(seven);
    let compute = m.method("compute", 0, 0, b);
    let mut b = CodeBuilder::new();
    b.new_lazy(r(0), compute);
    b.ref_get(r(1), r(0));
    b.ref_get(r(2), r(0));
    b.add(r(3), r(1), r(2));
    b.ret(r(3));
    m.main(0, 4, b);

    assert_eq!(int(&run(&m.finish(), Vec::new())), 14);
}

#[test]
fn assigned_lazy_references_are_read_only() {
    let mut m = ModuleBuilder::new("lazy-set");
    let seven = m.int(7);
    let mut b = CodeBuilder::new();
    b.ret(seven);
    let compute = m.method("compute", 0, 0, b);
    let eight = m.int(8);
    let mut b = CodeBuilder::new();
    b.new_lazy(r(0), compute);
    b.ref_get(r(1), r(0));
    b.ref_set(r(0), eight);
    b.ret(r(1));
    m.main(0, 2, b);

    assert_eq!(fault(&run(&m.finish(), Vec::new())), ExceptionKind::ReadOnly);
}

#[test]
fn plain_references_hold_the_last_value_set() {
    let mut m = ModuleBuilder::new("ref");
    let (one, five) = (m.int(1), m.int(5));
    let mut b = CodeBuilder::new();
    b.new_ref(r(0), one);
    b.ref_set(r(0), five);
    b.ref_get(r(1), r(0));
    b.ret(r(1));
    m.main(0, 2, b);

    assert_eq!(int(&run(&m.finish(), Vec::new())), 5);
}

#[test]
fn frozen_objects_reject_writes() {
    let mut m = ModuleBuilder::new("frozen");
    let point = m.class("Point", 1, Vec::new());
    let (one, two) = (m.int(1), m.int(2));
    let mut b = CodeBuilder::new();
    b.new_object(r(0), point, &[one]);
    b.freeze(r(1), r(0));
    b.set_field(r(1), 0, two);
    b.ret_void();
    m.main(0, 2, b);

    assert_eq!(fault(&run(&m.finish(), Vec::new())), ExceptionKind::ReadOnly);
}

#[test]
fn invoking_on_null_is_a_null_dereference() {
    let mut m = ModuleBuilder::new("null");
    let null = m.null();
    let size = m.name("size");
    let mut b = CodeBuilder::new();
    b.invoke(r(0), null, size, &[]);
    b.ret(r(0));
    m.main(0, 1, b);

    assert_eq!(
        fault(&run(&m.finish(), Vec::new())),
        ExceptionKind::NullDereference
    );
}

#[test]
fn super_walks_mixins_before_the_superclass() {
    let mut m = ModuleBuilder::new("super");
    let base = m.string("base");
    let mut b = CodeBuilder::new();
    b.ret(base);
    let base_greet = m.method("greet", 0, 0, b);

    let bang = m.string("!");
    let mut b = CodeBuilder::new();
    b.super_call(r(0), &[]);
    b.add(r(0), r(0), bang);
    b.ret(r(0));
    let shout_greet = m.method("greet", 0, 1, b);

    let prefix = m.string("derived>");
    let mut b = CodeBuilder::new();
    b.super_call(r(0), &[]);
    b.add(r(0), prefix, r(0));
    b.ret(r(0));
    let derived_greet = m.method("greet", 0, 1, b);

    m.class("Base", 0, vec![base_greet]);
    m.class("Shout", 0, vec![shout_greet]);
    let derived = m.module.add_class(ClassDef {
        name: "Derived".into(),
        super_class: Some("Base".into()),
        mixins: vec!["Shout".into()],
        methods: vec![derived_greet],
        ..ClassDef::default()
    });

    let greet = m.name("greet");
    let mut b = CodeBuilder::new();
    b.new_object(r(0), derived, &[]);
    b.invoke(r(1), r(0), greet, &[]);
    b.ret(r(1));
    m.main(0, 2, b);

    assert_eq!(string(&run(&m.finish(), Vec::new())), "derived>base!");
}

#[test]
fn new_runs_the_constructor_before_storing_the_object() {
    let mut m = ModuleBuilder::new("new");
    let counter = m.counter();
    let increment = m.name("increment");
    let (ten, one) = (m.int(10), m.int(1));
    let mut b = CodeBuilder::new();
    b.new_object(r(0), counter, &[ten]);
    b.invoke(r(1), r(0), increment, &[one]);
    b.ret(r(1));
    m.main(0, 2, b);

    assert_eq!(int(&run(&m.finish(), Vec::new())), 11);
}

#[test]
fn host_errors_bypass_guards() {
    let mut m = ModuleBuilder::new("host");
    let one = m.int(1);
    let mut b = CodeBuilder::new();
    let handler = b.guard(r(0));
    b.mov(r(9), one);
    b.guard_end();
    b.bind(handler);
    b.ret(one);
    m.main(0, 1, b);

    let report = run(&m.finish(), Vec::new());
    match &report.outcome {
        FiberOutcome::Host { error, trace } => {
            assert_eq!(*error, HostError::BadRegister { reg: 9 });
            assert_eq!(trace, &["main @1"]);
        }
        other => panic!("expected a host failure, got {other:?}"),
    }
}

#[test]
fn loading_rejects_unlinkable_code() {
    let mut m = ModuleBuilder::new("broken");
    let mut b = CodeBuilder::new();
    b.emit(Instruction::Jump {
        branch: Branch::new(7),
    });
    m.main(0, 0, b);

    let err = Runtime::new(&m.finish(), config(0)).err().unwrap();
    assert_eq!(
        err,
        RuntimeError::Load(LoadError::Link {
            method: "main".into(),
            source: LinkError::TargetOutOfRange {
                index: 0,
                offset: 7,
                len: 1,
            },
        })
    );
}

#[test]
fn loading_rejects_unknown_superclasses() {
    let mut m = ModuleBuilder::new("orphan");
    m.module.add_class(ClassDef {
        name: "Orphan".into(),
        super_class: Some("Missing".into()),
        ..ClassDef::default()
    });

    assert!(matches!(
        Runtime::new(&m.finish(), config(0)),
        Err(RuntimeError::Load(LoadError::UnknownClass { name })) if name == "Missing"
    ));
}

#[test]
fn entry_points_are_checked_before_spawning() {
    let mut m = ModuleBuilder::new("entry");
    let mut b = CodeBuilder::new();
    b.ret(r(0));
    m.main(1, 1, b);
    let runtime = load(&m.finish(), 0);

    assert_eq!(
        runtime.spawn("missing", Vec::new()),
        Err(RuntimeError::NoSuchMethod("missing".into()))
    );
    assert_eq!(
        runtime.spawn("main", Vec::new()),
        Err(RuntimeError::Arity {
            method: "main".into(),
            expected: 1,
            got: 0,
        })
    );
    let report = runtime.run("main", vec![Value::Int(3)]).unwrap();
    assert_eq!(int(&report), 3);
    assert_eq!(runtime.live_fibers(), 0);
}
