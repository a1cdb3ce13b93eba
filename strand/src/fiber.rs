//! Fibers: cooperatively scheduled units of isolation.
//!
//! A fiber owns a private heap and works through the requests in its
//! inbox one at a time. A request whose frame stack waits on another
//! fiber is parked, and the fiber goes on with the next request; it is
//! resumed once the awaited future completes. Only frozen values and
//! service proxies ever cross between fibers.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, warn};
use parking_lot::Mutex;
use strand_bytecode::Arg;

use crate::{
    ClassInfo, Ctx, Exception, ExceptionKind, Fault, Frame, FutureRef, Heap, MethodInfo,
    Portable, Value,
    frame::Reply,
    interpreter::{self, Exit, Progress},
    runtime::Shared,
    supervisor::{FiberOutcome, FiberReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Nothing to do.
    Idle,
    /// Queued on a worker.
    Ready,
    Running,
    /// Every request in flight waits on another fiber.
    Suspended,
    Terminated,
}

/// Work queued on a fiber.
pub(crate) enum Request {
    /// Run a function as the fiber's whole life.
    Entry {
        method: Arc<MethodInfo>,
        args: Vec<Portable>,
    },
    /// Create the object a service fiber serves.
    Construct {
        class: Arc<ClassInfo>,
        args: Vec<Portable>,
    },
    /// A call through a service proxy.
    Invoke {
        name: String,
        args: Vec<Portable>,
        reply: FutureRef,
    },
}

impl Request {
    /// Answer a request that will never run.
    fn refuse(self, rt: &Shared, why: &str) {
        if let Request::Invoke { reply, .. } = self {
            let exception = Exception::new(ExceptionKind::ServiceTerminated, why);
            reply.complete(Err(Arc::new(exception)), rt);
        }
    }
}

struct Sched {
    state: FiberState,
    /// Set when work arrives while the fiber runs.
    wake_pending: bool,
}

struct FiberBody {
    heap: Heap,
    current: Option<Box<Frame>>,
    parked: Vec<Box<Frame>>,
    /// The object a service fiber dispatches invocations to.
    service: Option<Value>,
    constructing: bool,
}

enum Slice {
    /// The quantum ran out with work left.
    Exhausted,
    /// Nothing can run until another fiber answers or a request arrives.
    Blocked { waiting: bool },
    Done(FiberOutcome),
}

pub struct FiberShared {
    id: FiberId,
    name: String,
    class: Option<Arc<ClassInfo>>,
    sched: Mutex<Sched>,
    inbox: Mutex<VecDeque<Request>>,
    body: Mutex<FiberBody>,
    killed: AtomicBool,
}

impl FiberShared {
    pub fn new(id: FiberId, name: impl Into<String>, class: Option<Arc<ClassInfo>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            class,
            sched: Mutex::new(Sched {
                state: FiberState::Idle,
                wake_pending: false,
            }),
            inbox: Mutex::new(VecDeque::new()),
            body: Mutex::new(FiberBody {
                heap: Heap::new(id),
                current: None,
                parked: Vec::new(),
                service: None,
                constructing: false,
            }),
            killed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The class of the object this fiber serves, for service fibers.
    pub fn class(&self) -> Option<&Arc<ClassInfo>> {
        self.class.as_ref()
    }

    pub fn state(&self) -> FiberState {
        self.sched.lock().state
    }

    /// Queue `request`, scheduling the fiber if it is not already queued or
    /// running. Returns true if the caller has to submit the fiber.
    pub(crate) fn enqueue(&self, request: Request, rt: &Shared) -> bool {
        let mut sched = self.sched.lock();
        if sched.state == FiberState::Terminated {
            drop(sched);
            warn!("request to terminated {}", self.id);
            request.refuse(rt, &format!("{} has terminated", self.name));
            return false;
        }
        self.inbox.lock().push_back(request);
        Self::mark_ready(&mut sched, self.id)
    }

    /// Returns true if the caller has to submit the fiber.
    pub(crate) fn wake(&self) -> bool {
        let mut sched = self.sched.lock();
        Self::mark_ready(&mut sched, self.id)
    }

    fn mark_ready(sched: &mut Sched, id: FiberId) -> bool {
        match sched.state {
            FiberState::Idle | FiberState::Suspended => {
                debug!("{id}: {:?} -> Ready", sched.state);
                sched.state = FiberState::Ready;
                true
            }
            FiberState::Running => {
                sched.wake_pending = true;
                false
            }
            FiberState::Ready | FiberState::Terminated => false,
        }
    }

    /// Ask the fiber to stop at its next slice.
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Run up to one quantum of this fiber's work on the calling thread.
    pub(crate) fn run_slice(self: &Arc<Self>, rt: &Arc<Shared>) {
        {
            let mut sched = self.sched.lock();
            if sched.state == FiberState::Terminated {
                return;
            }
            sched.state = FiberState::Running;
            sched.wake_pending = false;
        }

        let slice = if self.killed.load(Ordering::Acquire) {
            let exception = Exception::new(ExceptionKind::Terminated, "terminated by supervisor");
            Slice::Done(FiberOutcome::Faulted(Arc::new(exception)))
        } else {
            self.body.lock().run(self, rt)
        };

        let waiting = match slice {
            Slice::Done(outcome) => return self.terminate(rt, outcome),
            Slice::Exhausted => None,
            Slice::Blocked { waiting } => Some(waiting),
        };

        let mut sched = self.sched.lock();
        let resubmit = match waiting {
            None => true,
            Some(_) if sched.wake_pending => true,
            Some(waiting) => {
                sched.state = if waiting {
                    FiberState::Suspended
                } else {
                    FiberState::Idle
                };
                debug!("{}: Running -> {:?}", self.id, sched.state);
                false
            }
        };
        if resubmit {
            sched.state = FiberState::Ready;
            sched.wake_pending = false;
            drop(sched);
            rt.scheduler.submit(Arc::clone(self));
        }
    }

    /// End the fiber: refuse everything still queued or in flight and
    /// report `outcome` to the supervisor.
    fn terminate(self: &Arc<Self>, rt: &Arc<Shared>, outcome: FiberOutcome) {
        {
            let mut sched = self.sched.lock();
            if sched.state == FiberState::Terminated {
                return;
            }
            debug!("{}: {:?} -> Terminated", self.id, sched.state);
            sched.state = FiberState::Terminated;
        }
        let why = format!("{} has terminated", self.name);
        let pending: Vec<Request> = self.inbox.lock().drain(..).collect();
        for request in pending {
            request.refuse(rt, &why);
        }
        let frames = self.body.lock().clear();
        for mut frame in frames {
            if let Some(Reply::Future(reply)) = frame.take_root_reply() {
                let exception = Exception::new(ExceptionKind::ServiceTerminated, why.as_str());
                reply.complete(Err(Arc::new(exception)), rt);
            }
        }

        match &outcome {
            FiberOutcome::Returned(value) => debug!("{} returned {}", self.id, value.value()),
            FiberOutcome::Faulted(exception) => {
                error!("{} ({}) terminated: {exception}", self.id, self.name)
            }
            FiberOutcome::Host { error, .. } => {
                error!("{} ({}) failed: {error}", self.id, self.name)
            }
        }
        rt.retire(self.id);
        rt.supervisor.report(FiberReport {
            fiber: self.id,
            name: self.name.clone(),
            outcome,
        });
    }

    /// Drop all frames and heap contents, breaking reference cycles through
    /// continuations.
    pub(crate) fn clear(&self) {
        self.inbox.lock().clear();
        self.body.lock().clear();
    }
}

impl FiberBody {
    fn clear(&mut self) -> Vec<Box<Frame>> {
        self.service = None;
        self.constructing = false;
        self.heap = Heap::new(self.heap.fiber());
        let mut frames: Vec<_> = self.parked.drain(..).collect();
        frames.extend(self.current.take());
        frames
    }

    fn run(&mut self, fiber: &Arc<FiberShared>, rt: &Arc<Shared>) -> Slice {
        let mut budget = rt.config.quantum.max(1);
        loop {
            if self.current.is_none() {
                if let Some(index) = self.parked.iter().position(|frame| frame.is_ready()) {
                    self.current = Some(self.parked.swap_remove(index));
                } else if self.constructing {
                    return Slice::Blocked { waiting: true };
                } else {
                    let Some(request) = fiber.inbox.lock().pop_front() else {
                        return Slice::Blocked {
                            waiting: !self.parked.is_empty(),
                        };
                    };
                    if let Some(outcome) = self.begin(request, fiber, rt) {
                        return Slice::Done(outcome);
                    }
                    continue;
                }
            }
            if budget == 0 {
                return Slice::Exhausted;
            }
            budget -= 1;

            let Some(frame) = self.current.take() else {
                continue;
            };
            let mut ctx = Ctx::new(&mut self.heap, fiber, rt);
            match interpreter::execute(frame, &mut ctx) {
                Progress::Running(frame) => self.current = Some(frame),
                Progress::Parked(frame) => self.parked.push(frame),
                Progress::Exit(exit) => {
                    if let Some(outcome) = self.exit(exit, rt) {
                        return Slice::Done(outcome);
                    }
                }
            }
        }
    }

    /// Set up the frame stack for `request`. Returns an outcome if the fiber
    /// cannot go on.
    fn begin(
        &mut self,
        request: Request,
        fiber: &Arc<FiberShared>,
        rt: &Arc<Shared>,
    ) -> Option<FiberOutcome> {
        match request {
            Request::Entry { method, args } => {
                let frame = reveal(args, &method.params)
                    .map_err(Fault::from)
                    .and_then(|args| Frame::call(&method, None, args, Arg::Ignore));
                match frame {
                    Ok(mut frame) => {
                        frame.reply = Some(Reply::Entry);
                        self.current = Some(frame);
                        None
                    }
                    Err(fault) => Some(outcome_of(fault, Vec::new())),
                }
            }
            Request::Construct { class, args } => {
                let ctor = rt.container.call_chain(&class, "construct");
                let params = ctor.top().map(|m| m.params.clone()).unwrap_or_default();
                let args = match reveal(args, &params) {
                    Ok(args) => args,
                    Err(exception) => return Some(FiberOutcome::Faulted(Arc::new(exception))),
                };
                let mut ctx = Ctx::new(&mut self.heap, fiber, rt);
                match interpreter::instantiate(&mut ctx, &class, args) {
                    Ok((object, None)) => {
                        self.service = Some(object);
                        None
                    }
                    Ok((object, Some(mut frame))) => {
                        frame.reply = Some(Reply::Construct(object));
                        self.constructing = true;
                        self.current = Some(frame);
                        None
                    }
                    Err(fault) => Some(outcome_of(fault, Vec::new())),
                }
            }
            Request::Invoke { name, args, reply } => {
                match self.invocation(&name, args, rt) {
                    Ok(mut frame) => {
                        frame.reply = Some(Reply::Future(reply));
                        self.current = Some(frame);
                        None
                    }
                    Err(Fault::Guest(exception)) => {
                        debug!("{}: refused {name}: {exception}", fiber.id);
                        reply.complete(Err(exception), rt);
                        None
                    }
                    Err(Fault::Host(err)) => {
                        reply.complete(Err(Arc::new(Exception::new(
                            ExceptionKind::ServiceTerminated,
                            err.to_string(),
                        ))), rt);
                        Some(FiberOutcome::Host {
                            error: err,
                            trace: Vec::new(),
                        })
                    }
                }
            }
        }
    }

    fn invocation(&self, name: &str, args: Vec<Portable>, rt: &Shared) -> Result<Box<Frame>, Fault> {
        let Some(target) = self.service.clone() else {
            return Err(Fault::guest(
                ExceptionKind::Unsupported,
                format!("no service object to receive {name}"),
            ));
        };
        let class = match crate::types::class_of(&target, &self.heap)? {
            Some(class) => class,
            None => return Err(Fault::guest(ExceptionKind::Unsupported, "not a service")),
        };
        let methods = rt.container.call_chain(&class, name);
        let Some(top) = methods.top() else {
            return Err(Fault::guest(
                ExceptionKind::Unsupported,
                format!("{} has no method {name}", class.name),
            ));
        };
        let args = reveal(args, &top.params)?;
        Frame::call_chain(methods, 0, target, args, Arg::Ignore)
    }

    /// Deliver the outcome of a finished request stack. Returns an outcome
    /// if the fiber ends with it.
    fn exit(&mut self, exit: Exit, rt: &Shared) -> Option<FiberOutcome> {
        match exit {
            Exit::Returned(value, Reply::Entry) => Some(match Portable::mask(&value) {
                Ok(value) => FiberOutcome::Returned(value),
                Err(exception) => FiberOutcome::Faulted(Arc::new(exception)),
            }),
            Exit::Returned(_, Reply::Construct(object)) => {
                self.service = Some(object);
                self.constructing = false;
                None
            }
            Exit::Returned(value, Reply::Future(reply)) => {
                let result = Portable::mask(&value).map_err(|exception| {
                    warn!("result refused at fiber boundary: {exception}");
                    Arc::new(exception)
                });
                reply.complete(result, rt);
                None
            }
            Exit::Faulted(exception, Reply::Future(reply)) => {
                reply.complete(Err(exception), rt);
                None
            }
            Exit::Faulted(exception, Reply::Entry | Reply::Construct(_)) => {
                Some(FiberOutcome::Faulted(exception))
            }
            Exit::Host(err, trace, reply) => {
                if let Some(Reply::Future(reply)) = reply {
                    let exception = Exception::new(ExceptionKind::ServiceTerminated, err.to_string());
                    reply.complete(Err(Arc::new(exception)), rt);
                }
                Some(FiberOutcome::Host { error: err, trace })
            }
        }
    }
}

fn reveal(args: Vec<Portable>, params: &[Option<String>]) -> Result<Vec<Value>, Exception> {
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| arg.reveal(params.get(i).and_then(|p| p.as_deref())))
        .collect()
}

fn outcome_of(fault: Fault, trace: Vec<String>) -> FiberOutcome {
    match fault {
        Fault::Guest(exception) => FiberOutcome::Faulted(exception),
        Fault::Host(error) => FiberOutcome::Host { error, trace },
    }
}

/// Handle to a service fiber; the only way to reach another fiber's
/// objects.
#[derive(Clone)]
pub struct ServiceProxy {
    fiber: Arc<FiberShared>,
}

impl ServiceProxy {
    pub(crate) fn new(fiber: Arc<FiberShared>) -> Self {
        Self { fiber }
    }

    pub fn id(&self) -> FiberId {
        self.fiber.id
    }

    pub fn class(&self) -> Option<&Arc<ClassInfo>> {
        self.fiber.class()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class().map(|class| class.name.as_str())
    }

    pub(crate) fn fiber(&self) -> &Arc<FiberShared> {
        &self.fiber
    }
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.class_name().unwrap_or("Service"), self.fiber.id)
    }
}
