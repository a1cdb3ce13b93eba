use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::RwLock;
use strand_bytecode::Module;

use crate::{
    ClassInfo, Container, FiberId, FiberReport, FiberShared, FiberState, FutureCell, FutureRef,
    LoadError, Portable, RuntimeError, Scheduler, ScaleConfig, ServiceProxy, Supervisor, Value,
    fiber::Request, future::FutureResult,
};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub scale: ScaleConfig,
    /// Instructions a fiber runs before it yields its worker.
    pub quantum: usize,
    pub max_call_depth: usize,
    /// How long [`Runtime::run`] waits for the entry fiber.
    pub timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scale: ScaleConfig::default(),
            quantum: 1000,
            max_call_depth: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// State reachable from every fiber.
pub(crate) struct Shared {
    pub(crate) container: Container,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) supervisor: Supervisor,
    pub(crate) config: RuntimeConfig,
    fibers: RwLock<HashMap<FiberId, Arc<FiberShared>>>,
    next_fiber: AtomicU64,
}

impl Shared {
    /// Schedule `fiber` if it is waiting for work.
    pub(crate) fn wake(&self, fiber: &Arc<FiberShared>) {
        if fiber.wake() {
            self.scheduler.submit(Arc::clone(fiber));
        }
    }

    pub(crate) fn request(&self, fiber: &Arc<FiberShared>, request: Request) {
        if fiber.enqueue(request, self) {
            self.scheduler.submit(Arc::clone(fiber));
        }
    }

    fn new_fiber(&self, name: String, class: Option<Arc<ClassInfo>>) -> Arc<FiberShared> {
        let id = FiberId(self.next_fiber.fetch_add(1, Ordering::Relaxed) + 1);
        let fiber = FiberShared::new(id, name, class);
        self.fibers.write().insert(id, Arc::clone(&fiber));
        debug!("created {id} ({})", fiber.name());
        fiber
    }

    /// Start a service fiber serving a new instance of `class`.
    pub(crate) fn spawn_service(&self, class: Arc<ClassInfo>, args: Vec<Portable>) -> ServiceProxy {
        let fiber = self.new_fiber(class.name.clone(), Some(Arc::clone(&class)));
        self.request(&fiber, Request::Construct { class, args });
        ServiceProxy::new(fiber)
    }

    pub(crate) fn retire(&self, fiber: FiberId) {
        self.fibers.write().remove(&fiber);
    }

    fn fiber(&self, id: FiberId) -> Option<Arc<FiberShared>> {
        self.fibers.read().get(&id).cloned()
    }
}

fn mask_args(args: &[Value]) -> Result<Vec<Portable>, RuntimeError> {
    args.iter()
        .map(|arg| Portable::mask(arg).map_err(|e| RuntimeError::Isolation(e.to_string())))
        .collect()
}

/// A loaded module and the fibers running its code.
///
/// Pool workers run fibers in the background; the calling thread takes part
/// whenever it waits on the runtime, which is the only way work gets done
/// when the pool is configured empty.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    pub fn new(module: &Module, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let container = Container::load(module)?;
        for method in container.methods() {
            method.linked().map_err(|source| LoadError::Link {
                method: method.qualified_name.clone(),
                source,
            })?;
        }
        info!(
            "loaded {}: {} methods, {} classes",
            container.name(),
            container.methods().len(),
            module.classes.len()
        );

        let shared = Arc::new_cyclic(|weak| {
            let weak = weak.clone();
            let scheduler = Arc::new(Scheduler::new(config.scale, move |fiber: Arc<FiberShared>| {
                if let Some(rt) = weak.upgrade() {
                    fiber.run_slice(&rt);
                }
            }));
            Shared {
                container,
                scheduler,
                supervisor: Supervisor::new(),
                config,
                fibers: RwLock::new(HashMap::new()),
                next_fiber: AtomicU64::new(0),
            }
        });
        Ok(Self { shared })
    }

    /// Decode a serialized module and load it.
    pub fn load(bytes: &[u8], config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let module = Module::decode(bytes).map_err(LoadError::from)?;
        Self::new(&module, config)
    }

    pub fn container(&self) -> &Container {
        &self.shared.container
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.shared.supervisor
    }

    /// Run the function `entry` on a new fiber.
    pub fn spawn(&self, entry: &str, args: Vec<Value>) -> Result<FiberId, RuntimeError> {
        let method = self
            .shared
            .container
            .function(entry)
            .ok_or_else(|| RuntimeError::NoSuchMethod(entry.to_string()))?;
        if method.arity() != args.len() {
            return Err(RuntimeError::Arity {
                method: entry.to_string(),
                expected: method.arity(),
                got: args.len(),
            });
        }
        let args = mask_args(&args)?;
        let fiber = self.shared.new_fiber(method.qualified_name.clone(), None);
        self.shared.request(
            &fiber,
            Request::Entry {
                method: Arc::clone(method),
                args,
            },
        );
        Ok(fiber.id())
    }

    /// Start a service fiber for a new instance of `class`.
    pub fn service(&self, class: &str, args: Vec<Value>) -> Result<ServiceProxy, RuntimeError> {
        let class = self
            .shared
            .container
            .class_named(class)
            .ok_or_else(|| RuntimeError::NoSuchClass(class.to_string()))?;
        let args = mask_args(&args)?;
        Ok(self.shared.spawn_service(Arc::clone(class), args))
    }

    /// Call `name` on a service from outside any fiber.
    pub fn invoke(
        &self,
        proxy: &ServiceProxy,
        name: &str,
        args: Vec<Value>,
    ) -> Result<FutureRef, RuntimeError> {
        let args = mask_args(&args)?;
        let reply = FutureCell::new();
        self.shared.request(
            proxy.fiber(),
            Request::Invoke {
                name: name.to_string(),
                args,
                reply: Arc::clone(&reply),
            },
        );
        Ok(reply)
    }

    /// Drive the runtime until `future` completes or `timeout` passes.
    pub fn resolve(&self, future: &FutureRef, timeout: Duration) -> Option<FutureResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = future.peek() {
                return Some(result);
            }
            if self.shared.scheduler.run_main_once() {
                continue;
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drive the runtime until `fiber` has terminated.
    pub fn wait(&self, fiber: FiberId, timeout: Duration) -> Result<FiberReport, RuntimeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(report) = self.shared.supervisor.get(fiber) {
                return Ok(report);
            }
            if self.shared.scheduler.run_main_once() {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("gave up waiting for {fiber}");
                return Err(RuntimeError::Timeout(fiber));
            }
            let nap = (deadline - now).min(Duration::from_millis(1));
            if let Some(report) = self.shared.supervisor.wait_for(fiber, nap) {
                return Ok(report);
            }
        }
    }

    /// Spawn `entry` and wait for it.
    pub fn run(&self, entry: &str, args: Vec<Value>) -> Result<FiberReport, RuntimeError> {
        let fiber = self.spawn(entry, args)?;
        self.wait(fiber, self.shared.config.timeout)
    }

    /// Kill `fiber` at its next slice. Returns false if it is not alive.
    pub fn terminate(&self, fiber: FiberId) -> bool {
        let Some(fiber) = self.shared.fiber(fiber) else {
            return false;
        };
        info!("terminating {}", fiber.id());
        fiber.kill();
        self.shared.wake(&fiber);
        true
    }

    /// `None` once the fiber has terminated.
    pub fn fiber_state(&self, fiber: FiberId) -> Option<FiberState> {
        self.shared.fiber(fiber).map(|f| f.state())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn live_fibers(&self) -> usize {
        self.shared.fibers.read().len()
    }

    pub fn shutdown(&self) {
        self.shared.scheduler.shutdown();
        let fibers: Vec<_> = self.shared.fibers.write().drain().map(|(_, f)| f).collect();
        for fiber in fibers {
            fiber.clear();
        }
        info!("runtime for {} shut down", self.shared.container.name());
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
