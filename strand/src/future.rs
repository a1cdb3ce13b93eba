use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{Exception, FiberShared, Portable, runtime::Shared};

pub type FutureRef = Arc<FutureCell>;
pub type FutureResult = Result<Portable, Arc<Exception>>;

/// The reply slot of a cross-fiber call.
///
/// Completed exactly once by the callee's fiber; fibers that polled it
/// while it was pending are woken on completion.
pub struct FutureCell {
    inner: Mutex<FutureInner>,
}

struct FutureInner {
    result: Option<FutureResult>,
    waiters: Vec<Arc<FiberShared>>,
}

impl FutureCell {
    pub fn new() -> FutureRef {
        Arc::new(Self {
            inner: Mutex::new(FutureInner {
                result: None,
                waiters: Vec::new(),
            }),
        })
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().result.is_some()
    }

    pub fn peek(&self) -> Option<FutureResult> {
        self.inner.lock().result.clone()
    }

    /// Like [`peek`](Self::peek), but registers `fiber` to be woken if the
    /// result is not there yet.
    pub(crate) fn poll(&self, fiber: &Arc<FiberShared>) -> Option<FutureResult> {
        let mut inner = self.inner.lock();
        if let Some(result) = &inner.result {
            return Some(result.clone());
        }
        if !inner.waiters.iter().any(|w| Arc::ptr_eq(w, fiber)) {
            inner.waiters.push(Arc::clone(fiber));
        }
        None
    }

    /// Returns false if the future was already complete.
    pub(crate) fn complete(&self, result: FutureResult, rt: &Shared) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result);
            std::mem::take(&mut inner.waiters)
        };
        for fiber in &waiters {
            rt.wake(fiber);
        }
        true
    }
}

impl fmt::Debug for FutureCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureCell")
            .field("done", &self.is_done())
            .finish()
    }
}
