use std::{collections::HashMap, sync::Arc, time::Duration};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{Exception, FiberId, HostError, Portable};

/// How a fiber ended.
#[derive(Debug, Clone)]
pub enum FiberOutcome {
    /// The entry function returned.
    Returned(Portable),
    /// An exception reached the outermost frame, or the fiber was killed.
    Faulted(Arc<Exception>),
    /// The interpreter hit an internal error.
    Host { error: HostError, trace: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct FiberReport {
    pub fiber: FiberId,
    pub name: String,
    pub outcome: FiberOutcome,
}

impl FiberReport {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, FiberOutcome::Returned(_))
    }

    pub fn value(&self) -> Option<&Portable> {
        match &self.outcome {
            FiberOutcome::Returned(value) => Some(value),
            _ => None,
        }
    }

    pub fn exception(&self) -> Option<&Arc<Exception>> {
        match &self.outcome {
            FiberOutcome::Faulted(exception) => Some(exception),
            _ => None,
        }
    }

    /// Frames from the innermost outwards, as captured when the fault was
    /// raised.
    pub fn trace(&self) -> &[String] {
        match &self.outcome {
            FiberOutcome::Returned(_) => &[],
            FiberOutcome::Faulted(exception) => &exception.trace,
            FiberOutcome::Host { trace, .. } => trace,
        }
    }
}

/// Collects the reports of terminated fibers.
#[derive(Default)]
pub struct Supervisor {
    reports: Mutex<HashMap<FiberId, FiberReport>>,
    changed: Condvar,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, report: FiberReport) {
        debug!("report for {}: {:?}", report.fiber, report.outcome);
        self.reports.lock().insert(report.fiber, report);
        self.changed.notify_all();
    }

    pub fn get(&self, fiber: FiberId) -> Option<FiberReport> {
        self.reports.lock().get(&fiber).cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Block until `fiber` is reported or `timeout` passes.
    pub fn wait_for(&self, fiber: FiberId, timeout: Duration) -> Option<FiberReport> {
        let mut reports = self.reports.lock();
        if let Some(report) = reports.get(&fiber) {
            return Some(report.clone());
        }
        let _ = self.changed.wait_for(&mut reports, timeout);
        reports.get(&fiber).cloned()
    }
}
