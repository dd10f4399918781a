//! Process-wide state captured by jobs.
//!
//! A [`Global`] is a `static` value that job bodies may read and mutate.
//! In the default snapshot mode each scheduled job receives a deep copy of
//! every registered global, taken in the scheduling context at schedule time,
//! so mutations made inside a job never reach the scheduler or any other job.
//! Globals declared with [`Global::shared`] bypass the snapshot and are read
//! and written through their own lock by everyone.
//!
//! ```
//! use isoworker::captured::Global;
//!
//! static COUNTER: Global<i64> = Global::new("counter", 10);
//!
//! COUNTER.set(20);
//! assert_eq!(COUNTER.get(), 20);
//! ```
//!
//! Access to one global is not re-entrant: touching it again from inside its
//! own `with`/`update` closure deadlocks outside a job.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::transfer::{self, Transfer};

/// How jobs see a [`Global`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Each job works on its own deep copy.
    Snapshot,
    /// Jobs and the scheduler share one externally synchronized value.
    Shared,
}

static REGISTRY: RwLock<Vec<&'static dyn Capture>> = RwLock::new(Vec::new());

thread_local! {
    static SCOPE: RefCell<JobScope> = RefCell::new(JobScope::idle());
}

/// Type-erased view of a registered global.
trait Capture: Sync {
    fn id(&'static self) -> usize;

    fn mode(&self) -> CaptureMode;

    fn snapshot(&'static self) -> Result<Box<dyn Any + Send>, TransferError>;
}

/// A process-wide value with copy-on-schedule semantics.
pub struct Global<T> {
    name: &'static str,
    mode: CaptureMode,
    home: RwLock<T>,
    id: OnceLock<usize>,
    /// Copy of the value before its first access, for jobs scheduled while
    /// the global was still unregistered.
    initial: OnceLock<T>,
}

impl<T: Transfer + Sync> Global<T> {
    /// A global that jobs receive as an independent snapshot.
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            mode: CaptureMode::Snapshot,
            home: RwLock::new(value),
            id: OnceLock::new(),
            initial: OnceLock::new(),
        }
    }

    /// A global shared by reference with every job, synchronized by its lock.
    pub const fn shared(name: &'static str, value: T) -> Self {
        Self {
            name,
            mode: CaptureMode::Shared,
            home: RwLock::new(value),
            id: OnceLock::new(),
            initial: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Every access goes through here first, so no write can reach `home`
    /// before `initial` is taken.
    fn register(&'static self) -> usize {
        *self.id.get_or_init(|| {
            if self.mode == CaptureMode::Snapshot {
                let home = self.home.read().unwrap_or_else(|e| e.into_inner());
                // an uncopyable value is reported when a job first touches it
                if let Ok(copied) = transfer::copy(&*home) {
                    let _ = self.initial.set(copied.into_inner());
                }
            }

            let mut registry = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
            let id = registry.len();
            registry.push(self);
            tracing::trace!(global = self.name, id, "Registered captured global");
            id
        })
    }

    fn in_job_scope(&'static self) -> Option<usize> {
        let id = self.register();
        let active = self.mode == CaptureMode::Snapshot && SCOPE.with_borrow(|s| s.active);
        active.then_some(id)
    }

    /// Value for a global the job's snapshot does not cover. It was not
    /// registered at schedule time, so nobody had written it yet.
    fn initial_copy(&self) -> T {
        match self.initial.get() {
            Some(initial) => initial.deep_copy(),
            None => panic!("global {} could not be copied when first accessed", self.name),
        }
    }

    /// Read the value visible in the current context.
    pub fn with<R>(&'static self, f: impl FnOnce(&T) -> R) -> R {
        match self.in_job_scope() {
            Some(id) => self.with_snapshot(id, |v| f(v)),
            None => f(&self.home.read().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Mutate the value visible in the current context.
    pub fn update<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        match self.in_job_scope() {
            Some(id) => self.with_snapshot(id, f),
            None => f(&mut self.home.write().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Deep copy of the value visible in the current context.
    pub fn get(&'static self) -> T {
        self.with(Transfer::deep_copy)
    }

    pub fn set(&'static self, value: T) {
        self.update(|v| *v = value);
    }

    fn with_snapshot<R>(&'static self, id: usize, f: impl FnOnce(&mut T) -> R) -> R {
        // the slot is taken out so `f` may touch other globals
        let taken = SCOPE.with_borrow_mut(|scope| scope.values.remove(&id));
        let mut value = match taken.and_then(|slot| slot.downcast::<T>().ok()) {
            Some(value) => *value,
            None => self.initial_copy(),
        };
        let result = f(&mut value);
        SCOPE.with_borrow_mut(|scope| scope.values.insert(id, Box::new(value)));
        result
    }
}

impl<T: Transfer + Sync> Capture for Global<T> {
    fn id(&'static self) -> usize {
        self.register()
    }

    fn mode(&self) -> CaptureMode {
        self.mode
    }

    fn snapshot(&'static self) -> Result<Box<dyn Any + Send>, TransferError> {
        let copied = self.with(transfer::copy)?;
        Ok(Box::new(copied.into_inner()))
    }
}

/// Deep copies of every snapshot-mode global, taken for one job.
pub(crate) struct Snapshot {
    values: HashMap<usize, Box<dyn Any + Send>>,
}

impl Snapshot {
    /// Copy every registered snapshot-mode global as seen from the current
    /// context.
    pub(crate) fn capture() -> Result<Self, TransferError> {
        let globals: Vec<&'static dyn Capture> = REGISTRY
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut values = HashMap::with_capacity(globals.len());
        for global in globals {
            if global.mode() == CaptureMode::Shared {
                continue;
            }
            values.insert(global.id(), global.snapshot()?);
        }
        Ok(Self { values })
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    /// Make this snapshot the view of the current thread until the guard drops.
    pub(crate) fn enter(self) -> ScopeGuard {
        let previous = SCOPE.replace(JobScope {
            active: true,
            values: self.values,
        });
        ScopeGuard { previous }
    }
}

struct JobScope {
    active: bool,
    values: HashMap<usize, Box<dyn Any + Send>>,
}

impl JobScope {
    fn idle() -> Self {
        Self {
            active: false,
            values: HashMap::new(),
        }
    }
}

/// Restores the previous view when a job finishes.
pub(crate) struct ScopeGuard {
    previous: JobScope,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = std::mem::replace(&mut self.previous, JobScope::idle());
        SCOPE.set(previous);
    }
}
