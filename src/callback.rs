//! Deferred cleanup registry.
//!
//! A [`CallbackRegister`] collects cleanup callbacks together with their
//! arguments and runs them last-in first-out. A failing (or panicking)
//! callback is logged with the register's name and does not stop the
//! remaining ones, so resources registered early are still released when a
//! later cleanup breaks.
//!
//! Besides per-job registers, the process owns one explicitly initialized
//! register, [`at_exit`], which the binary drains right before exiting.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use avocado_pipeline::callback::{CallbackFn, CallbackRegister};
//!
//! let remove: CallbackFn = Arc::new(|args, _kwargs| {
//!     for path in args {
//!         let _ = std::fs::remove_file(path);
//!     }
//!     Ok(())
//! });
//!
//! let mut register = CallbackRegister::new("cleanup");
//! register.register(remove, vec!["/tmp/stale.lock".into()], BTreeMap::new(), true);
//! assert_eq!(register.run(), 0);
//! assert!(register.is_empty());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, error};

/// Positional arguments passed to a callback.
pub type CallbackArgs = Vec<String>;

/// Keyword arguments passed to a callback.
pub type CallbackKwargs = BTreeMap<String, String>;

/// A cleanup function. Identity (not behaviour) is what registration
/// compares, so keep the `Arc` around if you intend to unregister it.
pub type CallbackFn = Arc<dyn Fn(&[String], &CallbackKwargs) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    func: CallbackFn,
    args: CallbackArgs,
    kwargs: CallbackKwargs,
}

impl Entry {
    fn matches(&self, func: &CallbackFn, args: &[String], kwargs: &CallbackKwargs) -> bool {
        same_fn(&self.func, func) && self.args == args && &self.kwargs == kwargs
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:p}, {:?}, {:?})",
            Arc::as_ptr(&self.func) as *const (),
            self.args,
            self.kwargs
        )
    }
}

fn same_fn(a: &CallbackFn, b: &CallbackFn) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// LIFO registry of cleanup callbacks.
pub struct CallbackRegister {
    name: String,
    items: Vec<Entry>,
}

impl CallbackRegister {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `func(args, kwargs)`.
    ///
    /// With `once`, the call is skipped when an identical triple is already
    /// registered.
    pub fn register(
        &mut self,
        func: CallbackFn,
        args: CallbackArgs,
        kwargs: CallbackKwargs,
        once: bool,
    ) {
        if once && self.items.iter().any(|e| e.matches(&func, &args, &kwargs)) {
            return;
        }
        self.items.push(Entry { func, args, kwargs });
    }

    /// Removes the first registration of the given triple, if any.
    pub fn unregister(&mut self, func: &CallbackFn, args: &[String], kwargs: &CallbackKwargs) {
        if let Some(pos) = self.items.iter().position(|e| e.matches(func, args, kwargs)) {
            self.items.remove(pos);
        }
    }

    /// Whether any callback is registered with exactly `args`.
    pub fn has_args(&self, args: &[String]) -> bool {
        self.items.iter().any(|e| e.args == args)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs and drains every callback, newest first.
    ///
    /// Never fails: errors and panics are logged. Returns the number of
    /// callbacks that failed. Calling it again on an empty register is a
    /// no-op.
    pub fn run(&mut self) -> usize {
        let mut failures = 0;
        while let Some(entry) = self.items.pop() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.func)(&entry.args, &entry.kwargs)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("{} failed to destroy {:?}: {:#}", self.name, entry, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("{} failed to destroy {:?}: callback panicked", self.name, entry);
                }
            }
        }
        failures
    }
}

impl fmt::Debug for CallbackRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegister")
            .field("name", &self.name)
            .field("items", &self.items)
            .finish()
    }
}

impl Drop for CallbackRegister {
    fn drop(&mut self) {
        if !self.items.is_empty() {
            debug!(
                "{} dropped with {} pending callbacks, running them",
                self.name,
                self.items.len()
            );
            self.run();
        }
    }
}

static AT_EXIT: OnceLock<Mutex<CallbackRegister>> = OnceLock::new();

/// The process-wide at-exit register, created on first use.
pub fn at_exit() -> &'static Mutex<CallbackRegister> {
    AT_EXIT.get_or_init(|| Mutex::new(CallbackRegister::new("AtExit")))
}

/// Drains the process-wide register. Returns the number of failures.
pub fn run_at_exit() -> usize {
    match at_exit().lock() {
        Ok(mut register) => register.run(),
        Err(poisoned) => poisoned.into_inner().run(),
    }
}
