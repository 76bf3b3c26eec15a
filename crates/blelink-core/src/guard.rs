//! Observer registration guard.
//!
//! Transports hand out an [`Unregister`] guard for every disconnect observer.
//! Dropping the guard removes the observer, so an observer can never outlive
//! the session slot that owns it.

use std::fmt;

/// A guard that removes a registered observer when dropped.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use blelink_core::Unregister;
///
/// let removed = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&removed);
/// let guard = Unregister::new(move || flag.store(true, Ordering::SeqCst));
///
/// drop(guard);
/// assert!(removed.load(Ordering::SeqCst));
/// ```
pub struct Unregister {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Unregister {
    /// Create a guard that runs `action` once on drop.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A guard with nothing to remove.
    pub fn noop() -> Self {
        Self { action: None }
    }

    /// Remove the observer now.
    pub fn unregister(mut self) {
        self.run();
    }

    /// Keep the observer registered for the rest of the process.
    ///
    /// After calling this, the observer is never removed.
    pub fn forget(mut self) {
        self.action = None;
    }

    fn run(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Unregister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unregister")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

impl Drop for Unregister {
    fn drop(&mut self) {
        self.run();
    }
}
