//! Deferred release actions
//!
//! Resources whose lifetime must outlast the native engine (resolver
//! contexts, in particular) are registered here and only released after the
//! engine is gone.

use std::fmt;
use std::sync::Mutex;

use tracing::{debug, warn};

/// A deferred release action, run exactly once.
pub struct CleanupAction {
    label: String,
    action: Box<dyn FnOnce() + Send>,
}

impl CleanupAction {
    pub fn new(label: impl Into<String>, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            action: Box::new(action),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn run(self) {
        debug!(action = %self.label, "Running cleanup action");
        (self.action)();
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Ordered list of cleanup actions owned by a compile layer.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    actions: Mutex<Vec<CleanupAction>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, action: CleanupAction) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending action, most recently registered first. Returns the
    /// number of actions run.
    pub fn run_all(&self) -> usize {
        let actions = std::mem::take(&mut *self.actions.lock().unwrap_or_else(|e| e.into_inner()));
        let count = actions.len();
        for action in actions.into_iter().rev() {
            action.run();
        }
        count
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        let pending = self.len();
        if pending > 0 {
            warn!(pending, "Cleanup registry dropped with pending actions; running them now");
            self.run_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> CleanupAction {
        let log = Arc::clone(log);
        CleanupAction::new(label, move || log.lock().unwrap().push(label))
    }

    #[test]
    fn test_run_all_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CleanupRegistry::new();
        registry.push(recorder(&log, "first"));
        registry.push(recorder(&log, "second"));
        registry.push(recorder(&log, "third"));
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.run_all(), 3);
        assert_eq!(*log.lock().unwrap(), ["third", "second", "first"]);
        assert!(registry.is_empty());

        // Each action runs once.
        assert_eq!(registry.run_all(), 0);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_drop_runs_pending_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let registry = CleanupRegistry::new();
            registry.push(recorder(&log, "a"));
            registry.push(recorder(&log, "b"));
        }
        assert_eq!(*log.lock().unwrap(), ["b", "a"]);
    }

    #[test]
    fn test_action_label() {
        let action = CleanupAction::new("resolver #1", || {});
        assert_eq!(action.label(), "resolver #1");
        assert!(format!("{action:?}").contains("resolver #1"));
    }
}
