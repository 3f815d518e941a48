//! Injects the three in-scope `CI_BUILD_*` variables into each step's
//! environment (SPEC_FULL.md §4.4f). The broader repo/commit/author
//! metadata mapping is out of scope.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Tracer {
    started: i64,
    failed: AtomicBool,
}

impl Tracer {
    pub fn new(started: i64) -> Self {
        Self {
            started,
            failed: AtomicBool::new(false),
        }
    }

    pub fn observe(&self, step_succeeded: bool) {
        if !step_succeeded {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn env(&self, now: i64) -> BTreeMap<String, String> {
        let status = if self.has_failed() { "failure" } else { "success" };
        BTreeMap::from([
            ("CI_BUILD_STATUS".to_string(), status.to_string()),
            ("CI_BUILD_STARTED".to_string(), self.started.to_string()),
            ("CI_BUILD_FINISHED".to_string(), now.to_string()),
        ])
    }
}
