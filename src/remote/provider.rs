//! In-process global counter provider.
//!
//! Keeps registrations and admission counts for the targets of a single
//! gateway instance. It is the provider used by the `flowgate` binary and a
//! stand-in wherever no coordination service is deployed; limits reach the
//! registered limiters only through [`LocalGlobalCounterProvider::push_limit`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::info;

use crate::flowcontrol::FlowControlSchemaType;

use super::counter::{AcquireResult, GlobalCounter, GlobalCounterFlowControl, GlobalCounterProvider};

/// Admission counter of one registration.
#[derive(Debug, Default)]
pub struct AtomicGlobalCounter {
    total: AtomicI64,
}

impl AtomicGlobalCounter {
    /// Admissions reported so far.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }
}

impl GlobalCounter for AtomicGlobalCounter {
    fn count(&self, hits: i32) {
        self.total.fetch_add(hits as i64, Ordering::AcqRel);
    }
}

struct Registration {
    schema_type: FlowControlSchemaType,
    owner: Weak<dyn GlobalCounterFlowControl>,
    counter: Arc<AtomicGlobalCounter>,
}

/// A [`GlobalCounterProvider`] that keeps everything in this process.
#[derive(Default)]
pub struct LocalGlobalCounterProvider {
    registrations: DashMap<String, Registration>,
}

impl LocalGlobalCounterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    /// Admissions counted for `name`, if registered.
    pub fn count(&self, name: &str) -> Option<i64> {
        self.registrations.get(name).map(|r| r.counter.total())
    }

    /// Limiter type registered under `name`.
    pub fn schema_type(&self, name: &str) -> Option<FlowControlSchemaType> {
        self.registrations.get(name).map(|r| r.schema_type)
    }

    /// All registered names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Push `limit` to the limiter registered under `name`.
    ///
    /// Returns `false` when nothing is registered, the limiter is gone, or it
    /// refused the limit.
    pub fn push_limit(&self, name: &str, limit: i32) -> bool {
        let owner = match self.registrations.get(name).and_then(|r| r.owner.upgrade()) {
            Some(owner) => owner,
            None => return false,
        };

        let result = AcquireResult {
            name: name.to_string(),
            limit,
            error: None,
        };
        owner.set_limit(&result)
    }
}

impl GlobalCounterProvider for LocalGlobalCounterProvider {
    fn add(
        &self,
        name: &str,
        schema_type: FlowControlSchemaType,
        owner: Weak<dyn GlobalCounterFlowControl>,
    ) -> Arc<dyn GlobalCounter> {
        let counter = Arc::new(AtomicGlobalCounter::default());
        self.registrations.insert(
            name.to_string(),
            Registration {
                schema_type,
                owner,
                counter: Arc::clone(&counter),
            },
        );
        info!(name = %name, schema_type = %schema_type, "Registered global counter");
        counter
    }

    fn stop(&self, name: &str) {
        if self.registrations.remove(name).is_some() {
            info!(name = %name, "Removed global counter");
        }
    }
}
