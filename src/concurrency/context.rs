// src/concurrency/context.rs

//! Ambient execution context carried across the submit/execute thread hop
//!
//! A context is captured when an item is submitted and installed on the
//! worker thread only for the duration of the callback. Once wrapped in an
//! `Arc` and attached to a work item it is never mutated.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::CorrelationId;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ExecutionContext>>> = const { RefCell::new(None) };
}

/// Snapshot of "who and where" a piece of work runs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    principal: Option<String>,
    tenant: Option<String>,
    locale: Option<String>,
    correlation_id: CorrelationId,
    properties: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Creates an empty context with a fresh correlation id
    pub fn new() -> Self {
        Self {
            principal: None,
            tenant: None,
            locale: None,
            correlation_id: Uuid::new_v4(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Span that tags every event emitted by the callback
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "work_item",
            correlation_id = %self.correlation_id,
            principal = self.principal.as_deref().unwrap_or("anonymous"),
            tenant = self.tenant.as_deref().unwrap_or(""),
        )
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the context installed on the calling thread, if any
pub fn current() -> Option<Arc<ExecutionContext>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Installs `context` on the calling thread until the guard is dropped.
///
/// Guards nest: dropping one restores whatever was current before it,
/// including "no context".
pub fn enter(context: Arc<ExecutionContext>) -> ContextGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(context));
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous thread context on drop, including during unwinding
#[must_use = "the context is cleared as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Arc<ExecutionContext>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("restores", &self.previous.as_ref().map(|c| c.correlation_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_restore() {
        assert!(current().is_none());

        let outer = Arc::new(ExecutionContext::new().with_principal("alice"));
        let inner = Arc::new(ExecutionContext::new().with_principal("bob").with_locale("de-DE"));

        {
            let _outer = enter(Arc::clone(&outer));
            assert_eq!(current().unwrap().principal(), Some("alice"));

            {
                let _inner = enter(Arc::clone(&inner));
                let seen = current().unwrap();
                assert_eq!(seen.principal(), Some("bob"));
                assert_eq!(seen.locale(), Some("de-DE"));
            }

            assert_eq!(current().unwrap().principal(), Some("alice"));
        }

        assert!(current().is_none());
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let context = Arc::new(ExecutionContext::new().with_tenant("acme"));

        let result = std::panic::catch_unwind(|| {
            let _guard = enter(context);
            panic!("boom");
        });

        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[test]
    fn test_context_is_thread_local() {
        let _guard = enter(Arc::new(ExecutionContext::new().with_principal("main")));

        let seen_elsewhere = std::thread::spawn(|| current().is_none()).join().unwrap();
        assert!(seen_elsewhere);
    }

    #[test]
    fn test_properties() {
        let id = Uuid::new_v4();
        let context = ExecutionContext::new()
            .with_correlation_id(id)
            .with_property("request", "r-17");

        assert_eq!(context.correlation_id(), id);
        assert_eq!(context.property("request"), Some("r-17"));
        assert_eq!(context.property("missing"), None);
    }
}
