//! Listener coordination
//!
//! Application listeners are registered on one thread and called back on
//! whichever transport thread finishes an operation. At registration the
//! engine takes a [`ContextSnapshot`] of the caller's ambient state (its
//! tracing span and [`CallContext`]) and every callback runs inside that
//! snapshot.
//!
//! Terminal notifications (`on_all_data_read`, `on_error`) are gated by
//! one-shot flags so racing close and failure paths deliver each at most
//! once.

use crate::error::StreamError;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callbacks for the read half of an upgraded connection.
pub trait ReadListener: Send + Sync + 'static {
    /// Data can be read without blocking; `is_ready()` returns true.
    fn on_data_available(&self);

    /// The peer finished sending, or the input side was closed.
    fn on_all_data_read(&self);

    fn on_error(&self, err: &StreamError);
}

/// Callbacks for the write half of an upgraded connection.
pub trait WriteListener: Send + Sync + 'static {
    /// Writing can resume; `is_ready()` returns true.
    fn on_write_possible(&self);

    fn on_error(&self, err: &StreamError);
}

thread_local! {
    static CURRENT: RefCell<Option<CallContext>> = const { RefCell::new(None) };
}

/// Ambient per-call state that listener callbacks should observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub principal: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The context installed on this thread, if any.
    pub fn current() -> Option<CallContext> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Install this context on the current thread until the guard drops.
    pub fn enter(self) -> ContextGuard {
        ContextGuard::install(Some(self))
    }

    /// Run `f` with `ctx` installed on the current thread.
    pub fn scope<R>(ctx: CallContext, f: impl FnOnce() -> R) -> R {
        let _guard = ctx.enter();
        f()
    }
}

/// Restores the previous thread context on drop.
#[must_use = "the context is uninstalled when the guard drops"]
pub struct ContextGuard {
    previous: Option<CallContext>,
}

impl ContextGuard {
    fn install(ctx: Option<CallContext>) -> Self {
        let previous = CURRENT.with(|slot| slot.replace(ctx));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// Ambient state captured on the registering thread.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    span: tracing::Span,
    call: Option<CallContext>,
}

impl ContextSnapshot {
    pub fn capture() -> Self {
        Self {
            span: tracing::Span::current(),
            call: CallContext::current(),
        }
    }

    /// Run `f` with the captured context in place of the thread's own.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entered = self.span.enter();
        let _ctx = ContextGuard::install(self.call.clone());
        f()
    }
}

/// Fires at most once.
#[derive(Debug, Default)]
pub(crate) struct OneShot(AtomicBool);

impl OneShot {
    /// True for the first caller only.
    pub(crate) fn fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) struct ReadCoordinator {
    listener: Arc<dyn ReadListener>,
    context: ContextSnapshot,
    all_read: OneShot,
    failed: OneShot,
}

impl ReadCoordinator {
    pub(crate) fn new(listener: Arc<dyn ReadListener>) -> Self {
        Self {
            listener,
            context: ContextSnapshot::capture(),
            all_read: OneShot::default(),
            failed: OneShot::default(),
        }
    }

    pub(crate) fn data_available(&self) {
        self.context.run(|| self.listener.on_data_available());
    }

    pub(crate) fn all_data_read(&self) {
        if self.all_read.fire() {
            self.context.run(|| self.listener.on_all_data_read());
        }
    }

    pub(crate) fn error(&self, err: &StreamError) {
        if self.failed.fire() {
            self.context.run(|| self.listener.on_error(err));
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.fired()
    }
}

pub(crate) struct WriteCoordinator {
    listener: Arc<dyn WriteListener>,
    context: ContextSnapshot,
    failed: OneShot,
}

impl WriteCoordinator {
    pub(crate) fn new(listener: Arc<dyn WriteListener>) -> Self {
        Self {
            listener,
            context: ContextSnapshot::capture(),
            failed: OneShot::default(),
        }
    }

    pub(crate) fn write_possible(&self) {
        self.context.run(|| self.listener.on_write_possible());
    }

    pub(crate) fn error(&self, err: &StreamError) {
        if self.failed.fire() {
            self.context.run(|| self.listener.on_error(err));
        }
    }
}
