//! Session lifecycle listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::session::Session;

/// Error a listener may report. It is logged, never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A lifecycle event.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    /// The session was created; fires before it is handed to the caller.
    Created(&'a Session),
    /// The session is being destroyed; fires while its attributes are
    /// still readable and before it leaves the cache.
    Destroyed(&'a Session),
}

impl SessionEvent<'_> {
    pub fn session(&self) -> &Session {
        match self {
            SessionEvent::Created(session) | SessionEvent::Destroyed(session) => session,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created(_) => "created",
            SessionEvent::Destroyed(_) => "destroyed",
        }
    }
}

/// Observer of session lifecycle events.
///
/// Implemented for any `Fn(SessionEvent<'_>) -> Result<(), ListenerError>`.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent<'_>) -> Result<(), ListenerError>;
}

impl<F> SessionListener for F
where
    F: Fn(SessionEvent<'_>) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: SessionEvent<'_>) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Registered listeners, invoked synchronously in registration order.
#[derive(Default)]
pub struct Listeners {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener. Errors and panics are logged.
    pub fn fire(&self, event: SessionEvent<'_>) {
        // Copy out so a listener can register another without deadlocking.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    session_id = %event.session().id(),
                    event = event.name(),
                    error = %e,
                    "Session listener failed"
                ),
                Err(_) => warn!(
                    session_id = %event.session().id(),
                    event = event.name(),
                    "Session listener panicked"
                ),
            }
        }
    }
}
