use std::{cell::RefCell, fmt, future::Future, sync::Arc};

use ahash::AHashMap;
use codec::MessageId;
use parking_lot::Mutex;

use crate::channel::ChannelId;

/// Key of a session registry entry.
///
/// Channel identities and message ids live in disjoint key spaces, so
/// one registry can serve both without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Channel(ChannelId),
    Message(MessageId),
}

struct ContextInner {
    session: u64,
    label: String,
}

/// Handle to the per-session state of the owning runtime.
///
/// The core never looks inside; it only stores, restores and clears the
/// handle so that correlation continues in the session that issued the
/// request, no matter which reactor decoded the response.
#[derive(Clone)]
pub struct ExecutionContext(Arc<ContextInner>);

impl ExecutionContext {
    pub fn new(session: u64, label: impl Into<String>) -> Self {
        Self(Arc::new(ContextInner {
            session,
            label: label.into(),
        }))
    }

    pub fn session(&self) -> u64 {
        self.0.session
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutionContext({}, {:?})", self.0.session, self.0.label)
    }
}

tokio::task_local! {
    static CURRENT: RefCell<Option<ExecutionContext>>;
}

/// Run `future` with an (initially empty) execution-context slot.
///
/// Every handler task runs inside one of these scopes; `ContextGuard`
/// fills and clears the slot.
pub(crate) async fn scope<F: Future>(future: F) -> F::Output {
    CURRENT.scope(RefCell::new(None), future).await
}

/// The execution context installed on the current handler task, if any.
pub fn current() -> Option<ExecutionContext> {
    CURRENT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Scoped installation of an execution context into the task slot.
///
/// Dropping the guard clears the slot, so a handler can never leak its
/// context into the next message handled on the same task.
pub struct ContextGuard(());

impl ContextGuard {
    pub fn install(context: ExecutionContext) -> Self {
        let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = Some(context));
        Self(())
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = None);
    }
}

/// Registry restoring execution contexts by channel identity or message
/// id. The core keeps two: one for the request side, one for the
/// response side.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<AHashMap<SessionKey, ExecutionContext>>,
}

impl SessionRegistry {
    pub fn add(&self, key: SessionKey, context: ExecutionContext) {
        self.entries.lock().insert(key, context);
    }

    pub fn get(&self, key: SessionKey) -> Option<ExecutionContext> {
        self.entries.lock().get(&key).cloned()
    }

    pub fn remove(&self, key: SessionKey) -> Option<ExecutionContext> {
        self.entries.lock().remove(&key)
    }
}
