use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{RwLock, Semaphore},
    task::JoinSet,
    time::timeout,
};

use crate::{
    channel::{ChannelGuard, CommChannel},
    core::CommCore,
    dispatcher, session,
};

/// Runs message handlers, one task per decoded-message attempt.
///
/// Unbounded by default; `connections_limit` caps concurrency with a
/// semaphore. Every handler runs inside an execution-context scope and
/// under the read side of the channel-handlers latch; shutdown takes
/// the write side to drain in-flight handlers.
pub struct HandlerExecutor {
    tasks: parking_lot::Mutex<JoinSet<()>>,
    permits: Option<Arc<Semaphore>>,
    latch: Arc<RwLock<()>>,
}

impl HandlerExecutor {
    pub fn new(connections_limit: Option<usize>) -> Self {
        Self {
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            permits: connections_limit.map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            latch: Arc::new(RwLock::new(())),
        }
    }

    /// The channel-handlers latch. Handlers hold it shared for their
    /// whole run; the shutdown routine takes it exclusively.
    pub fn latch(&self) -> &Arc<RwLock<()>> {
        &self.latch
    }

    /// Run one handler bound to (channel, optionally pre-acquired
    /// guard). The reactor passes the guard it already owns; polling
    /// and bypass paths let the handler acquire it.
    pub fn schedule_receive(
        &self,
        core: Arc<CommCore>,
        channel: Arc<CommChannel>,
        guard: Option<ChannelGuard>,
    ) {
        let permits = self.permits.clone();

        let mut tasks = self.tasks.lock();
        // reap finished handlers so the set does not hoard results
        while tasks.try_join_next().is_some() {}

        tasks.spawn(session::scope(async move {
            let _permit = match permits {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            dispatcher::receive_task(core, channel, guard).await;
        }));
    }

    /// Wait up to `grace` for in-flight handlers, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            log::warn!(
                "handler executor aborted {} straggler(s) at shutdown",
                tasks.len(),
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
