use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle, time::sleep};

use crate::{channel::CommChannel, core::CommCore};

/// Readiness probe for transports the reactors cannot watch.
pub trait Pollable: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl Pollable for CommChannel {
    /// A channel in use counts as not ready; its current holder will
    /// dispose it back to the loop when done.
    fn is_ready(&self) -> bool {
        match self.try_lock() {
            Some(io) => io.has_buffered_input() || io.stream.is_ready(),
            None => false,
        }
    }
}

/// Periodic readiness sweep for channels that can neither be selected
/// nor block: every interval each registered channel is probed, ready
/// ones leave the set and go to a handler. An empty set parks until
/// `register` wakes it.
pub struct PollingLoop {
    channels: Arc<Mutex<Vec<Arc<CommChannel>>>>,
    wakeup: Arc<Notify>,
    stop: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLoop {
    pub fn start(interval: Duration, core: Weak<CommCore>) -> Self {
        let channels: Arc<Mutex<Vec<Arc<CommChannel>>>> = Arc::default();
        let wakeup = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());

        let sweep_channels = channels.clone();
        let sweep_wakeup = wakeup.clone();
        let sweep_stop = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (ready, empty) = {
                    let mut channels = sweep_channels.lock();
                    let mut ready = Vec::new();
                    channels.retain(|channel| {
                        if !channel.is_open() {
                            false
                        } else if channel.is_ready() {
                            ready.push(channel.clone());
                            false
                        } else {
                            true
                        }
                    });
                    let empty = channels.is_empty() && ready.is_empty();
                    (ready, empty)
                };

                if !ready.is_empty() {
                    let Some(core) = core.upgrade() else { break };
                    for channel in ready {
                        channel.set_registered(false);
                        core.executor()
                            .schedule_receive(core.clone(), channel, None);
                    }
                }

                if empty {
                    tokio::select! {
                        _ = sweep_stop.notified() => break,
                        _ = sweep_wakeup.notified() => {}
                    }
                } else {
                    tokio::select! {
                        _ = sweep_stop.notified() => break,
                        _ = sleep(interval) => {}
                    }
                }
            }

            log::debug!("polling loop stopped");
        });

        Self {
            channels,
            wakeup,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn register(&self, channel: Arc<CommChannel>) {
        channel.set_registered(true);
        self.channels.lock().push(channel);
        self.wakeup.notify_one();
    }

    pub fn unregister(&self, channel: &CommChannel) {
        channel.set_registered(false);
        self.channels
            .lock()
            .retain(|candidate| candidate.id() != channel.id());
    }

    pub async fn shutdown(&self) {
        // permit semantics: a sweep that is not parked yet still stops
        self.stop.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
