use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};

use crate::{
    channel::{ChannelGuard, CommChannel},
    core::CommCore,
    error::CommError,
};

enum Command {
    Register(Arc<CommChannel>),
    Shutdown,
}

struct Reactor {
    commands: UnboundedSender<Command>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// One reactor per hardware thread; channels are spread over them by a
/// round-robin counter and stay sticky to their reactor afterwards.
///
/// A registered channel is represented by a watch future that owns the
/// channel's io guard while waiting for transport readiness, which is
/// the literal form of the invariant that no handler holds the mutex
/// while the channel is registered. On readiness the reactor hands channel
/// and guard to the executor and forgets the watch; re-registration
/// happens at dispose time.
pub struct SelectorArray {
    reactors: Vec<Reactor>,
    counter: AtomicUsize,
}

impl SelectorArray {
    pub fn start(size: usize, core: Weak<CommCore>) -> Self {
        let size = size.max(1);
        let reactors = (0..size)
            .map(|index| {
                let (commands, receiver) = unbounded_channel();
                let handle = tokio::spawn(reactor_loop(index, receiver, core.clone()));
                Reactor {
                    commands,
                    handle: parking_lot::Mutex::new(Some(handle)),
                }
            })
            .collect();

        Self {
            reactors,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Attach a channel to its reactor for read readiness.
    pub fn register(&self, channel: Arc<CommChannel>) -> Result<(), CommError> {
        let index = match channel.selector_index() {
            Some(index) => index,
            None => {
                let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.reactors.len();
                channel.set_selector_index(index);
                index
            }
        };

        channel.set_registered(true);
        self.reactors[index]
            .commands
            .send(Command::Register(channel))
            .map_err(|_| CommError::ChannelClosing)
    }

    /// Detach a channel; its watch wakes and drops the guard.
    pub fn unregister(&self, channel: &CommChannel) {
        channel.set_registered(false);
        channel.notify_unregister();
    }

    pub async fn shutdown(&self) {
        for reactor in &self.reactors {
            let _ = reactor.commands.send(Command::Shutdown);
        }

        for reactor in &self.reactors {
            let handle = reactor.handle.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }
}

async fn reactor_loop(index: usize, mut commands: UnboundedReceiver<Command>, core: Weak<CommCore>) {
    let mut watches = FuturesUnordered::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Register(channel)) => watches.push(watch(channel)),
                Some(Command::Shutdown) | None => break,
            },
            Some(ready) = watches.next(), if !watches.is_empty() => {
                let Some((channel, guard)) = ready else { continue };
                channel.set_registered(false);

                let Some(core) = core.upgrade() else { break };
                if channel.is_open() {
                    core.executor().schedule_receive(core.clone(), channel, Some(guard));
                }
            }
        }
    }

    log::debug!("reactor stopped: index={}", index);
}

/// Wait until the channel is readable or kicked out of the reactor.
async fn watch(channel: Arc<CommChannel>) -> Option<(Arc<CommChannel>, ChannelGuard)> {
    let guard = channel.lock().await;

    if !channel.is_open() || !channel.is_registered() {
        channel.set_registered(false);
        return None;
    }

    let ready = tokio::select! {
        biased;
        _ = channel.unregistered() => false,
        // a readiness error is still a wake-up: the handler's read will
        // surface it and close the channel
        _ = guard.stream.readable() => true,
    };

    if ready {
        Some((channel, guard))
    } else {
        channel.set_registered(false);
        None
    }
}
