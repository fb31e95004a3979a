use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ConnectionsOpened(u64),
    ConnectionsAccepted(u64),
    ConnectionsReused(u64),
    MessagesReceived(u64),
    MessagesSent(u64),
    FaultsSent(u64),
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Core-wide counters.
pub struct Counts<T> {
    pub connections_opened: T,
    pub connections_accepted: T,
    pub connections_reused: T,
    pub messages_received: T,
    pub messages_sent: T,
    pub faults_sent: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ConnectionsOpened(v) => self.connections_opened.add(*v),
            Stats::ConnectionsAccepted(v) => self.connections_accepted.add(*v),
            Stats::ConnectionsReused(v) => self.connections_reused.add(*v),
            Stats::MessagesReceived(v) => self.messages_received.add(*v),
            Stats::MessagesSent(v) => self.messages_sent.add(*v),
            Stats::FaultsSent(v) => self.faults_sent.add(*v),
        }
    }
}

/// Shared statistics handle; cheap to clone into listeners and handlers.
///
/// # Example
///
/// ```
/// use commux::statistics::{Statistics, Stats};
///
/// let statistics = Statistics::default();
/// statistics.report(&[Stats::ConnectionsOpened(1), Stats::MessagesSent(2)]);
///
/// let snapshot = statistics.snapshot();
/// assert_eq!(snapshot.connections_opened, 1);
/// assert_eq!(snapshot.messages_sent, 2);
/// ```
#[derive(Clone)]
pub struct Statistics(Arc<Counts<Count>>);

impl Default for Statistics {
    fn default() -> Self {
        Self(Arc::new(Counts {
            connections_opened: Count::default(),
            connections_accepted: Count::default(),
            connections_reused: Count::default(),
            messages_received: Count::default(),
            messages_sent: Count::default(),
            faults_sent: Count::default(),
        }))
    }
}

impl Statistics {
    pub fn report(&self, reports: &[Stats]) {
        for item in reports {
            self.0.add(item);
        }
    }

    pub fn snapshot(&self) -> Counts<u64> {
        Counts {
            connections_opened: self.0.connections_opened.get(),
            connections_accepted: self.0.connections_accepted.get(),
            connections_reused: self.0.connections_reused.get(),
            messages_received: self.0.messages_received.get(),
            messages_sent: self.0.messages_sent.get(),
            faults_sent: self.0.faults_sent.get(),
        }
    }
}
