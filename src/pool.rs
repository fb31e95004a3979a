use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::channel::CommChannel;

/// Cache of reusable outbound channels, one per (location, protocol).
///
/// This is a hint cache: correctness never depends on its contents, it
/// only saves handshakes for chatty clients. Caching is single-use:
/// a successful `get` removes the entry, `put` re-inserts it.
#[derive(Default)]
pub struct PersistentChannels {
    map: Mutex<AHashMap<String, AHashMap<String, Arc<CommChannel>>>>,
}

impl PersistentChannels {
    /// Pop the cached channel for (location, protocol), if it is still
    /// usable. A channel whose mutex cannot be taken without blocking
    /// is in use by a late holder: the entry is dropped (never closed,
    /// the holder still owns it) and the caller builds fresh.
    pub fn get(&self, location: &str, protocol: &str) -> Option<Arc<CommChannel>> {
        let channel = {
            let mut map = self.map.lock();
            let inner = map.get_mut(location)?;
            let channel = inner.remove(protocol)?;
            if inner.is_empty() {
                map.remove(location);
            }
            channel
        };

        let Some(guard) = channel.try_lock() else {
            return None;
        };

        if !channel.is_open() {
            drop(guard);
            return None;
        }

        // no longer evictable by time while checked out
        channel.clear_idle_timeout();
        drop(guard);
        Some(channel)
    }

    /// Cache a channel and arm its idle eviction. Replacing an entry
    /// never closes the previous channel; whoever checked it out keeps
    /// owning it.
    pub fn put(
        self: &Arc<Self>,
        location: &str,
        protocol: &str,
        channel: Arc<CommChannel>,
        idle: Duration,
    ) {
        let generation = channel.arm_idle_timeout();

        let pool = self.clone();
        let evicted = channel.clone();
        let location_key = location.to_string();
        let protocol_key = protocol.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            pool.evict_idle(&location_key, &protocol_key, &evicted, generation)
                .await;
        })
        .abort_handle();

        channel.set_idle_timeout(handle);

        self.map
            .lock()
            .entry(location.to_string())
            .or_default()
            .insert(protocol.to_string(), channel);
    }

    /// Timeout body: evict and close, but only when this handler is
    /// still the channel's active one and the entry was not replaced.
    async fn evict_idle(
        &self,
        location: &str,
        protocol: &str,
        channel: &Arc<CommChannel>,
        generation: u64,
    ) {
        if !channel.timeout_generation_is_current(generation) {
            return;
        }

        let cached = {
            let mut map = self.map.lock();
            match map.get_mut(location) {
                Some(inner) if inner.get(protocol).is_some_and(|c| Arc::ptr_eq(c, channel)) => {
                    let removed = inner.remove(protocol);
                    if inner.is_empty() {
                        map.remove(location);
                    }
                    removed
                }
                _ => None,
            }
        };

        if let Some(channel) = cached {
            log::debug!(
                "idle channel evicted: location={}, protocol={}, id={}",
                location,
                protocol,
                channel.id(),
            );
            channel.close().await;
        }
    }

    /// Drop and close every cached channel (shutdown path).
    pub async fn close_all(&self) {
        let channels: Vec<Arc<CommChannel>> = {
            let mut map = self.map.lock();
            map.drain().flat_map(|(_, inner)| inner.into_values()).collect()
        };

        for channel in channels {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_channel_pair;

    const IDLE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn put_then_get_returns_same_channel() {
        let pool = Arc::new(PersistentChannels::default());
        let (channel, _peer) = memory_channel_pair();

        pool.put("memory://a:1", "wire", channel.clone(), IDLE);
        let cached = pool.get("memory://a:1", "wire").unwrap();
        assert!(Arc::ptr_eq(&cached, &channel));

        // single-use caching: the entry is gone until re-inserted
        assert!(pool.get("memory://a:1", "wire").is_none());
    }

    #[tokio::test]
    async fn busy_channel_is_evicted_not_returned() {
        let pool = Arc::new(PersistentChannels::default());
        let (channel, _peer) = memory_channel_pair();

        pool.put("memory://a:1", "wire", channel.clone(), IDLE);

        let guard = channel.lock().await;
        assert!(pool.get("memory://a:1", "wire").is_none());
        drop(guard);

        // eviction removed the entry without closing the channel
        assert!(pool.get("memory://a:1", "wire").is_none());
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn closed_channel_is_evicted() {
        let pool = Arc::new(PersistentChannels::default());
        let (channel, _peer) = memory_channel_pair();

        pool.put("memory://a:1", "wire", channel.clone(), IDLE);
        channel.close().await;

        assert!(pool.get("memory://a:1", "wire").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_evicts_and_closes() {
        let pool = Arc::new(PersistentChannels::default());
        let (channel, _peer) = memory_channel_pair();

        pool.put("memory://a:1", "wire", channel.clone(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tokio::task::yield_now().await;

        assert!(pool.get("memory://a:1", "wire").is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn get_disarms_the_idle_timeout() {
        let pool = Arc::new(PersistentChannels::default());
        let (channel, _peer) = memory_channel_pair();

        pool.put("memory://a:1", "wire", channel.clone(), Duration::from_millis(50));
        let cached = pool.get("memory://a:1", "wire").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        assert!(cached.is_open());
    }

    #[tokio::test]
    async fn replacement_keeps_previous_channel_open() {
        let pool = Arc::new(PersistentChannels::default());
        let (first, _peer_a) = memory_channel_pair();
        let (second, _peer_b) = memory_channel_pair();

        pool.put("memory://a:1", "wire", first.clone(), IDLE);
        pool.put("memory://a:1", "wire", second.clone(), IDLE);

        let cached = pool.get("memory://a:1", "wire").unwrap();
        assert!(Arc::ptr_eq(&cached, &second));
        assert!(first.is_open());
    }
}
