use crate::address::format_address;
use crate::provider::{
    IntrospectionProvider, ProviderError, WatchEntry, WatchId, WatchMode, WatchOptions,
};
use crate::{cb_debug, weak_error};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("address 0x{0:X} is already being watched")]
    AlreadyWatching(u64),
    #[error("physical address resolution failed for 0x{0:X}")]
    PhysicalResolutionFailed(u64),
    #[error("no active watch")]
    NotWatching(u64),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

struct WatchRecord {
    watch_id: WatchId,
    physical_address: u64,
    mode: WatchMode,
    max_entries: usize,
    started: Instant,
    started_at: DateTime<Utc>,
    /// Number of log entries already handed out with `clear`.
    cursor: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchStarted {
    pub watch_id: WatchId,
    pub physical_address: u64,
    pub mode: WatchMode,
}

#[derive(Debug, Clone)]
pub struct WatchPoll {
    pub hits: Vec<WatchEntry>,
    /// Entries in the host log since the watch start.
    pub total: usize,
    pub uptime: Duration,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WatchStopped {
    pub hits: Vec<WatchEntry>,
    pub duration: Duration,
}

/// Asynchronous memory-access watches keyed by virtual address.
///
/// A watch is either absent (idle) or registered (watching). Polling never changes that,
/// the host log is cumulative and polls only move a per-watch cursor.
#[derive(Default)]
pub struct WatchManager {
    watches: IndexMap<u64, WatchRecord>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn is_watching(&self, address: u64) -> bool {
        self.watches.contains_key(&address)
    }

    pub fn start(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        address: u64,
        mode: WatchMode,
        max_entries: usize,
    ) -> Result<WatchStarted, WatchError> {
        if self.watches.contains_key(&address) {
            return Err(WatchError::AlreadyWatching(address));
        }

        let physical_address = provider
            .resolve_physical_address(address)
            .map_err(|_| WatchError::PhysicalResolutionFailed(address))?;
        let watch_id = provider.start_watch(physical_address, mode, WatchOptions { max_entries })?;

        self.watches.insert(
            address,
            WatchRecord {
                watch_id,
                physical_address,
                mode,
                max_entries,
                started: Instant::now(),
                started_at: Utc::now(),
                cursor: 0,
            },
        );
        cb_debug!(
            target: "watch",
            "watch {watch_id} started at {} (physical {})",
            format_address(address),
            format_address(physical_address)
        );

        Ok(WatchStarted {
            watch_id,
            physical_address,
            mode,
        })
    }

    /// Read the log of an active watch without touching the watch itself.
    ///
    /// With `clear` the returned entries are marked as seen and the next poll starts after them.
    pub fn poll(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        address: u64,
        max_results: usize,
        clear: bool,
    ) -> Result<WatchPoll, WatchError> {
        let record = self
            .watches
            .get_mut(&address)
            .ok_or(WatchError::NotWatching(address))?;

        let log = provider.retrieve_watch_log(record.watch_id)?;
        let total = log.len();
        let hits: Vec<WatchEntry> = log
            .into_iter()
            .skip(record.cursor)
            .take(max_results)
            .collect();
        if clear {
            record.cursor = (record.cursor + hits.len()).min(total);
        }

        Ok(WatchPoll {
            hits,
            total,
            uptime: record.started.elapsed(),
            started_at: record.started_at,
        })
    }

    /// Final log of a watch, the watch is disabled and the address becomes free.
    ///
    /// If the host refuses to disable the watch it stays registered and the error is returned.
    pub fn stop(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        address: u64,
    ) -> Result<WatchStopped, WatchError> {
        let record = self
            .watches
            .get(&address)
            .ok_or(WatchError::NotWatching(address))?;

        let hits = weak_error!(
            provider.retrieve_watch_log(record.watch_id),
            "retrieve final watch log:"
        )
        .unwrap_or_default();
        provider.disable_watch(record.watch_id)?;

        let duration = record.started.elapsed();
        self.watches.shift_remove(&address);
        Ok(WatchStopped { hits, duration })
    }

    /// Disable every watch, never fails. Returns the number of released watches.
    pub fn release_all(&mut self, provider: &mut dyn IntrospectionProvider) -> usize {
        let released = self.watches.len();
        for (address, record) in self.watches.drain(..) {
            cb_debug!(
                target: "watch",
                "release watch {} ({} mode, {} entries max) at {}",
                record.watch_id,
                record.mode,
                record.max_entries,
                format_address(address)
            );
            weak_error!(provider.disable_watch(record.watch_id), "disable watch:");
        }
        released
    }

    /// Watched addresses with their physical counterpart.
    pub fn watched(&self) -> Vec<(u64, u64)> {
        self.watches
            .iter()
            .map(|(address, record)| (*address, record.physical_address))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::sim::SimulatedProvider;

    const DATA: u64 = 0x500000;
    const CODE: u64 = 0x401000;

    #[test]
    fn test_duplicate_watch_is_rejected() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        manager.start(&mut provider, DATA, WatchMode::Write, 100).unwrap();
        assert!(matches!(
            manager.start(&mut provider, DATA, WatchMode::Read, 100),
            Err(WatchError::AlreadyWatching(DATA))
        ));
        assert_eq!(provider.live_watches(), 1);
    }

    #[test]
    fn test_unresolvable_address() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        assert!(matches!(
            manager.start(&mut provider, 0xdead_0000, WatchMode::Write, 100),
            Err(WatchError::PhysicalResolutionFailed(0xdead_0000))
        ));
        assert!(manager.is_empty());
        assert_eq!(provider.live_watches(), 0);
    }

    #[test]
    fn test_poll_is_non_destructive() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        manager.start(&mut provider, DATA, WatchMode::Write, 100).unwrap();
        provider.touch(DATA, CODE);
        provider.touch(DATA + 2, CODE + 3);

        let poll = manager.poll(&mut provider, DATA, 100, false).unwrap();
        assert_eq!((poll.hits.len(), poll.total), (2, 2));
        let poll = manager.poll(&mut provider, DATA, 1, true).unwrap();
        assert_eq!((poll.hits.len(), poll.total), (1, 2));
        assert_eq!(poll.hits[0].instruction_pointer, CODE);

        let poll = manager.poll(&mut provider, DATA, 100, true).unwrap();
        assert_eq!((poll.hits.len(), poll.total), (1, 2));
        assert_eq!(poll.hits[0].instruction_pointer, CODE + 3);

        let poll = manager.poll(&mut provider, DATA, 100, true).unwrap();
        assert_eq!((poll.hits.len(), poll.total), (0, 2));

        assert!(manager.is_watching(DATA));
        assert_eq!(provider.live_watches(), 1);
    }

    #[test]
    fn test_stop_then_start() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        manager.start(&mut provider, DATA, WatchMode::Write, 100).unwrap();
        provider.touch(DATA, CODE);
        let stopped = manager.stop(&mut provider, DATA).unwrap();
        assert_eq!(stopped.hits.len(), 1);

        let err = manager.poll(&mut provider, DATA, 100, true).unwrap_err();
        assert_eq!(err.to_string(), "no active watch");
        assert!(matches!(
            manager.stop(&mut provider, DATA),
            Err(WatchError::NotWatching(DATA))
        ));

        manager.start(&mut provider, DATA, WatchMode::ReadWrite, 10).unwrap();
        assert_eq!(provider.live_watches(), 1);
    }

    #[test]
    fn test_failed_disable_keeps_watch() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        manager.start(&mut provider, DATA, WatchMode::Write, 100).unwrap();
        provider.refuse_watch_disable(true);
        assert!(matches!(
            manager.stop(&mut provider, DATA),
            Err(WatchError::Provider(_))
        ));
        assert!(manager.is_watching(DATA));

        provider.refuse_watch_disable(false);
        manager.stop(&mut provider, DATA).unwrap();
        assert_eq!(provider.live_watches(), 0);
    }

    #[test]
    fn test_release_all() {
        let mut provider = SimulatedProvider::default_target();
        let mut manager = WatchManager::new();

        manager.start(&mut provider, DATA, WatchMode::Write, 100).unwrap();
        manager.start(&mut provider, DATA + 8, WatchMode::Read, 100).unwrap();
        assert_eq!(manager.release_all(&mut provider), 2);
        assert_eq!(manager.release_all(&mut provider), 0);
        assert_eq!(provider.live_watches(), 0);
    }
}
