use crate::address::{self, format_address};
use crate::provider::{
    le_word, AccessType, BreakTrigger, IntrospectionProvider, ProviderError, RegisterSnapshot,
    TrapContext, TrapHandler,
};
use crate::{cb_debug, cb_warn, weak_error};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

/// Default number of hardware breakpoint slots (x86 DR0..DR3).
pub const DEFAULT_SLOTS: usize = 4;
/// Default number of hits kept per breakpoint.
pub const DEFAULT_MAX_HITS: usize = 1000;
/// Upper bound of hits waiting in the trap mailbox between two drains.
const MAX_PENDING_HITS: usize = 65_536;

#[derive(Debug, thiserror::Error)]
pub enum BreakpointError {
    #[error("no free hardware slot")]
    NoFreeSlot,
    #[error("breakpoint `{0}` not found")]
    NotFound(String),
    #[error("invalid data breakpoint size {0}, expected 1, 2, 4 or 8")]
    InvalidSize(usize),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BreakpointKind {
    Execute,
    Data {
        #[serde(serialize_with = "serialize_access")]
        access_type: AccessType,
    },
}

fn serialize_access<S: serde::Serializer>(access: &AccessType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&access.to_string())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakpointRecord {
    pub id: String,
    #[serde(serialize_with = "address::serialize")]
    pub address: u64,
    /// Hardware slot, `1..=N`.
    pub slot: usize,
    #[serde(flatten)]
    pub kind: BreakpointKind,
    pub size: usize,
}

/// What an execute breakpoint captures on hit.
#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    pub registers: bool,
    pub stack: bool,
    pub stack_depth: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            registers: true,
            stack: false,
            stack_depth: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakpointHit {
    pub breakpoint_id: String,
    #[serde(serialize_with = "address::serialize")]
    pub address: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "address::serialize")]
    pub instruction_pointer: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<RegisterSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<u64>>,
    /// Value at the watched address (data breakpoints).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    /// Instruction at the trapping instruction pointer (data breakpoints).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

/// Hit as sent by a trap handler, tagged with the serial of the breakpoint installation
/// so that hits of a removed breakpoint never land in the history of a new one.
struct TrapMessage {
    serial: u64,
    hit: BreakpointHit,
}

struct Entry {
    record: BreakpointRecord,
    serial: u64,
    history: VecDeque<BreakpointHit>,
}

/// Sending half of the trap mailbox, owned by trap handlers.
///
/// The mailbox holds at most `slots * max_hits` hits. When it is full a trap drops its hit
/// instead of blocking the trapping thread, drops are counted and reported on the next drain.
#[derive(Clone)]
struct MailboxSender {
    tx: SyncSender<TrapMessage>,
    dropped: Arc<AtomicUsize>,
}

impl MailboxSender {
    fn post(&self, message: TrapMessage) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Owner of the hardware breakpoint slot pool.
pub struct BreakpointManager {
    slots: usize,
    max_hits: usize,
    entries: IndexMap<String, Entry>,
    next_serial: u64,
    mailbox_tx: MailboxSender,
    mailbox: Receiver<TrapMessage>,
}

impl BreakpointManager {
    pub fn new(slots: usize, max_hits: usize) -> Self {
        let max_hits = max_hits.max(1);
        let capacity = slots.saturating_mul(max_hits).clamp(1, MAX_PENDING_HITS);
        let (tx, mailbox) = sync_channel(capacity);
        Self {
            slots,
            max_hits,
            entries: IndexMap::new(),
            next_serial: 0,
            mailbox_tx: MailboxSender {
                tx,
                dropped: Arc::new(AtomicUsize::new(0)),
            },
            mailbox,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set an execute breakpoint, the lowest free slot is used.
    pub fn set_execute(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        address: u64,
        id: Option<String>,
        capture: CaptureOptions,
    ) -> Result<BreakpointRecord, BreakpointError> {
        let id = id.unwrap_or_else(|| default_id(address));
        let serial = self.next_serial();
        let tx = self.mailbox_tx.clone();
        let hit_id = id.clone();

        let on_hit: TrapHandler = Box::new(move |ctx: &mut dyn TrapContext| {
            let hit = BreakpointHit {
                breakpoint_id: hit_id.clone(),
                address,
                timestamp: Utc::now(),
                instruction_pointer: ctx.instruction_pointer(),
                registers: capture.registers.then(|| ctx.registers()),
                stack: capture.stack.then(|| ctx.read_stack(capture.stack_depth)),
                value: None,
                instruction: None,
            };
            tx.post(TrapMessage { serial, hit });
            ctx.resume();
        });

        self.install(
            provider,
            id,
            address,
            1,
            BreakpointKind::Execute,
            serial,
            on_hit,
        )
    }

    /// Set a data breakpoint, shares the slot pool with execute breakpoints.
    pub fn set_data(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        address: u64,
        access_type: AccessType,
        size: usize,
        id: Option<String>,
    ) -> Result<BreakpointRecord, BreakpointError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(BreakpointError::InvalidSize(size));
        }

        let id = id.unwrap_or_else(|| default_id(address));
        let serial = self.next_serial();
        let tx = self.mailbox_tx.clone();
        let hit_id = id.clone();

        let on_hit: TrapHandler = Box::new(move |ctx: &mut dyn TrapContext| {
            let ip = ctx.instruction_pointer();
            let hit = BreakpointHit {
                breakpoint_id: hit_id.clone(),
                address,
                timestamp: Utc::now(),
                instruction_pointer: ip,
                registers: Some(ctx.registers()),
                stack: None,
                value: ctx.read_bytes(address, size).ok().map(|b| le_word(&b)),
                instruction: ctx.disassemble(ip).ok().map(|insn| insn.text),
            };
            tx.post(TrapMessage { serial, hit });
            ctx.resume();
        });

        self.install(
            provider,
            id,
            address,
            size,
            BreakpointKind::Data { access_type },
            serial,
            on_hit,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        id: String,
        address: u64,
        size: usize,
        kind: BreakpointKind,
        serial: u64,
        on_hit: TrapHandler,
    ) -> Result<BreakpointRecord, BreakpointError> {
        self.drain_mailbox();

        // a breakpoint at the same address or with the same id is replaced
        let replaced: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.record.address == address || e.record.id == id)
            .map(|e| e.record.id.clone())
            .collect();
        for old in replaced {
            cb_debug!(target: "breakpoint", "replace breakpoint {old}");
            self.unregister(provider, &old);
        }

        let slot = (1..=self.slots)
            .find(|slot| self.entries.values().all(|e| e.record.slot != *slot))
            .ok_or(BreakpointError::NoFreeSlot)?;

        let trigger = match kind {
            BreakpointKind::Execute => BreakTrigger::Execute,
            BreakpointKind::Data { access_type } => BreakTrigger::Access(access_type),
        };
        provider.set_hardware_breakpoint(address, size, trigger, on_hit)?;

        let record = BreakpointRecord {
            id: id.clone(),
            address,
            slot,
            kind,
            size,
        };
        self.entries.insert(
            id,
            Entry {
                record: record.clone(),
                serial,
                history: VecDeque::new(),
            },
        );
        cb_debug!(target: "breakpoint", "breakpoint {} set at {} (slot {slot})", record.id, format_address(address));
        Ok(record)
    }

    /// Forget a breakpoint and unregister it from the provider (best-effort).
    fn unregister(&mut self, provider: &mut dyn IntrospectionProvider, id: &str) -> Option<Entry> {
        let entry = self.entries.shift_remove(id)?;
        weak_error!(
            provider.remove_breakpoint(entry.record.address),
            "remove hardware breakpoint:"
        );
        Some(entry)
    }

    /// Remove a breakpoint, its slot and its hit history.
    pub fn remove(
        &mut self,
        provider: &mut dyn IntrospectionProvider,
        id: &str,
    ) -> Result<BreakpointRecord, BreakpointError> {
        self.drain_mailbox();
        self.unregister(provider, id)
            .map(|entry| entry.record)
            .ok_or_else(|| BreakpointError::NotFound(id.to_string()))
    }

    /// Move captured hits from the trap mailbox into per-breakpoint history.
    /// Returns the number of messages taken out of the mailbox.
    fn drain_mailbox(&mut self) -> usize {
        let dropped = self.mailbox_tx.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            cb_warn!(target: "breakpoint", "trap mailbox full, {dropped} hit(s) dropped");
        }

        let mut received = 0;
        while let Ok(TrapMessage { serial, hit }) = self.mailbox.try_recv() {
            received += 1;
            let Some(entry) = self.entries.get_mut(&hit.breakpoint_id) else {
                continue;
            };
            if entry.serial != serial {
                continue;
            }
            if entry.history.len() == self.max_hits {
                entry.history.pop_front();
            }
            entry.history.push_back(hit);
        }
        received
    }

    /// Hits of one breakpoint (or all of them, ordered by time), optionally clearing history.
    pub fn hits(&mut self, id: Option<&str>, clear: bool) -> Result<Vec<BreakpointHit>, BreakpointError> {
        self.drain_mailbox();

        let hits = match id {
            Some(id) => {
                let entry = self
                    .entries
                    .get_mut(id)
                    .ok_or_else(|| BreakpointError::NotFound(id.to_string()))?;
                if clear {
                    entry.history.drain(..).collect()
                } else {
                    entry.history.iter().cloned().collect()
                }
            }
            None => self
                .entries
                .values_mut()
                .flat_map(|entry| {
                    if clear {
                        entry.history.drain(..).collect::<Vec<_>>()
                    } else {
                        entry.history.iter().cloned().collect()
                    }
                })
                .sorted_by_key(|hit| hit.timestamp)
                .collect(),
        };
        Ok(hits)
    }

    /// Active breakpoints ordered by slot.
    pub fn list(&mut self) -> Vec<BreakpointRecord> {
        self.drain_mailbox();
        self.entries
            .values()
            .map(|e| e.record.clone())
            .sorted_by_key(|r| r.slot)
            .collect()
    }

    /// Unregister every breakpoint, never fails. Returns the number of removed breakpoints.
    pub fn clear_all(&mut self, provider: &mut dyn IntrospectionProvider) -> usize {
        self.drain_mailbox();
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        let removed = ids.len();
        for id in ids {
            self.unregister(provider, &id);
        }
        while self.mailbox.try_recv().is_ok() {}
        removed
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS, DEFAULT_MAX_HITS)
    }
}

/// Breakpoint id used when the caller gives none, e.g. `bp_0x401000`.
pub fn default_id(address: u64) -> String {
    format!("bp_{}", format_address(address))
}
