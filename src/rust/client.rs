// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    context::ClientInner,
    cu::CuDomain,
    runtime::limits::MAX_CUS,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Condvar,
        Mutex,
        MutexGuard,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Client Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

/// Per-CU command counters of a client.
struct ClientStats {
    submitted: [[AtomicU64; MAX_CUS]; 2],
    completed: [[AtomicU64; MAX_CUS]; 2],
}

/// One open connection to the device.
pub struct Client {
    id: ClientId,
    pid: u32,
    /// Contexts and CU reservations. Always taken before any CU table lock.
    inner: Mutex<ClientInner>,
    /// Completions not yet consumed by [Client::poll] or [Client::wait_event].
    events: Mutex<u64>,
    waitq: Condvar,
    stats: ClientStats,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ClientStats {
    fn new() -> Self {
        Self {
            submitted: [
                std::array::from_fn(|_| AtomicU64::new(0)),
                std::array::from_fn(|_| AtomicU64::new(0)),
            ],
            completed: [
                std::array::from_fn(|_| AtomicU64::new(0)),
                std::array::from_fn(|_| AtomicU64::new(0)),
            ],
        }
    }
}

impl Client {
    pub(crate) fn new(id: u32, pid: u32) -> Self {
        Self {
            id: ClientId(id),
            pid,
            inner: Mutex::new(ClientInner::default()),
            events: Mutex::new(0),
            waitq: Condvar::new(),
            stats: ClientStats::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ClientInner> {
        // A poisoned client lock only means a callback panicked while holding it; the bookkeeping is still valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the client still holds a context, a hardware context or a CU.
    pub fn has_open_contexts(&self) -> bool {
        self.lock_inner().has_open_contexts()
    }

    /// Consumes one pending completion event, if any. Never blocks.
    pub fn poll(&self) -> bool {
        let mut events: MutexGuard<'_, u64> = self.lock_events();
        if *events == 0 {
            return false;
        }
        *events -= 1;
        true
    }

    /// Blocks until a completion event is pending, then consumes it. Returns `false` if `timeout` expired first.
    pub fn wait_event(&self, timeout: Option<Duration>) -> bool {
        let deadline: Option<Instant> = timeout.map(|t| Instant::now() + t);
        let mut events: MutexGuard<'_, u64> = self.lock_events();
        while *events == 0 {
            events = match deadline {
                None => self.waitq.wait(events).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now: Instant = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.waitq.wait_timeout(events, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(e) => e.into_inner().0,
                    }
                },
            };
        }
        *events -= 1;
        true
    }

    /// Number of completion events not consumed yet.
    pub fn pending_events(&self) -> u64 {
        *self.lock_events()
    }

    /// Number of commands this client sent to a CU.
    pub fn submitted(&self, domain: CuDomain, idx: u32) -> u64 {
        match self.stats.submitted[domain as usize].get(idx as usize) {
            Some(count) => count.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Number of commands of this client a CU finished, whatever the outcome.
    pub fn completed(&self, domain: CuDomain, idx: u32) -> u64 {
        match self.stats.completed[domain as usize].get(idx as usize) {
            Some(count) => count.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Number of commands of this client still queued or running on a CU.
    pub fn outstanding(&self, domain: CuDomain, idx: u32) -> u64 {
        // Completion is counted after submission, read it first.
        let completed: u64 = self.completed(domain, idx);
        self.submitted(domain, idx).saturating_sub(completed)
    }

    pub(crate) fn stat_submit(&self, domain: CuDomain, idx: u32) {
        if let Some(count) = self.stats.submitted[domain as usize].get(idx as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn stat_complete(&self, domain: CuDomain, idx: u32) {
        if let Some(count) = self.stats.completed[domain as usize].get(idx as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Records one completion and wakes any waiter.
    pub(crate) fn signal_event(&self) {
        let mut events: MutexGuard<'_, u64> = self.lock_events();
        *events += 1;
        self.waitq.notify_all();
    }

    fn lock_events(&self) -> MutexGuard<'_, u64> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("id", &self.id).field("pid", &self.pid).finish()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
