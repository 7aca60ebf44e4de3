// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Software compute unit.
//!
//! [SimCu] behaves like a CU with a bounded hardware queue that finishes commands in order after a fixed latency.
//! Knobs let tests make it hang, refuse abort requests, report a crashed soft kernel or go bad.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::KdsStatus,
    cu::{
        CuDriver,
        CuHealth,
        CuInfo,
    },
    runtime::fail::Fail,
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            AtomicU64,
            Ordering,
        },
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Hardware queue depth of a simulated CU unless told otherwise.
const DEFAULT_QUEUE_DEPTH: u32 = 4;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Simulated CU
pub struct SimCu {
    info: CuInfo,
    depth: u32,
    credits: AtomicU32,
    latency: Duration,
    /// Start time of every command on the CU, oldest first.
    inflight: Mutex<VecDeque<Instant>>,
    hang: AtomicBool,
    /// Abort requests still to be answered with `EAGAIN`.
    busy_aborts: AtomicU32,
    bad_on_abort: AtomicBool,
    bad: AtomicBool,
    /// Completions still to be reported as crashed.
    crashes: AtomicU32,
    started: AtomicU64,
    completed: AtomicU64,
    aborts: AtomicU64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SimCu {
    pub fn new(info: CuInfo) -> Self {
        Self {
            info,
            depth: DEFAULT_QUEUE_DEPTH,
            credits: AtomicU32::new(DEFAULT_QUEUE_DEPTH),
            latency: Duration::ZERO,
            inflight: Mutex::new(VecDeque::new()),
            hang: AtomicBool::new(false),
            busy_aborts: AtomicU32::new(0),
            bad_on_abort: AtomicBool::new(false),
            bad: AtomicBool::new(false),
            crashes: AtomicU32::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    /// Sets the hardware queue depth.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self.credits = AtomicU32::new(depth);
        self
    }

    /// Sets the time a command takes to execute.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// While hung, started commands never complete.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::Release);
    }

    /// Answers the next `count` abort requests with `EAGAIN`.
    pub fn fail_aborts(&self, count: u32) {
        self.busy_aborts.store(count, Ordering::Release);
    }

    /// Reports bad health after the next abort.
    pub fn set_bad_on_abort(&self, bad: bool) {
        self.bad_on_abort.store(bad, Ordering::Release);
    }

    /// Reports the next `count` completions as soft kernel crashes.
    pub fn crash_next(&self, count: u32) {
        self.crashes.store(count, Ordering::Release);
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    /// Commands started so far.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    /// Commands completed so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Abort requests accepted so far.
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Acquire)
    }

    /// Credits not taken.
    pub fn free_credits(&self) -> u32 {
        self.credits.load(Ordering::Acquire)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl CuDriver for SimCu {
    fn info(&self) -> &CuInfo {
        &self.info
    }

    fn get_credit(&self) -> bool {
        Self::take_one(&self.credits)
    }

    fn put_credit(&self, count: u32) {
        let depth: u32 = self.depth;
        let _ = self
            .credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some((n + count).min(depth)));
    }

    fn start(&self, _payload: &[u32]) -> Result<(), Fail> {
        if self.is_bad() {
            let cause: String = format!("CU@{:#x} is in bad state", self.info.addr);
            warn!("start(): {}", cause);
            return Err(Fail::new(libc::EIO, &cause));
        }
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Instant::now());
        self.started.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn check(&self) -> Option<KdsStatus> {
        if self.hang.load(Ordering::Acquire) {
            return None;
        }
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.front() {
                Some(since) if since.elapsed() >= self.latency => {
                    inflight.pop_front();
                },
                _ => return None,
            }
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        if Self::take_one(&self.crashes) {
            Some(KdsStatus::SkCrashed)
        } else {
            Some(KdsStatus::Completed)
        }
    }

    fn abort(&self) -> Result<(), Fail> {
        if Self::take_one(&self.busy_aborts) {
            let cause: String = format!("CU@{:#x} cannot stop yet", self.info.addr);
            debug!("abort(): {}", cause);
            return Err(Fail::new(libc::EAGAIN, &cause));
        }
        self.aborts.fetch_add(1, Ordering::AcqRel);
        if self.bad_on_abort.load(Ordering::Acquire) {
            self.bad.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn health(&self) -> CuHealth {
        if self.is_bad() {
            CuHealth::Bad
        } else {
            CuHealth::Healthy
        }
    }

    fn set_bad_state(&self) {
        warn!("set_bad_state(): CU@{:#x}", self.info.addr);
        self.bad.store(true, Ordering::Release);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
