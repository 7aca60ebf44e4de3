// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! CU worker thread.
//!
//! Each CU is driven by one polling thread, because most CUs cannot interrupt the host. Commands flow from the
//! pending queue (filled by submitters) to the running queue (claimed, waiting for a hardware credit) and then to
//! the submitted queue (started on the CU, waiting for completion). CUs complete in the order they were started.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    client::ClientId,
    command::{
        Command,
        KdsStatus,
    },
    cu::{
        AbortState,
        CuHealth,
        CuShared,
    },
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::Ordering,
        Arc,
        MutexGuard,
    },
    thread,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct CuWorker {
    shared: Arc<CuShared>,
    /// Claimed from pending, not started yet.
    running: VecDeque<Command>,
    /// Started on the CU, oldest first.
    submitted: VecDeque<Command>,
    /// When the current abort started waiting for started commands.
    abort_since: Option<Instant>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Worker thread entry point.
pub(crate) fn run(shared: Arc<CuShared>) {
    let mut worker: CuWorker = CuWorker {
        shared,
        running: VecDeque::new(),
        submitted: VecDeque::new(),
        abort_since: None,
    };
    worker.run();
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuWorker {
    fn run(&mut self) {
        let addr: u64 = self.shared.driver.info().addr;
        debug!("run(): worker for CU@{:#x} started", addr);

        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                self.flush();
                break;
            }

            self.claim_pending();
            self.process_abort();

            if !self.running.is_empty() {
                // Out of credits: make room by draining completions instead.
                if !self.process_sq_once() && !self.process_cq_once() {
                    self.backoff();
                }
                continue;
            }

            if !self.submitted.is_empty() {
                if !self.process_cq_once() {
                    self.backoff();
                }
                continue;
            }

            // Timeouts and wake-ups are handled alike: re-check everything.
            let _ = self.shared.doorbell_rx.recv_timeout(self.shared.opts.idle_timeout);
        }

        debug!("run(): worker for CU@{:#x} stopped", addr);
    }

    /// Moves everything from the pending queue to the running queue.
    fn claim_pending(&mut self) {
        let mut pending = self.shared.lock_pending();
        self.running.extend(pending.drain(..));
    }

    /// Starts commands in FIFO order while the CU has credits. Returns `false` when it ran out of credits.
    fn process_sq_once(&mut self) -> bool {
        while !self.running.is_empty() {
            if !self.shared.driver.get_credit() {
                return false;
            }
            let mut cmd: Command = match self.running.pop_front() {
                Some(cmd) => cmd,
                None => break,
            };
            match self.shared.driver.start(cmd.payload()) {
                Ok(()) => {
                    cmd.set_status(KdsStatus::Running);
                    self.submitted.push_back(cmd);
                },
                Err(e) => {
                    warn!("process_sq_once(): failed to start {:?} ({:?})", cmd.id(), e);
                    self.shared.driver.put_credit(1);
                    cmd.complete(KdsStatus::Error);
                },
            }
        }
        true
    }

    /// Completes the oldest started command if the CU reports it done. Returns `false` if nothing completed.
    fn process_cq_once(&mut self) -> bool {
        let status: KdsStatus = match self.shared.driver.check() {
            Some(status) => status,
            None => return false,
        };
        match self.submitted.pop_front() {
            Some(cmd) => {
                self.shared.driver.put_credit(1);
                cmd.complete(status);
            },
            None => warn!(
                "process_cq_once(): CU@{:#x} reported a completion with nothing started",
                self.shared.driver.info().addr
            ),
        }
        true
    }

    /// Makes progress on an abort request, if one is pending.
    fn process_abort(&mut self) {
        let target: ClientId = match self.shared.lock_abort().requested {
            Some(client) => client,
            None => {
                self.abort_since = None;
                return;
            },
        };

        // Commands that never reached the hardware leave right away.
        let (victims, keep): (VecDeque<Command>, VecDeque<Command>) =
            self.running.drain(..).partition(|cmd| cmd.client_id() == Some(target));
        self.running = keep;
        for cmd in victims {
            cmd.complete(KdsStatus::Aborted);
        }

        let busy: bool = self.submitted.iter().any(|cmd| cmd.client_id() == Some(target));
        let health: CuHealth = if !busy {
            self.shared.driver.health()
        } else {
            let since: Instant = *self.abort_since.get_or_insert_with(Instant::now);
            if since.elapsed() < self.shared.opts.abort_hang_timeout {
                return;
            }
            error!(
                "process_abort(): CU@{:#x} hung with {} started commands",
                self.shared.driver.info().addr,
                self.submitted.len()
            );
            // Nothing started on a hung CU will ever complete. Its credits come back for after the reset.
            for cmd in self.submitted.drain(..) {
                self.shared.driver.put_credit(1);
                cmd.complete(KdsStatus::Timeout);
            }
            CuHealth::Bad
        };

        self.abort_since = None;
        let mut state: MutexGuard<'_, AbortState> = self.shared.lock_abort();
        state.requested = None;
        state.done.insert(target, health);
        drop(state);
        debug!("process_abort(): abort for {} done, health={:?}", target, health);
    }

    /// Waits a little before polling the CU again.
    fn backoff(&self) {
        if self.shared.opts.busy_poll.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.shared.opts.busy_poll);
        }
    }

    /// Completes every queued command on shutdown.
    fn flush(&mut self) {
        let pending: Vec<Command> = self.shared.lock_pending().drain(..).collect();
        let leftovers = pending
            .into_iter()
            .chain(self.running.drain(..))
            .chain(self.submitted.drain(..));
        for cmd in leftovers {
            cmd.complete(KdsStatus::Aborted);
        }
    }
}
