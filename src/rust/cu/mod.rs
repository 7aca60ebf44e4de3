// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod driver;
mod mgmt;
mod worker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    driver::{
        CuDriver,
        CuHealth,
        CuInfo,
    },
    mgmt::{
        CuMgmt,
        CU_EXCLUSIVE,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    client::ClientId,
    command::{
        Command,
        CommandId,
    },
    runtime::fail::Fail,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Bit position of the domain in an encoded CU index.
const DOMAIN_SHIFT: u32 = 16;

/// Mask of the per-domain index in an encoded CU index.
const DOMAIN_INDEX_MASK: u32 = (1 << DOMAIN_SHIFT) - 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// CU Domain
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CuDomain {
    /// Programmable logic.
    Pl = 0,
    /// Processing system, i.e. soft kernels.
    Ps = 1,
}

/// Tunables of a CU worker.
#[derive(Debug, Clone, Copy)]
pub struct CuOptions {
    /// Bounded wait of an idle worker, so that a stop request is noticed.
    pub idle_timeout: Duration,
    /// Pause between completion polls while commands are outstanding. Zero yields the processor instead.
    pub busy_poll: Duration,
    /// Time an aborting client's started commands get to finish before the CU is declared hung.
    pub abort_hang_timeout: Duration,
}

/// Progress of abort requests on one CU.
#[derive(Debug, Default)]
pub(crate) struct AbortState {
    /// Client whose commands the worker is draining. One at a time.
    pub(crate) requested: Option<ClientId>,
    /// Finished aborts, kept until their client collects the result.
    pub(crate) done: HashMap<ClientId, CuHealth>,
}

/// State shared between a [Cu] and its worker thread.
pub(crate) struct CuShared {
    pub(crate) driver: Arc<dyn CuDriver>,
    /// Commands not yet claimed by the worker. Always the last lock taken.
    pub(crate) pending: Mutex<VecDeque<Command>>,
    doorbell_tx: Sender<()>,
    pub(crate) doorbell_rx: Receiver<()>,
    pub(crate) stop: AtomicBool,
    pub(crate) abort: Mutex<AbortState>,
    pub(crate) opts: CuOptions,
}

/// A compute unit, its queues and its worker thread.
pub struct Cu {
    shared: Arc<CuShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Encodes a domain into a CU index.
pub fn set_domain(domain: CuDomain, idx: u32) -> u32 {
    ((domain as u32) << DOMAIN_SHIFT) | (idx & DOMAIN_INDEX_MASK)
}

/// Extracts the domain of an encoded CU index.
pub fn get_domain(encoded: u32) -> CuDomain {
    if (encoded >> DOMAIN_SHIFT) == CuDomain::Ps as u32 {
        CuDomain::Ps
    } else {
        CuDomain::Pl
    }
}

/// Extracts the per-domain index of an encoded CU index.
pub fn get_domain_idx(encoded: u32) -> u32 {
    encoded & DOMAIN_INDEX_MASK
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuShared {
    pub(crate) fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_abort(&self) -> MutexGuard<'_, AbortState> {
        self.abort.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wakes the worker. A doorbell that is already ringing is left alone.
    pub(crate) fn ring(&self) {
        let _ = self.doorbell_tx.try_send(());
    }
}

impl Cu {
    /// Wraps a CU driver and starts its worker thread.
    pub fn new(driver: Arc<dyn CuDriver>, opts: CuOptions) -> Result<Self, Fail> {
        let (doorbell_tx, doorbell_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let shared: Arc<CuShared> = Arc::new(CuShared {
            driver,
            pending: Mutex::new(VecDeque::new()),
            doorbell_tx,
            doorbell_rx,
            stop: AtomicBool::new(false),
            abort: Mutex::new(AbortState::default()),
            opts,
        });

        let name: String = format!("kds-cu@{:x}", shared.driver.info().addr);
        let worker_shared: Arc<CuShared> = shared.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(name)
            .spawn(move || worker::run(worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn driver(&self) -> &Arc<dyn CuDriver> {
        &self.shared.driver
    }

    pub fn info(&self) -> &CuInfo {
        self.shared.driver.info()
    }

    /// Queues a command that was already assigned to this CU.
    pub fn submit(&self, cmd: Command) {
        let was_empty: bool = {
            let mut pending: MutexGuard<'_, VecDeque<Command>> = self.shared.lock_pending();
            let was_empty: bool = pending.is_empty();
            pending.push_back(cmd);
            was_empty
        };
        if was_empty {
            self.shared.ring();
        }
    }

    /// Number of commands waiting to be claimed by the worker.
    pub fn pending_len(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Takes a command of `client` out of the pending queue, provided the worker has not claimed it yet.
    pub fn remove_pending(&self, id: CommandId, client: ClientId) -> Option<Command> {
        let mut pending: MutexGuard<'_, VecDeque<Command>> = self.shared.lock_pending();
        let pos: usize = pending
            .iter()
            .position(|cmd| cmd.id() == id && cmd.client_id() == Some(client))?;
        pending.remove(pos)
    }

    /// Requests that every command of `client` leaves this CU. Fails with `EAGAIN` while another client's abort is
    /// in progress or the hardware cannot take the request yet.
    pub fn abort(&self, client: ClientId) -> Result<(), Fail> {
        let mut state: MutexGuard<'_, AbortState> = self.shared.lock_abort();
        match state.requested {
            Some(other) if other != client => {
                let cause: String = format!("abort for {} in progress on CU@{:#x}", other, self.info().addr);
                debug!("abort(): {}", cause);
                return Err(Fail::new(libc::EAGAIN, &cause));
            },
            Some(_) => return Ok(()),
            None => (),
        }
        self.shared.driver.abort()?;
        state.done.remove(&client);
        state.requested = Some(client);
        drop(state);

        self.shared.ring();
        Ok(())
    }

    /// Reports the CU health once the abort of `client` has completed. Results of other clients stay in place.
    pub fn abort_done(&self, client: ClientId) -> Option<CuHealth> {
        let health: CuHealth = self.shared.lock_abort().done.remove(&client)?;
        if health == CuHealth::Bad || self.shared.driver.health() == CuHealth::Bad {
            Some(CuHealth::Bad)
        } else {
            Some(CuHealth::Healthy)
        }
    }

    /// Drops a result `client` gave up waiting for.
    pub fn forget_abort(&self, client: ClientId) {
        self.shared.lock_abort().done.remove(&client);
    }

    pub fn set_bad_state(&self) {
        self.shared.driver.set_bad_state();
    }

    /// Stops the worker thread. Commands still queued complete as aborted.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.ring();

        let handle: Option<JoinHandle<()>> = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("stop(): worker of CU@{:#x} panicked", self.info().addr);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Cu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cu").field("info", self.info()).finish()
    }
}

impl Drop for Cu {
    fn drop(&mut self) {
        self.stop();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
