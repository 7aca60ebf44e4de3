// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod mask;
mod status;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    mask::{
        CuList,
        CuMask,
    },
    status::KdsStatus,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    client::{
        Client,
        ClientId,
    },
    context::HwCtxId,
    cu::CuDomain,
};
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of command identifiers.
static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Command Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

/// Callback fired once with the final status of a command.
pub type NotifyFn = Box<dyn FnOnce(CommandId, KdsStatus) + Send>;

/// Callback fired once when the scheduler releases a command.
pub type FreeFn = Box<dyn FnOnce(CommandId) + Send>;

/// Command operation and the payload that goes with it.
#[derive(Debug, Clone)]
pub enum CmdOp {
    /// Reorders the CU table to match the given CU base addresses.
    Configure(Vec<u64>),
    /// Starts a kernel on one of the programmable logic CUs named by `cu_mask`.
    Start { cu_mask: CuMask, payload: Vec<u32> },
    /// Starts a soft kernel on one of the PS CUs named by `cu_mask`.
    SkStart { cu_mask: CuMask, payload: Vec<u32> },
    /// Removes a command that no CU worker has claimed yet.
    Abort { target: CommandId },
    /// Copies `size` bytes between two device buffers.
    Copy { src: u64, dst: u64, size: u64 },
}

/// Command
///
/// A command is released exactly once: dropping it fires the free callback, and a command that is dropped before
/// it was completed is first completed as [KdsStatus::Aborted].
pub struct Command {
    id: CommandId,
    op: CmdOp,
    status: KdsStatus,
    client: Option<Arc<Client>>,
    hw_ctx: Option<HwCtxId>,
    cu: Option<(CuDomain, u32)>,
    completed: bool,
    notify: Option<NotifyFn>,
    free: Option<FreeFn>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Command {
    /// Allocates a new command.
    pub fn new(op: CmdOp) -> Self {
        Self {
            id: CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)),
            op,
            status: KdsStatus::New,
            client: None,
            hw_ctx: None,
            cu: None,
            completed: false,
            notify: None,
            free: None,
        }
    }

    /// Sets the callback that receives the final status.
    pub fn on_notify<F: FnOnce(CommandId, KdsStatus) + Send + 'static>(mut self, f: F) -> Self {
        self.notify = Some(Box::new(f));
        self
    }

    /// Sets the callback that runs when the command is released.
    pub fn on_free<F: FnOnce(CommandId) + Send + 'static>(mut self, f: F) -> Self {
        self.free = Some(Box::new(f));
        self
    }

    /// Submits the command under a hardware context instead of the client's legacy contexts.
    pub fn in_hw_ctx(mut self, hw_ctx: HwCtxId) -> Self {
        self.hw_ctx = Some(hw_ctx);
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn op(&self) -> &CmdOp {
        &self.op
    }

    pub fn status(&self) -> KdsStatus {
        self.status
    }

    pub fn hw_ctx(&self) -> Option<HwCtxId> {
        self.hw_ctx
    }

    /// CU this command was dispatched to, if any.
    pub fn cu(&self) -> Option<(CuDomain, u32)> {
        self.cu
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client.as_ref().map(|c| c.id())
    }

    /// Candidate mask for start commands.
    pub fn cu_mask(&self) -> Option<&CuMask> {
        match &self.op {
            CmdOp::Start { cu_mask, .. } | CmdOp::SkStart { cu_mask, .. } => Some(cu_mask),
            _ => None,
        }
    }

    /// Register payload for start commands.
    pub fn payload(&self) -> &[u32] {
        match &self.op {
            CmdOp::Start { payload, .. } | CmdOp::SkStart { payload, .. } => payload.as_slice(),
            _ => &[],
        }
    }

    pub(crate) fn bind(&mut self, client: Arc<Client>) {
        self.client = Some(client);
    }

    pub(crate) fn set_status(&mut self, status: KdsStatus) {
        self.status = status;
    }

    pub(crate) fn set_cu(&mut self, domain: CuDomain, idx: u32) {
        self.cu = Some((domain, idx));
        if let Some(client) = self.client.as_ref() {
            client.stat_submit(domain, idx);
        }
    }

    /// Completes the command with `status` and releases it.
    pub fn complete(mut self, status: KdsStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: KdsStatus) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.status = status;
        trace!("finish(): id={:?}, status={}", self.id, status);

        if let (Some(client), Some((domain, idx))) = (self.client.as_ref(), self.cu) {
            client.stat_complete(domain, idx);
        }
        if let Some(notify) = self.notify.take() {
            notify(self.id, status);
        }
        if let Some(client) = self.client.as_ref() {
            client.signal_event();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("status", &self.status)
            .field("client", &self.client_id())
            .field("cu", &self.cu)
            .finish()
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if !self.completed {
            warn!("drop(): command {:?} released without completion", self.id);
            self.finish(KdsStatus::Aborted);
        }
        if let Some(free) = self.free.take() {
            free(self.id);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
