// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Client context bookkeeping.
//!
//! A client claims a loaded xclbin through a [ClientCtx], and claims CUs through CU-Contexts attached either to
//! that context (legacy model) or to one of its hardware contexts (multi-slot model). Nothing in here touches the
//! CU tables: reference counting against the tables is done by the scheduler while it holds the client lock.

mod arena;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::arena::CuCtxArena;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::CuList,
    cu::{
        get_domain,
        get_domain_idx,
        CuDomain,
    },
    runtime::{
        fail::Fail,
        limits::{
            CU_MASK_WORDS,
            CU_VIRTUAL,
            MAX_CUS,
        },
    },
    slot::XclbinId,
};
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Access requested on a CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuAccess {
    Shared,
    Exclusive,
}

/// What a client asks for when it opens a CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuCtxInfo {
    /// CU index within the domain, or [CU_VIRTUAL].
    pub cu_idx: u32,
    pub domain: CuDomain,
    pub access: CuAccess,
}

/// Hardware Context Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwCtxId(u32);

/// Object a CU-Context is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuCtxOwner {
    Context(XclbinId),
    HwContext(HwCtxId),
}

/// Stable reference to a CU-Context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CuCtxHandle {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

/// Access grant on one CU.
#[derive(Debug)]
pub struct CuCtx {
    info: CuCtxInfo,
    ref_cnt: u32,
    owner: CuCtxOwner,
    pub(crate) generation: u64,
}

/// A client's claim on one loaded xclbin.
#[derive(Debug)]
pub struct ClientCtx {
    xclbin_id: XclbinId,
    slot_idx: u32,
    cu_ctxs: Vec<CuCtxHandle>,
    hw_ctxs: Vec<HwCtxId>,
}

/// A graph opened under a hardware context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCtx {
    pub graph_id: u32,
    pub access: CuAccess,
}

/// One (xclbin, slot) pairing opened by a client.
#[derive(Debug)]
pub struct HwCtx {
    id: HwCtxId,
    xclbin_id: XclbinId,
    slot_idx: u32,
    cu_ctxs: Vec<CuCtxHandle>,
    graph_ctxs: Vec<GraphCtx>,
}

/// Everything a client holds, protected by the client lock.
#[derive(Default)]
pub struct ClientInner {
    contexts: Vec<ClientCtx>,
    hw_ctxs: Vec<HwCtx>,
    next_hw_ctx_id: u32,
    cu_ctxs: CuCtxArena,
    /// CUs reserved through legacy contexts, one bitmap per domain.
    cu_bitmap: [[u32; CU_MASK_WORDS]; 2],
    /// Open references on the virtual CU.
    virt_cu_ref: u32,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuCtxInfo {
    pub fn new(cu_idx: u32, domain: CuDomain, access: CuAccess) -> Self {
        Self { cu_idx, domain, access }
    }

    /// The bitstream pin. Exclusive access is never granted on it.
    pub fn virtual_cu() -> Self {
        Self::new(CU_VIRTUAL, CuDomain::Pl, CuAccess::Shared)
    }

    /// Decodes a CU index that carries its domain in the upper bits.
    pub fn from_encoded(encoded: u32, access: CuAccess) -> Self {
        if encoded == CU_VIRTUAL {
            return Self {
                access,
                ..Self::virtual_cu()
            };
        }
        Self::new(get_domain_idx(encoded), get_domain(encoded), access)
    }

    pub fn is_virtual(&self) -> bool {
        self.cu_idx == CU_VIRTUAL
    }
}

impl CuCtx {
    pub(crate) fn new(info: CuCtxInfo, owner: CuCtxOwner) -> Self {
        Self {
            info,
            ref_cnt: 0,
            owner,
            generation: 0,
        }
    }

    pub fn info(&self) -> &CuCtxInfo {
        &self.info
    }

    pub fn ref_cnt(&self) -> u32 {
        self.ref_cnt
    }

    pub fn owner(&self) -> CuCtxOwner {
        self.owner
    }

    pub(crate) fn get(&mut self) {
        self.ref_cnt += 1;
    }

    pub(crate) fn put(&mut self) {
        self.ref_cnt = self.ref_cnt.saturating_sub(1);
    }
}

impl ClientCtx {
    pub fn xclbin_id(&self) -> XclbinId {
        self.xclbin_id
    }

    pub fn slot_idx(&self) -> u32 {
        self.slot_idx
    }

    pub fn cu_ctxs(&self) -> &[CuCtxHandle] {
        &self.cu_ctxs
    }

    pub fn hw_ctxs(&self) -> &[HwCtxId] {
        &self.hw_ctxs
    }

    /// A context can go once nothing is attached to it.
    pub fn is_idle(&self) -> bool {
        self.cu_ctxs.is_empty() && self.hw_ctxs.is_empty()
    }
}

impl HwCtx {
    pub fn id(&self) -> HwCtxId {
        self.id
    }

    pub fn xclbin_id(&self) -> XclbinId {
        self.xclbin_id
    }

    pub fn slot_idx(&self) -> u32 {
        self.slot_idx
    }

    pub fn cu_ctxs(&self) -> &[CuCtxHandle] {
        &self.cu_ctxs
    }

    pub fn graph_ctxs(&self) -> &[GraphCtx] {
        &self.graph_ctxs
    }
}

impl ClientInner {
    //==================================================================================================================
    // Contexts
    //==================================================================================================================

    pub fn context(&self, xclbin_id: XclbinId) -> Option<&ClientCtx> {
        self.contexts.iter().find(|ctx| ctx.xclbin_id == xclbin_id)
    }

    pub fn contexts(&self) -> &[ClientCtx] {
        &self.contexts
    }

    /// Creates the context of `xclbin_id` unless it already exists. Returns `true` if it was created.
    pub(crate) fn insert_context(&mut self, xclbin_id: XclbinId, slot_idx: u32) -> bool {
        if self.context(xclbin_id).is_some() {
            return false;
        }
        self.contexts.push(ClientCtx {
            xclbin_id,
            slot_idx,
            cu_ctxs: Vec::new(),
            hw_ctxs: Vec::new(),
        });
        true
    }

    /// Destroys a context that has nothing attached anymore.
    pub(crate) fn remove_context(&mut self, xclbin_id: XclbinId) -> Result<ClientCtx, Fail> {
        let pos: usize = match self.contexts.iter().position(|ctx| ctx.xclbin_id == xclbin_id) {
            Some(pos) => pos,
            None => {
                let cause: String = format!("no context on xclbin {}", xclbin_id);
                error!("remove_context(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if !self.contexts[pos].is_idle() {
            let cause: String = format!(
                "context on xclbin {} still has {} CU contexts and {} hardware contexts",
                xclbin_id,
                self.contexts[pos].cu_ctxs.len(),
                self.contexts[pos].hw_ctxs.len()
            );
            error!("remove_context(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        Ok(self.contexts.remove(pos))
    }

    /// Whether anything would keep the client from leaving.
    pub fn has_open_contexts(&self) -> bool {
        !self.contexts.is_empty() || !self.hw_ctxs.is_empty() || !self.cu_ctxs.is_empty() || self.virt_cu_ref > 0
    }

    //==================================================================================================================
    // CU Contexts
    //==================================================================================================================

    /// Finds the CU-Context for `info` under `owner`, or creates one with no reference. Access rights against the
    /// CU table are not checked here.
    pub(crate) fn alloc_cu_ctx(&mut self, owner: CuCtxOwner, info: CuCtxInfo) -> Result<CuCtxHandle, Fail> {
        if info.is_virtual() {
            if info.access == CuAccess::Exclusive {
                let cause: &str = "the virtual CU can only be opened shared";
                error!("alloc_cu_ctx(): {}", cause);
                return Err(Fail::new(libc::EINVAL, cause));
            }
        } else if info.cu_idx as usize >= MAX_CUS {
            let cause: String = format!("CU index {} out of range", info.cu_idx);
            error!("alloc_cu_ctx(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        if self.owner_list(owner).is_none() {
            let cause: String = format!("{:?} does not exist", owner);
            error!("alloc_cu_ctx(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if let Some(handle) = self.get_cu_ctx(owner, info) {
            return Ok(handle);
        }

        let handle: CuCtxHandle = self.cu_ctxs.alloc(CuCtx::new(info, owner));
        if let Some(list) = self.owner_list_mut(owner) {
            list.push(handle);
        }
        trace!("alloc_cu_ctx(): {:?} -> {:?}", info, handle);
        Ok(handle)
    }

    /// Looks up the CU-Context for the CU named by `info` under `owner`.
    pub fn get_cu_ctx(&self, owner: CuCtxOwner, info: CuCtxInfo) -> Option<CuCtxHandle> {
        self.owner_list(owner)?.iter().copied().find(|handle| match self.cu_ctxs.get(*handle) {
            Some(cu_ctx) => cu_ctx.info.cu_idx == info.cu_idx && cu_ctx.info.domain == info.domain,
            None => false,
        })
    }

    /// Physically frees a CU-Context whose reference count dropped to zero.
    pub(crate) fn free_cu_ctx(&mut self, handle: CuCtxHandle) -> Result<(), Fail> {
        let (owner, ref_cnt): (CuCtxOwner, u32) = match self.cu_ctxs.get(handle) {
            Some(cu_ctx) => (cu_ctx.owner, cu_ctx.ref_cnt),
            None => {
                let cause: String = format!("stale CU context handle {:?}", handle);
                error!("free_cu_ctx(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        if ref_cnt > 0 {
            let cause: String = format!("CU context {:?} still has {} references", handle, ref_cnt);
            error!("free_cu_ctx(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        if let Some(list) = self.owner_list_mut(owner) {
            list.retain(|h| *h != handle);
        }
        let _ = self.cu_ctxs.free(handle);
        Ok(())
    }

    pub fn cu_ctx(&self, handle: CuCtxHandle) -> Option<&CuCtx> {
        self.cu_ctxs.get(handle)
    }

    pub(crate) fn cu_ctx_mut(&mut self, handle: CuCtxHandle) -> Option<&mut CuCtx> {
        self.cu_ctxs.get_mut(handle)
    }

    /// Handles of every CU-Context of the client.
    pub fn cu_ctx_handles(&self) -> Vec<CuCtxHandle> {
        self.cu_ctxs.handles()
    }

    //==================================================================================================================
    // Hardware Contexts
    //==================================================================================================================

    /// Creates a hardware context under the context of `xclbin_id`, which must exist.
    pub(crate) fn alloc_hw_ctx(&mut self, xclbin_id: XclbinId, slot_idx: u32) -> Result<HwCtxId, Fail> {
        let id: HwCtxId = HwCtxId(self.next_hw_ctx_id);
        match self.contexts.iter_mut().find(|ctx| ctx.xclbin_id == xclbin_id) {
            Some(ctx) => ctx.hw_ctxs.push(id),
            None => {
                let cause: String = format!("no context on xclbin {}", xclbin_id);
                error!("alloc_hw_ctx(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        }
        self.next_hw_ctx_id += 1;
        self.hw_ctxs.push(HwCtx {
            id,
            xclbin_id,
            slot_idx,
            cu_ctxs: Vec::new(),
            graph_ctxs: Vec::new(),
        });
        Ok(id)
    }

    pub fn hw_ctx(&self, id: HwCtxId) -> Option<&HwCtx> {
        self.hw_ctxs.iter().find(|hw_ctx| hw_ctx.id == id)
    }

    pub fn hw_ctx_ids(&self) -> Vec<HwCtxId> {
        self.hw_ctxs.iter().map(|hw_ctx| hw_ctx.id).collect()
    }

    /// Destroys a hardware context with no CU or graph context left under it.
    pub(crate) fn free_hw_ctx(&mut self, id: HwCtxId) -> Result<HwCtx, Fail> {
        let pos: usize = match self.hw_ctxs.iter().position(|hw_ctx| hw_ctx.id == id) {
            Some(pos) => pos,
            None => {
                let cause: String = format!("no hardware context {}", id);
                error!("free_hw_ctx(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let hw_ctx: &HwCtx = &self.hw_ctxs[pos];
        if !hw_ctx.cu_ctxs.is_empty() || !hw_ctx.graph_ctxs.is_empty() {
            let cause: String = format!(
                "hardware context {} still has {} CU contexts and {} graph contexts",
                id,
                hw_ctx.cu_ctxs.len(),
                hw_ctx.graph_ctxs.len()
            );
            error!("free_hw_ctx(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        let hw_ctx: HwCtx = self.hw_ctxs.remove(pos);
        if let Some(ctx) = self.contexts.iter_mut().find(|ctx| ctx.xclbin_id == hw_ctx.xclbin_id) {
            ctx.hw_ctxs.retain(|h| *h != id);
        }
        Ok(hw_ctx)
    }

    pub(crate) fn open_graph_ctx(&mut self, id: HwCtxId, graph_id: u32, access: CuAccess) -> Result<(), Fail> {
        let hw_ctx: &mut HwCtx = self.hw_ctx_mut(id, "open_graph_ctx")?;
        if hw_ctx.graph_ctxs.iter().any(|g| g.graph_id == graph_id) {
            let cause: String = format!("graph {} already open in hardware context {}", graph_id, id);
            error!("open_graph_ctx(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        hw_ctx.graph_ctxs.push(GraphCtx { graph_id, access });
        Ok(())
    }

    pub(crate) fn close_graph_ctx(&mut self, id: HwCtxId, graph_id: u32) -> Result<(), Fail> {
        let hw_ctx: &mut HwCtx = self.hw_ctx_mut(id, "close_graph_ctx")?;
        match hw_ctx.graph_ctxs.iter().position(|g| g.graph_id == graph_id) {
            Some(pos) => {
                hw_ctx.graph_ctxs.remove(pos);
                Ok(())
            },
            None => {
                let cause: String = format!("graph {} is not open in hardware context {}", graph_id, id);
                error!("close_graph_ctx(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Graph ids opened under a hardware context.
    pub fn graph_ids(&self, id: HwCtxId) -> Vec<u32> {
        match self.hw_ctx(id) {
            Some(hw_ctx) => hw_ctx.graph_ctxs.iter().map(|g| g.graph_id).collect(),
            None => Vec::new(),
        }
    }

    //==================================================================================================================
    // Reservations
    //==================================================================================================================

    pub fn virt_cu_ref(&self) -> u32 {
        self.virt_cu_ref
    }

    pub(crate) fn get_virt_cu(&mut self) {
        self.virt_cu_ref += 1;
    }

    pub(crate) fn put_virt_cu(&mut self) {
        self.virt_cu_ref = self.virt_cu_ref.saturating_sub(1);
    }

    /// Whether a legacy context of the client reserves a CU.
    pub fn is_reserved(&self, domain: CuDomain, idx: u32) -> bool {
        let (word, bit): (usize, u32) = (idx as usize / 32, idx % 32);
        match self.cu_bitmap[domain as usize].get(word) {
            Some(w) => w & (1 << bit) != 0,
            None => false,
        }
    }

    /// Recomputes the reservation bit of a CU from the open legacy CU-Contexts.
    pub(crate) fn sync_reservation(&mut self, domain: CuDomain, idx: u32) {
        let (word, bit): (usize, u32) = (idx as usize / 32, idx % 32);
        let held: bool = self.cu_ctxs.iter().any(|cu_ctx| {
            matches!(cu_ctx.owner, CuCtxOwner::Context(_))
                && cu_ctx.ref_cnt > 0
                && cu_ctx.info.cu_idx == idx
                && cu_ctx.info.domain == domain
        });
        if let Some(w) = self.cu_bitmap[domain as usize].get_mut(word) {
            if held {
                *w |= 1 << bit;
            } else {
                *w &= !(1 << bit);
            }
        }
    }

    /// Whether the client may run commands on a CU, through a hardware context or through its legacy contexts.
    pub fn holds_cu(&self, hw_ctx: Option<HwCtxId>, domain: CuDomain, idx: u32) -> bool {
        match hw_ctx {
            None => self.is_reserved(domain, idx),
            Some(id) => match self.hw_ctx(id) {
                Some(hw_ctx) => hw_ctx.cu_ctxs.iter().any(|handle| match self.cu_ctxs.get(*handle) {
                    Some(cu_ctx) => cu_ctx.ref_cnt > 0 && cu_ctx.info.cu_idx == idx && cu_ctx.info.domain == domain,
                    None => false,
                }),
                None => false,
            },
        }
    }

    /// Keeps the candidates the client holds, in candidate order.
    pub fn filter_by_context(&self, hw_ctx: Option<HwCtxId>, domain: CuDomain, candidates: &[u32]) -> CuList {
        candidates
            .iter()
            .copied()
            .filter(|idx| self.holds_cu(hw_ctx, domain, *idx))
            .collect()
    }

    fn hw_ctx_mut(&mut self, id: HwCtxId, caller: &str) -> Result<&mut HwCtx, Fail> {
        match self.hw_ctxs.iter_mut().find(|hw_ctx| hw_ctx.id == id) {
            Some(hw_ctx) => Ok(hw_ctx),
            None => {
                let cause: String = format!("no hardware context {}", id);
                error!("{}(): {}", caller, cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    fn owner_list(&self, owner: CuCtxOwner) -> Option<&Vec<CuCtxHandle>> {
        match owner {
            CuCtxOwner::Context(xclbin_id) => self.context(xclbin_id).map(|ctx| &ctx.cu_ctxs),
            CuCtxOwner::HwContext(id) => self.hw_ctx(id).map(|hw_ctx| &hw_ctx.cu_ctxs),
        }
    }

    fn owner_list_mut(&mut self, owner: CuCtxOwner) -> Option<&mut Vec<CuCtxHandle>> {
        match owner {
            CuCtxOwner::Context(xclbin_id) => self
                .contexts
                .iter_mut()
                .find(|ctx| ctx.xclbin_id == xclbin_id)
                .map(|ctx| &mut ctx.cu_ctxs),
            CuCtxOwner::HwContext(id) => self
                .hw_ctxs
                .iter_mut()
                .find(|hw_ctx| hw_ctx.id == id)
                .map(|hw_ctx| &mut hw_ctx.cu_ctxs),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for HwCtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hwctx#{}", self.0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
