// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    client::Client,
    command::{
        CmdOp,
        Command,
        CommandId,
        CuList,
        KdsStatus,
    },
    context::{
        ClientInner,
        CuAccess,
        CuCtxHandle,
        CuCtxInfo,
        CuCtxOwner,
        HwCtx,
        HwCtxId,
    },
    cu::{
        Cu,
        CuDomain,
        CuDriver,
        CuHealth,
        CuMgmt,
    },
    kds::{
        config::Config,
        offload::{
            CopyEngine,
            ErtSubmitter,
        },
        options::SchedOptions,
    },
    runtime::{
        fail::Fail,
        logging,
    },
    slot::{
        SlotTable,
        XclbinId,
    },
};
use ::std::{
    fmt::Write,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Kernel Driver Scheduler
///
/// One scheduler serves one device. Lock order is client lock, then slot table, then CU table. CU pending queues
/// are only touched while holding none of them.
pub struct Scheduler {
    opts: SchedOptions,
    /// Programmable logic CUs.
    cu_mgmt: CuMgmt,
    /// Soft kernel CUs.
    scu_mgmt: CuMgmt,
    slots: SlotTable,
    clients: Mutex<Vec<Arc<Client>>>,
    next_client_id: AtomicU32,
    /// Set once a CU hangs. Read without synchronization: a client racing the flag may send one more command that
    /// ends up timing out.
    bad_state: AtomicBool,
    echo: AtomicBool,
    ert: Option<Arc<dyn ErtSubmitter>>,
    copy_engine: Option<Arc<dyn CopyEngine>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    pub fn new(opts: SchedOptions) -> Self {
        logging::initialize();
        Self {
            opts,
            cu_mgmt: CuMgmt::new(CuDomain::Pl),
            scu_mgmt: CuMgmt::new(CuDomain::Ps),
            slots: SlotTable::new(),
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU32::new(1),
            bad_state: AtomicBool::new(false),
            echo: AtomicBool::new(opts.echo),
            ert: None,
            copy_engine: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self::new(SchedOptions::from_config(config)?))
    }

    /// Attaches an embedded command queue.
    pub fn with_ert(mut self, ert: Arc<dyn ErtSubmitter>) -> Self {
        self.ert = Some(ert);
        self
    }

    /// Attaches the engine that runs copy commands.
    pub fn with_copy_engine(mut self, engine: Arc<dyn CopyEngine>) -> Self {
        self.copy_engine = Some(engine);
        self
    }

    pub fn options(&self) -> &SchedOptions {
        &self.opts
    }

    /// CU table of a domain.
    pub fn mgmt(&self, domain: CuDomain) -> &CuMgmt {
        match domain {
            CuDomain::Pl => &self.cu_mgmt,
            CuDomain::Ps => &self.scu_mgmt,
        }
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    //==================================================================================================================
    // Device Setup
    //==================================================================================================================

    /// Registers a CU and starts its worker. Returns its index in its domain.
    pub fn add_cu(&self, driver: Arc<dyn CuDriver>) -> Result<u32, Fail> {
        let domain: CuDomain = driver.info().domain;
        let cu: Arc<Cu> = Arc::new(Cu::new(driver, self.opts.cu_options())?);
        self.mgmt(domain).add_cu(cu)
    }

    /// Unregisters a CU and stops its worker. No command may be in flight on it.
    pub fn remove_cu(&self, driver: &Arc<dyn CuDriver>) -> Result<(), Fail> {
        let cu: Arc<Cu> = self.mgmt(driver.info().domain).remove_cu(driver)?;
        cu.stop();
        Ok(())
    }

    /// Fixes the order of programmable logic CU indices. Ignored until the last client leaves once done.
    pub fn configure(&self, addrs: &[u64]) -> Result<(), Fail> {
        self.cu_mgmt.configure(addrs)
    }

    pub fn load_xclbin(&self, slot_idx: u32, xclbin_id: XclbinId) -> Result<(), Fail> {
        self.slots.load(slot_idx, xclbin_id)
    }

    pub fn unload_xclbin(&self, slot_idx: u32) -> Result<(), Fail> {
        self.slots.unload(slot_idx)
    }

    //==================================================================================================================
    // Client Registry
    //==================================================================================================================

    /// Connects a new client.
    pub fn register_client(&self, pid: u32) -> Arc<Client> {
        let id: u32 = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client: Arc<Client> = Arc::new(Client::new(id, pid));
        self.lock_clients().push(client.clone());
        debug!("register_client(): {} (pid {})", client.id(), pid);
        client
    }

    /// Disconnects a client that has released everything. The last client to leave allows CUs to be reordered.
    pub fn unregister_client(&self, client: &Arc<Client>) -> Result<(), Fail> {
        if client.lock_inner().has_open_contexts() {
            let cause: String = format!("{} still has open contexts", client.id());
            error!("unregister_client(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }

        let mut clients: MutexGuard<'_, Vec<Arc<Client>>> = self.lock_clients();
        let pos: usize = match clients.iter().position(|c| c.id() == client.id()) {
            Some(pos) => pos,
            None => {
                let cause: String = format!("{} is not registered", client.id());
                error!("unregister_client(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };
        clients.remove(pos);
        if clients.is_empty() {
            self.cu_mgmt.reset_configured();
            self.scu_mgmt.reset_configured();
            debug!("unregister_client(): last client left, CU order released");
        }
        Ok(())
    }

    /// Tears down everything a client holds, draining its commands, then disconnects it.
    pub fn fini_client(&self, client: &Arc<Client>) -> Result<(), Fail> {
        {
            let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
            for handle in inner.cu_ctx_handles() {
                while inner.cu_ctx(handle).map_or(0, |cu_ctx| cu_ctx.ref_cnt()) > 0 {
                    self.del_context(client, &mut inner, handle)?;
                }
                inner.free_cu_ctx(handle)?;
            }
            for id in inner.hw_ctx_ids() {
                for graph_id in inner.graph_ids(id) {
                    inner.close_graph_ctx(id, graph_id)?;
                }
                self.release_hw_ctx(&mut inner, id)?;
            }
            let xclbin_ids: Vec<XclbinId> = inner.contexts().iter().map(|ctx| ctx.xclbin_id()).collect();
            for xclbin_id in xclbin_ids {
                self.drop_context_if_idle(&mut inner, xclbin_id);
            }
        }
        self.unregister_client(client)
    }

    pub fn live_client_count(&self) -> usize {
        self.lock_clients().len()
    }

    pub fn client_pids(&self) -> Vec<u32> {
        self.lock_clients().iter().map(|c| c.pid()).collect()
    }

    //==================================================================================================================
    // Legacy Contexts
    //==================================================================================================================

    /// Opens a CU (or the virtual CU) under the client's context on `xclbin_id`, creating the context and pinning
    /// the bitstream on first use.
    pub fn open_context(
        &self,
        client: &Arc<Client>,
        xclbin_id: XclbinId,
        info: CuCtxInfo,
    ) -> Result<CuCtxHandle, Fail> {
        let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        if inner.context(xclbin_id).is_none() {
            let slot_idx: u32 = self.slots.lock(xclbin_id)?;
            inner.insert_context(xclbin_id, slot_idx);
        }

        let owner: CuCtxOwner = CuCtxOwner::Context(xclbin_id);
        let result: Result<CuCtxHandle, Fail> = self.open_cu_ctx_locked(client, &mut inner, owner, info);
        if result.is_err() {
            self.drop_context_if_idle(&mut inner, xclbin_id);
        }
        result
    }

    /// Drops one reference on a CU-Context, draining the client's commands from the CU on the last one. Contexts
    /// left empty are destroyed and their bitstream unpinned.
    pub fn close_context(&self, client: &Arc<Client>, handle: CuCtxHandle) -> Result<(), Fail> {
        let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        let owner: CuCtxOwner = match inner.cu_ctx(handle) {
            Some(cu_ctx) => cu_ctx.owner(),
            None => {
                let cause: String = format!("stale CU context handle {:?}", handle);
                error!("close_context(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };

        self.del_context(client, &mut inner, handle)?;
        if inner.cu_ctx(handle).map_or(0, |cu_ctx| cu_ctx.ref_cnt()) == 0 {
            inner.free_cu_ctx(handle)?;
            if let CuCtxOwner::Context(xclbin_id) = owner {
                self.drop_context_if_idle(&mut inner, xclbin_id);
            }
        }
        Ok(())
    }

    /// Whether a CU-Context handle still grants access.
    pub fn is_context_open(&self, client: &Arc<Client>, handle: CuCtxHandle) -> bool {
        client.lock_inner().cu_ctx(handle).map_or(false, |cu_ctx| cu_ctx.ref_cnt() > 0)
    }

    //==================================================================================================================
    // Hardware Contexts
    //==================================================================================================================

    /// Opens a hardware context on the bitstream `xclbin_id` loaded in `slot_idx`.
    pub fn create_hw_ctx(&self, client: &Arc<Client>, slot_idx: u32, xclbin_id: XclbinId) -> Result<HwCtxId, Fail> {
        let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        self.slots.lock_slot(slot_idx, xclbin_id)?;
        if inner.context(xclbin_id).is_none() {
            match self.slots.lock_slot(slot_idx, xclbin_id) {
                Ok(()) => {
                    inner.insert_context(xclbin_id, slot_idx);
                },
                Err(e) => {
                    let _ = self.slots.unlock(slot_idx, xclbin_id);
                    return Err(e);
                },
            }
        }

        match inner.alloc_hw_ctx(xclbin_id, slot_idx) {
            Ok(id) => {
                debug!("create_hw_ctx(): {} opened {} on slot {}", client.id(), id, slot_idx);
                Ok(id)
            },
            Err(e) => {
                let _ = self.slots.unlock(slot_idx, xclbin_id);
                self.drop_context_if_idle(&mut inner, xclbin_id);
                Err(e)
            },
        }
    }

    /// Closes a hardware context with no CU or graph context left under it.
    pub fn destroy_hw_ctx(&self, client: &Arc<Client>, id: HwCtxId) -> Result<(), Fail> {
        let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        self.release_hw_ctx(&mut inner, id)
    }

    /// Opens a CU under a hardware context.
    pub fn open_cu_ctx(&self, client: &Arc<Client>, hw_ctx: HwCtxId, info: CuCtxInfo) -> Result<CuCtxHandle, Fail> {
        let mut inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        self.open_cu_ctx_locked(client, &mut inner, CuCtxOwner::HwContext(hw_ctx), info)
    }

    /// Opens a CU of the hardware context's slot by its `kernel:instance` name.
    pub fn open_cu_ctx_by_name(
        &self,
        client: &Arc<Client>,
        hw_ctx: HwCtxId,
        name: &str,
        access: CuAccess,
    ) -> Result<CuCtxHandle, Fail> {
        let slot_idx: u32 = match client.lock_inner().hw_ctx(hw_ctx) {
            Some(ctx) => ctx.slot_idx(),
            None => {
                let cause: String = format!("no hardware context {}", hw_ctx);
                error!("open_cu_ctx_by_name(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let info: CuCtxInfo = if let Some(idx) = self.cu_mgmt.find_by_name(slot_idx, name) {
            CuCtxInfo::new(idx, CuDomain::Pl, access)
        } else if let Some(idx) = self.scu_mgmt.find_by_name(slot_idx, name) {
            CuCtxInfo::new(idx, CuDomain::Ps, access)
        } else {
            let cause: String = format!("no CU named {} in slot {}", name, slot_idx);
            error!("open_cu_ctx_by_name(): {}", cause);
            return Err(Fail::new(libc::ENOENT, &cause));
        };
        self.open_cu_ctx(client, hw_ctx, info)
    }

    pub fn open_graph_ctx(
        &self,
        client: &Arc<Client>,
        hw_ctx: HwCtxId,
        graph_id: u32,
        access: CuAccess,
    ) -> Result<(), Fail> {
        client.lock_inner().open_graph_ctx(hw_ctx, graph_id, access)
    }

    pub fn close_graph_ctx(&self, client: &Arc<Client>, hw_ctx: HwCtxId, graph_id: u32) -> Result<(), Fail> {
        client.lock_inner().close_graph_ctx(hw_ctx, graph_id)
    }

    //==================================================================================================================
    // Commands
    //==================================================================================================================

    /// Accepts a command from `client`. Every outcome, success or not, is reported through the command callbacks.
    pub fn submit(&self, client: &Arc<Client>, mut cmd: Command) {
        cmd.bind(client.clone());
        let status: Option<KdsStatus> = match cmd.op() {
            CmdOp::Configure(addrs) => Some(match self.configure(addrs) {
                Ok(()) => KdsStatus::Completed,
                Err(_) => KdsStatus::Error,
            }),
            CmdOp::Abort { target } => Some(self.abort_pending(client, *target)),
            CmdOp::Copy { src, dst, size } => Some(self.copy(*src, *dst, *size)),
            CmdOp::Start { .. } | CmdOp::SkStart { .. } => None,
        };
        match status {
            Some(status) => cmd.complete(status),
            None => self.dispatch(client, cmd),
        }
    }

    /// Routes a start command to one CU.
    fn dispatch(&self, client: &Arc<Client>, mut cmd: Command) {
        if self.bad_state() {
            warn!("dispatch(): device in bad state, {:?} times out", cmd.id());
            cmd.complete(KdsStatus::Timeout);
            return;
        }

        let domain: CuDomain = match cmd.op() {
            CmdOp::SkStart { .. } => CuDomain::Ps,
            _ => CuDomain::Pl,
        };
        let candidates: CuList = match cmd.cu_mask() {
            Some(mask) => mask.resolve_candidates(),
            None => CuList::new(),
        };
        if candidates.is_empty() {
            error!("dispatch(): {:?} names no CU", cmd.id());
            cmd.complete(KdsStatus::Error);
            return;
        }

        // Held until the command sits in the CU's pending queue: a close of the same client either drains it or has
        // already released the CU.
        let inner: MutexGuard<'_, ClientInner> = client.lock_inner();
        let valid: CuList = inner.filter_by_context(cmd.hw_ctx(), domain, &candidates);
        if valid.is_empty() {
            drop(inner);
            error!("dispatch(): {:?} from {} is out of context ({:?})", cmd.id(), client.id(), candidates);
            cmd.complete(KdsStatus::Error);
            return;
        }

        if self.echo() {
            drop(inner);
            cmd.complete(KdsStatus::Completed);
            return;
        }

        if self.opts.ert {
            if let Some(ert) = self.ert.as_ref() {
                drop(inner);
                cmd.set_status(KdsStatus::Queued);
                ert.submit(cmd);
                return;
            }
        }

        let (idx, cu): (u32, Arc<Cu>) = match self.mgmt(domain).select(&valid) {
            Some(selected) => selected,
            None => {
                drop(inner);
                error!("dispatch(): none of {:?} is registered", valid);
                cmd.complete(KdsStatus::Error);
                return;
            },
        };
        trace!("dispatch(): {:?} -> {:?} CU {}", cmd.id(), domain, idx);
        cmd.set_cu(domain, idx);
        cmd.set_status(KdsStatus::Queued);
        cu.submit(cmd);
        drop(inner);
    }

    /// Takes `target` back from whichever CU still holds it unclaimed.
    fn abort_pending(&self, client: &Arc<Client>, target: CommandId) -> KdsStatus {
        let cus: Vec<(u32, Arc<Cu>)> = self.cu_mgmt.cus().into_iter().chain(self.scu_mgmt.cus()).collect();
        for (_, cu) in cus {
            if let Some(victim) = cu.remove_pending(target, client.id()) {
                victim.complete(KdsStatus::Aborted);
                return KdsStatus::Completed;
            }
        }
        warn!("abort_pending(): {:?} is not waiting on any CU", target);
        KdsStatus::Error
    }

    fn copy(&self, src: u64, dst: u64, size: u64) -> KdsStatus {
        match self.copy_engine.as_ref() {
            Some(engine) => match engine.copy(src, dst, size) {
                Ok(()) => KdsStatus::Completed,
                Err(e) => {
                    error!("copy(): {:?}", e);
                    KdsStatus::Error
                },
            },
            None => {
                error!("copy(): no copy engine attached");
                KdsStatus::Error
            },
        }
    }

    //==================================================================================================================
    // Administration
    //==================================================================================================================

    pub fn bad_state(&self) -> bool {
        self.bad_state.load(Ordering::Relaxed)
    }

    /// Clears the bad state after a device reset.
    pub fn reset_bad_state(&self) {
        info!("reset_bad_state(): device reset");
        self.bad_state.store(false, Ordering::Relaxed);
    }

    pub fn echo(&self) -> bool {
        self.echo.load(Ordering::Relaxed)
    }

    /// Toggles echo mode. Only allowed while no client is connected.
    pub fn set_echo(&self, echo: bool) -> Result<(), Fail> {
        let clients: MutexGuard<'_, Vec<Arc<Client>>> = self.lock_clients();
        if !clients.is_empty() {
            let cause: String = format!("{} clients connected", clients.len());
            error!("set_echo(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        self.echo.store(echo, Ordering::Relaxed);
        info!("set_echo(): echo mode {}", if echo { "on" } else { "off" });
        Ok(())
    }

    /// CU table report of a domain.
    pub fn cu_stat(&self, domain: CuDomain) -> String {
        self.mgmt(domain).stat()
    }

    /// Connected clients report.
    pub fn client_stat(&self) -> String {
        let pids: Vec<u32> = self.client_pids();
        let mut out: String = format!("clients: {}\n", pids.len());
        for pid in pids {
            let _ = writeln!(out, "pid: {}", pid);
        }
        out
    }

    /// Stops every CU worker. Only allowed once every client is gone.
    pub fn fini(&self) -> Result<(), Fail> {
        let count: usize = self.live_client_count();
        if count > 0 {
            let cause: String = format!("{} clients still connected", count);
            error!("fini(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        for (_, cu) in self.cu_mgmt.cus().into_iter().chain(self.scu_mgmt.cus()) {
            cu.stop();
        }
        Ok(())
    }

    //==================================================================================================================
    // Helpers
    //==================================================================================================================

    fn lock_clients(&self) -> MutexGuard<'_, Vec<Arc<Client>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Finds or creates the CU-Context for `info` under `owner` and takes a reference on it. Nothing changes on
    /// failure.
    fn open_cu_ctx_locked(
        &self,
        client: &Arc<Client>,
        inner: &mut ClientInner,
        owner: CuCtxOwner,
        info: CuCtxInfo,
    ) -> Result<CuCtxHandle, Fail> {
        let handle: CuCtxHandle = inner.alloc_cu_ctx(owner, info)?;
        let existing: Option<CuAccess> = inner
            .cu_ctx(handle)
            .filter(|cu_ctx| cu_ctx.ref_cnt() > 0)
            .map(|cu_ctx| cu_ctx.info().access);
        if let Some(access) = existing {
            if access != info.access {
                let cause: String = format!("CU {} already opened with {:?} access", info.cu_idx, access);
                error!("open_cu_ctx(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            }
        }

        if let Err(e) = self.add_context(client, inner, handle) {
            if existing.is_none() {
                let _ = inner.free_cu_ctx(handle);
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Takes one reference on a CU-Context. The first one claims the CU in its table.
    fn add_context(&self, client: &Arc<Client>, inner: &mut ClientInner, handle: CuCtxHandle) -> Result<(), Fail> {
        let (info, ref_cnt, owner): (CuCtxInfo, u32, CuCtxOwner) = match inner.cu_ctx(handle) {
            Some(cu_ctx) => (*cu_ctx.info(), cu_ctx.ref_cnt(), cu_ctx.owner()),
            None => return Err(Fail::new(libc::EINVAL, "stale CU context handle")),
        };

        if info.is_virtual() {
            inner.get_virt_cu();
        } else if ref_cnt == 0 {
            self.mgmt(info.domain).acquire(info.cu_idx, info.access)?;
        }
        if let Some(cu_ctx) = inner.cu_ctx_mut(handle) {
            cu_ctx.get();
        }
        if !info.is_virtual() && matches!(owner, CuCtxOwner::Context(_)) {
            inner.sync_reservation(info.domain, info.cu_idx);
        }
        trace!("add_context(): {} {:?} refs={}", client.id(), info, ref_cnt + 1);
        Ok(())
    }

    /// Drops one reference on a CU-Context. The last one drains the client's commands from the CU and releases the
    /// CU in its table.
    fn del_context(&self, client: &Arc<Client>, inner: &mut ClientInner, handle: CuCtxHandle) -> Result<(), Fail> {
        let (info, ref_cnt, owner): (CuCtxInfo, u32, CuCtxOwner) = match inner.cu_ctx(handle) {
            Some(cu_ctx) => (*cu_ctx.info(), cu_ctx.ref_cnt(), cu_ctx.owner()),
            None => return Err(Fail::new(libc::EINVAL, "stale CU context handle")),
        };
        if ref_cnt == 0 {
            let cause: String = format!("CU {} is not open", info.cu_idx);
            error!("del_context(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        if info.is_virtual() {
            inner.put_virt_cu();
        } else if ref_cnt == 1 {
            if client.outstanding(info.domain, info.cu_idx) > 0 {
                self.abort_cu(client, info.domain, info.cu_idx);
            }
            self.mgmt(info.domain).release(info.cu_idx, info.access)?;
        }
        if let Some(cu_ctx) = inner.cu_ctx_mut(handle) {
            cu_ctx.put();
        }
        if !info.is_virtual() && matches!(owner, CuCtxOwner::Context(_)) {
            inner.sync_reservation(info.domain, info.cu_idx);
        }
        trace!("del_context(): {} {:?} refs={}", client.id(), info, ref_cnt - 1);
        Ok(())
    }

    /// Drains every command of `client` from a CU. Marks the device bad if the CU does not come back healthy.
    fn abort_cu(&self, client: &Arc<Client>, domain: CuDomain, idx: u32) {
        let cu: Arc<Cu> = match self.mgmt(domain).get(idx) {
            Some(cu) => cu,
            None => return,
        };
        info!("abort_cu(): draining {} from {:?} CU {}", client.id(), domain, idx);

        let mut requested: bool = false;
        for _ in 0..self.opts.abort_max_polls {
            match cu.abort(client.id()) {
                Ok(()) => {
                    requested = true;
                    break;
                },
                Err(e) if e.would_block() => thread::sleep(self.opts.abort_retry_interval),
                Err(e) => {
                    error!("abort_cu(): CU {} refused the abort ({:?})", idx, e);
                    break;
                },
            }
        }

        let mut health: Option<CuHealth> = None;
        if requested {
            for _ in 0..self.opts.abort_max_polls {
                if let Some(h) = cu.abort_done(client.id()) {
                    health = Some(h);
                    break;
                }
                thread::sleep(self.opts.abort_poll_interval);
            }
            if health.is_none() {
                cu.forget_abort(client.id());
            }
        }

        match health {
            Some(CuHealth::Healthy) => debug!("abort_cu(): {:?} CU {} drained", domain, idx),
            _ => {
                error!("abort_cu(): {:?} CU {} is hung, device needs a reset", domain, idx);
                self.bad_state.store(true, Ordering::Relaxed);
                cu.set_bad_state();
            },
        }
    }

    /// Destroys a hardware context and unpins its bitstream.
    fn release_hw_ctx(&self, inner: &mut ClientInner, id: HwCtxId) -> Result<(), Fail> {
        let hw_ctx: HwCtx = inner.free_hw_ctx(id)?;
        let xclbin_id: XclbinId = hw_ctx.xclbin_id();
        if let Err(e) = self.slots.unlock(hw_ctx.slot_idx(), xclbin_id) {
            warn!("release_hw_ctx(): {:?}", e);
        }
        self.drop_context_if_idle(inner, xclbin_id);
        Ok(())
    }

    /// Destroys the context on `xclbin_id` if nothing is attached to it anymore, unpinning its bitstream.
    fn drop_context_if_idle(&self, inner: &mut ClientInner, xclbin_id: XclbinId) {
        if !inner.context(xclbin_id).map_or(false, |ctx| ctx.is_idle()) {
            return;
        }
        if let Ok(ctx) = inner.remove_context(xclbin_id) {
            if let Err(e) = self.slots.unlock(ctx.slot_idx(), xclbin_id) {
                warn!("drop_context_if_idle(): {:?}", e);
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
