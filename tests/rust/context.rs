// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::kds::{
    cu::CU_EXCLUSIVE,
    sim::SimCu,
    Client,
    CuAccess,
    CuCtxHandle,
    CuCtxInfo,
    CuDomain,
    CuInfo,
    HwCtxId,
    Scheduler,
    XclbinId,
    CU_VIRTUAL,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
};
use common::{
    add_configured_cus,
    add_sim_cus,
    fast_options,
    scheduler,
    XCLBIN,
};

//==============================================================================
// Helpers
//==============================================================================

fn shared(idx: u32) -> CuCtxInfo {
    CuCtxInfo::new(idx, CuDomain::Pl, CuAccess::Shared)
}

fn exclusive(idx: u32) -> CuCtxInfo {
    CuCtxInfo::new(idx, CuDomain::Pl, CuAccess::Exclusive)
}

fn refs(sched: &Scheduler, idx: u32) -> u32 {
    sched.mgmt(CuDomain::Pl).refs(idx)
}

//==============================================================================
// Tests
//==============================================================================

#[test]
fn shared_holders_block_exclusive() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 4);
    let a: Arc<Client> = sched.register_client(100);
    let b: Arc<Client> = sched.register_client(101);
    let c: Arc<Client> = sched.register_client(102);

    sched.open_context(&a, XCLBIN, shared(3))?;
    sched.open_context(&b, XCLBIN, shared(3))?;
    if refs(&sched, 3) != 2 {
        anyhow::bail!("two shared holders expected, refs={:#x}", refs(&sched, 3));
    }
    match sched.open_context(&c, XCLBIN, exclusive(3)) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("exclusive open should fail with EBUSY, got {:?}", other),
    }
    if refs(&sched, 3) & CU_EXCLUSIVE != 0 || c.has_open_contexts() {
        anyhow::bail!("rejected open must not change anything");
    }
    Ok(())
}

#[test]
fn exclusive_holder_blocks_shared() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 6);
    let a: Arc<Client> = sched.register_client(100);
    let b: Arc<Client> = sched.register_client(101);

    let handle: CuCtxHandle = sched.open_context(&a, XCLBIN, exclusive(5))?;
    if refs(&sched, 5) != CU_EXCLUSIVE {
        anyhow::bail!("exclusive bit expected, refs={:#x}", refs(&sched, 5));
    }
    match sched.open_context(&b, XCLBIN, shared(5)) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("shared open should fail with EBUSY, got {:?}", other),
    }

    sched.close_context(&a, handle)?;
    if refs(&sched, 5) != 0 {
        anyhow::bail!("CU 5 should be free again");
    }
    sched.open_context(&b, XCLBIN, shared(5))?;
    Ok(())
}

#[test]
fn concurrent_opens_keep_exclusion() -> Result<()> {
    const NTHREADS: u64 = 8;
    const ROUNDS: usize = 200;
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 1);

    // Watches the reference word while the workers fight over the CU.
    let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let sampler: thread::JoinHandle<Result<()>> = {
        let sched: Arc<Scheduler> = sched.clone();
        let stop: Arc<AtomicBool> = stop.clone();
        thread::spawn(move || -> Result<()> {
            while !stop.load(Ordering::Acquire) {
                let word: u32 = refs(&sched, 0);
                if word & CU_EXCLUSIVE != 0 && word != CU_EXCLUSIVE {
                    anyhow::bail!("exclusive bit next to shared holders: {:#x}", word);
                }
                thread::yield_now();
            }
            Ok(())
        })
    };

    let mut workers: Vec<thread::JoinHandle<Result<()>>> = Vec::new();
    for seed in 0..NTHREADS {
        let sched: Arc<Scheduler> = sched.clone();
        workers.push(thread::spawn(move || -> Result<()> {
            let client: Arc<Client> = sched.register_client(200 + seed as u32);
            let mut rng: SmallRng = SmallRng::seed_from_u64(seed);
            for _ in 0..ROUNDS {
                let wants_exclusive: bool = rng.gen_bool(0.25);
                let info: CuCtxInfo = if wants_exclusive { exclusive(0) } else { shared(0) };
                let handle: CuCtxHandle = match sched.open_context(&client, XCLBIN, info) {
                    Ok(handle) => handle,
                    Err(e) if e.is_busy() => continue,
                    Err(e) => anyhow::bail!("open failed: {:?}", e),
                };
                let word: u32 = refs(&sched, 0);
                let consistent: bool = if wants_exclusive {
                    word == CU_EXCLUSIVE
                } else {
                    word & CU_EXCLUSIVE == 0 && word != 0
                };
                if !consistent {
                    anyhow::bail!("holder of {:?} sees refs={:#x}", info.access, word);
                }
                sched.close_context(&client, handle)?;
            }
            sched.unregister_client(&client)?;
            Ok(())
        }));
    }

    let mut failure: Option<anyhow::Error> = None;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => failure = Some(e),
            Err(_) => failure = Some(anyhow::anyhow!("worker panicked")),
        }
    }
    stop.store(true, Ordering::Release);
    match sampler.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("sampler panicked"),
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if refs(&sched, 0) != 0 || sched.live_client_count() != 0 {
        anyhow::bail!("every reference should be gone, refs={:#x}", refs(&sched, 0));
    }
    Ok(())
}

#[test]
fn open_close_is_symmetric() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 2);
    let other: Arc<Client> = sched.register_client(100);
    let client: Arc<Client> = sched.register_client(101);
    sched.open_context(&other, XCLBIN, shared(1))?;
    let before: u32 = refs(&sched, 1);

    let mut handles: Vec<CuCtxHandle> = Vec::new();
    for _ in 0..5 {
        handles.push(sched.open_context(&client, XCLBIN, shared(1))?);
    }
    if handles.iter().any(|h| *h != handles[0]) {
        anyhow::bail!("repeated opens should share one CU context");
    }
    if refs(&sched, 1) != before + 1 {
        anyhow::bail!("one table reference per CU context, refs={:#x}", refs(&sched, 1));
    }

    for (i, handle) in handles.iter().enumerate() {
        if !sched.is_context_open(&client, *handle) {
            anyhow::bail!("context should still be open before close #{}", i);
        }
        sched.close_context(&client, *handle)?;
    }
    if sched.is_context_open(&client, handles[0]) || refs(&sched, 1) != before {
        anyhow::bail!("reference word should be back to {:#x}, got {:#x}", before, refs(&sched, 1));
    }
    match sched.close_context(&client, handles[0]) {
        Err(e) if e.errno == libc::EINVAL => (),
        other => anyhow::bail!("closing a freed context should fail, got {:?}", other),
    }
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn context_open_validates_arguments() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 2);
    let client: Arc<Client> = sched.register_client(100);

    // Bitstream never loaded.
    match sched.open_context(&client, XclbinId::new([0xee; 16]), shared(0)) {
        Err(e) if e.errno == libc::ENOENT => (),
        other => anyhow::bail!("expected ENOENT, got {:?}", other),
    }
    // Out of range, and a hole in the table.
    for idx in [200, 9] {
        match sched.open_context(&client, XCLBIN, shared(idx)) {
            Err(e) if e.errno == libc::EINVAL => (),
            other => anyhow::bail!("CU {} should be rejected, got {:?}", idx, other),
        }
    }
    if sched.slots().refcnt(0) != 0 {
        anyhow::bail!("failed opens must not keep the bitstream pinned");
    }
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn virtual_cu_pins_bitstream() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let client: Arc<Client> = sched.register_client(100);

    match sched.open_context(&client, XCLBIN, CuCtxInfo::new(CU_VIRTUAL, CuDomain::Pl, CuAccess::Exclusive)) {
        Err(e) if e.errno == libc::EINVAL => (),
        other => anyhow::bail!("exclusive virtual CU should fail with EINVAL, got {:?}", other),
    }

    let handle: CuCtxHandle = sched.open_context(&client, XCLBIN, CuCtxInfo::virtual_cu())?;
    if sched.unload_xclbin(0).is_ok() || sched.load_xclbin(0, XclbinId::new([1; 16])).is_ok() {
        anyhow::bail!("pinned bitstream must not be replaced");
    }
    match sched.unregister_client(&client) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("client with a virtual CU open must not leave, got {:?}", other),
    }
    sched.close_context(&client, handle)?;
    sched.unload_xclbin(0)?;
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn configure_orders_cus_by_address() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let addrs: [u64; 3] = [0x1000, 0x2000, 0x3000];
    add_sim_cus(&sched, &addrs, 7);
    let client: Arc<Client> = sched.register_client(100);

    sched.configure(&addrs)?;
    let addr_at = |idx: u32| sched.mgmt(CuDomain::Pl).get(idx).map(|cu| cu.info().addr);
    for (idx, addr) in addrs.iter().enumerate() {
        if addr_at(idx as u32) != Some(*addr) {
            anyhow::bail!("index {} should hold {:#x}, got {:?}", idx, addr, addr_at(idx as u32));
        }
    }

    // Identical or different input is ignored while configured.
    sched.configure(&addrs)?;
    sched.configure(&[0x3000, 0x2000, 0x1000])?;
    if addr_at(0) != Some(0x1000) || addr_at(2) != Some(0x3000) {
        anyhow::bail!("configure must be a no-op while configured");
    }

    // Once the last client left, the next bitstream may reorder.
    sched.unregister_client(&client)?;
    if sched.mgmt(CuDomain::Pl).is_configured() {
        anyhow::bail!("last client leaving should clear the configured flag");
    }
    sched.configure(&[0x3000, 0x2000, 0x1000])?;
    if addr_at(0) != Some(0x3000) || addr_at(2) != Some(0x1000) {
        anyhow::bail!("new order not applied");
    }
    Ok(())
}

#[test]
fn configure_refuses_held_cus() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let addrs: [u64; 3] = [0x1000, 0x2000, 0x3000];
    add_sim_cus(&sched, &addrs, 11);
    let client: Arc<Client> = sched.register_client(100);
    let before: Option<u64> = sched.mgmt(CuDomain::Pl).get(0).map(|cu| cu.info().addr);

    let handle: CuCtxHandle = sched.open_context(&client, XCLBIN, exclusive(0))?;
    match sched.configure(&addrs) {
        Err(e) if e.is_busy() => (),
        other => anyhow::bail!("configure under an open context should fail with EBUSY, got {:?}", other),
    }
    if sched.mgmt(CuDomain::Pl).get(0).map(|cu| cu.info().addr) != before || refs(&sched, 0) != CU_EXCLUSIVE {
        anyhow::bail!("refused configure must leave indices and references alone");
    }

    sched.close_context(&client, handle)?;
    if (0..3).any(|idx| refs(&sched, idx) != 0) || client.has_open_contexts() {
        anyhow::bail!("close should release the CU it opened");
    }
    sched.configure(&addrs)?;
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn teardown_requires_closed_contexts() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 4);
    let client: Arc<Client> = sched.register_client(100);
    sched.open_context(&client, XCLBIN, shared(0))?;
    sched.open_context(&client, XCLBIN, exclusive(1))?;
    sched.open_context(&client, XCLBIN, CuCtxInfo::virtual_cu())?;

    match sched.unregister_client(&client) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("expected EBUSY, got {:?}", other),
    }
    match sched.fini() {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("scheduler must not stop with clients, got {:?}", other),
    }

    sched.fini_client(&client)?;
    if sched.live_client_count() != 0 || refs(&sched, 0) != 0 || refs(&sched, 1) != 0 {
        anyhow::bail!("close-all should release every CU");
    }
    if sched.slots().refcnt(0) != 0 {
        anyhow::bail!("close-all should unpin the bitstream");
    }
    sched.fini()?;
    Ok(())
}

#[test]
fn hw_ctx_lifecycle() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 2);
    let soft: Arc<SimCu> = Arc::new(SimCu::new(CuInfo::new(0x9000, "sk", "sk_0").in_domain(CuDomain::Ps)));
    sched.add_cu(soft.clone())?;
    let client: Arc<Client> = sched.register_client(100);

    match sched.create_hw_ctx(&client, 1, XCLBIN) {
        Err(e) if e.errno == libc::ENOENT => (),
        other => anyhow::bail!("slot 1 holds nothing, got {:?}", other),
    }
    let hw: HwCtxId = sched.create_hw_ctx(&client, 0, XCLBIN)?;
    if sched.slots().refcnt(0) != 2 {
        anyhow::bail!("context and hardware context should each pin the slot");
    }

    let pl: CuCtxHandle = sched.open_cu_ctx_by_name(&client, hw, "vadd:vadd_2000", CuAccess::Exclusive)?;
    let ps: CuCtxHandle = sched.open_cu_ctx_by_name(&client, hw, "sk:sk_0", CuAccess::Shared)?;
    if refs(&sched, 1) != CU_EXCLUSIVE || sched.mgmt(CuDomain::Ps).refs(0) != 1 {
        anyhow::bail!("CUs found by name should be claimed in their own domain");
    }
    match sched.open_cu_ctx_by_name(&client, hw, "vadd:missing", CuAccess::Shared) {
        Err(e) if e.errno == libc::ENOENT => (),
        other => anyhow::bail!("expected ENOENT, got {:?}", other),
    }

    sched.open_graph_ctx(&client, hw, 3, CuAccess::Shared)?;
    match sched.destroy_hw_ctx(&client, hw) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("hardware context with CU contexts must not go, got {:?}", other),
    }
    sched.close_context(&client, pl)?;
    sched.close_context(&client, ps)?;
    match sched.destroy_hw_ctx(&client, hw) {
        Err(e) if e.errno == libc::EBUSY => (),
        other => anyhow::bail!("hardware context with a graph must not go, got {:?}", other),
    }
    sched.close_graph_ctx(&client, hw, 3)?;
    sched.destroy_hw_ctx(&client, hw)?;

    if sched.slots().refcnt(0) != 0 {
        anyhow::bail!("destroying the hardware context should unpin the slot");
    }
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn hw_ctx_pins_its_own_slot() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 1);
    sched.load_xclbin(1, XCLBIN)?;
    let client: Arc<Client> = sched.register_client(100);

    let hw: HwCtxId = sched.create_hw_ctx(&client, 1, XCLBIN)?;
    if sched.slots().refcnt(0) != 0 || sched.slots().refcnt(1) != 2 {
        anyhow::bail!(
            "pins should land on slot 1, got {} and {}",
            sched.slots().refcnt(0),
            sched.slots().refcnt(1)
        );
    }
    // Slot 0 is free to take another bitstream.
    sched.load_xclbin(0, XclbinId::new([0x5a; 16]))?;

    sched.destroy_hw_ctx(&client, hw)?;
    if sched.slots().refcnt(1) != 0 || client.has_open_contexts() {
        anyhow::bail!("destroying the hardware context should unpin slot 1");
    }
    sched.unload_xclbin(1)?;
    sched.unregister_client(&client)?;
    Ok(())
}

#[test]
fn fini_client_closes_hw_ctxs() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_configured_cus(&sched, 2);
    let client: Arc<Client> = sched.register_client(100);
    let hw: HwCtxId = sched.create_hw_ctx(&client, 0, XCLBIN)?;
    sched.open_cu_ctx(&client, hw, shared(0))?;
    sched.open_cu_ctx(&client, hw, shared(0))?;
    sched.open_graph_ctx(&client, hw, 1, CuAccess::Exclusive)?;

    sched.fini_client(&client)?;
    if refs(&sched, 0) != 0 || sched.slots().refcnt(0) != 0 || sched.live_client_count() != 0 {
        anyhow::bail!("close-all should release everything");
    }
    Ok(())
}
