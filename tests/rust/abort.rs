// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::Result;
use ::kds::{
    sim::SimCu,
    Client,
    CommandId,
    CuAccess,
    CuCtxHandle,
    CuCtxInfo,
    CuDomain,
    CuInfo,
    KdsStatus,
    SchedOptions,
    Scheduler,
};
use ::std::{
    sync::{
        Arc,
        Barrier,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};
use common::{
    add_configured_cus,
    fast_options,
    scheduler,
    start,
    Tracker,
    WAIT,
    XCLBIN,
};

//==============================================================================
// Helpers
//==============================================================================

fn open_shared(sched: &Scheduler, client: &Arc<Client>, idx: u32) -> Result<CuCtxHandle> {
    match sched.open_context(client, XCLBIN, CuCtxInfo::new(idx, CuDomain::Pl, CuAccess::Shared)) {
        Ok(handle) => Ok(handle),
        Err(e) => anyhow::bail!("open of CU {} failed: {:?}", idx, e),
    }
}

fn submit_n(sched: &Scheduler, client: &Arc<Client>, tracker: &Tracker, idx: u32, n: usize) -> Vec<CommandId> {
    (0..n)
        .map(|_| {
            let cmd = tracker.track(start(&[idx]));
            let id: CommandId = cmd.id();
            sched.submit(client, cmd);
            id
        })
        .collect()
}

/// Registers a slow CU without fixing the table order.
fn add_slow_cu(sched: &Scheduler, addr: u64, depth: u32, latency: Duration) -> Result<Arc<SimCu>> {
    let cu: Arc<SimCu> = Arc::new(
        SimCu::new(CuInfo::new(addr, "slow", &format!("slow_{:x}", addr)))
            .with_depth(depth)
            .with_latency(latency),
    );
    sched.add_cu(cu.clone())?;
    Ok(cu)
}

fn wait_started(cu: &SimCu, count: u64) -> bool {
    let deadline: Instant = Instant::now() + WAIT;
    while cu.started() < count {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

//==============================================================================
// Tests
//==============================================================================

#[test]
fn hung_cu_puts_device_in_bad_state() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let cus: Vec<Arc<SimCu>> = add_configured_cus(&sched, 2);
    let a: Arc<Client> = sched.register_client(100);
    let b: Arc<Client> = sched.register_client(101);
    let handle: CuCtxHandle = open_shared(&sched, &a, 0)?;
    open_shared(&sched, &b, 1)?;
    let tracker: Tracker = Tracker::new();

    cus[0].set_hang(true);
    let stuck: Vec<CommandId> = submit_n(&sched, &a, &tracker, 0, 2);
    if !wait_started(&cus[0], 2) {
        anyhow::bail!("commands never reached the CU");
    }

    // First request would block, the second goes through.
    cus[0].fail_aborts(1);
    sched.close_context(&a, handle)?;

    for id in &stuck {
        if tracker.status(*id) != Some(KdsStatus::Timeout) || tracker.freed(*id) != 1 {
            anyhow::bail!("{:?} should time out once, got {:?}", id, tracker.status(*id));
        }
    }
    if !sched.bad_state() || !cus[0].is_bad() || cus[0].aborts() != 1 {
        anyhow::bail!("hung CU should put the device in bad state");
    }
    if cus[0].free_credits() != 4 {
        anyhow::bail!("timed out commands must return their credits, {} free", cus[0].free_credits());
    }
    if sched.mgmt(CuDomain::Pl).refs(0) != 0 || a.has_open_contexts() {
        anyhow::bail!("the context must be released anyway");
    }

    // Nothing reaches a CU while the device is bad.
    let late: Vec<CommandId> = submit_n(&sched, &b, &tracker, 1, 1);
    if tracker.status(late[0]) != Some(KdsStatus::Timeout) || cus[1].started() != 0 {
        anyhow::bail!("commands must time out while the device is bad");
    }

    sched.reset_bad_state();
    let after: Vec<CommandId> = submit_n(&sched, &b, &tracker, 1, 1);
    if !tracker.wait_freed(4) || tracker.status(after[0]) != Some(KdsStatus::Completed) {
        anyhow::bail!("commands should run again after a reset");
    }
    Ok(())
}

#[test]
fn healthy_drain_aborts_unstarted_commands() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let cu: Arc<SimCu> = add_slow_cu(&sched, 0x1000, 1, Duration::from_millis(20))?;
    let client: Arc<Client> = sched.register_client(100);
    let handle: CuCtxHandle = open_shared(&sched, &client, 0)?;
    let tracker: Tracker = Tracker::new();

    let ids: Vec<CommandId> = submit_n(&sched, &client, &tracker, 0, 6);
    sched.close_context(&client, handle)?;
    if !tracker.wait_freed(ids.len()) {
        anyhow::bail!("drained commands were not released");
    }

    let mut aborted: usize = 0;
    for id in &ids {
        match tracker.status(*id) {
            Some(KdsStatus::Aborted) => aborted += 1,
            Some(KdsStatus::Completed) => (),
            other => anyhow::bail!("{:?} ended {:?}", id, other),
        }
        if tracker.freed(*id) != 1 {
            anyhow::bail!("{:?} released {} times", id, tracker.freed(*id));
        }
    }
    if aborted == 0 || cu.started() as usize + aborted != ids.len() {
        anyhow::bail!("unstarted commands should be aborted ({} aborted, {} started)", aborted, cu.started());
    }
    if sched.bad_state() || cu.is_bad() || cu.free_credits() != 1 {
        anyhow::bail!("a clean drain must leave the CU healthy");
    }
    Ok(())
}

#[test]
fn drain_spares_other_clients() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_slow_cu(&sched, 0x1000, 1, Duration::from_millis(2))?;
    let a: Arc<Client> = sched.register_client(100);
    let b: Arc<Client> = sched.register_client(101);
    let handle: CuCtxHandle = open_shared(&sched, &a, 0)?;
    open_shared(&sched, &b, 0)?;
    let tracker: Tracker = Tracker::new();

    let theirs: Vec<CommandId> = submit_n(&sched, &b, &tracker, 0, 3);
    let mine: Vec<CommandId> = submit_n(&sched, &a, &tracker, 0, 3);
    sched.close_context(&a, handle)?;
    if !tracker.wait_freed(6) {
        anyhow::bail!("commands were not released");
    }
    for id in &theirs {
        if tracker.status(*id) != Some(KdsStatus::Completed) {
            anyhow::bail!("{:?} of the other client ended {:?}", id, tracker.status(*id));
        }
    }
    for id in &mine {
        if !matches!(tracker.status(*id), Some(KdsStatus::Completed) | Some(KdsStatus::Aborted)) {
            anyhow::bail!("{:?} ended {:?}", id, tracker.status(*id));
        }
    }
    if sched.mgmt(CuDomain::Pl).refs(0) != 1 || sched.bad_state() {
        anyhow::bail!("the other client keeps its CU");
    }
    Ok(())
}

#[test]
fn bad_health_after_abort() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let cu: Arc<SimCu> = add_slow_cu(&sched, 0x1000, 2, Duration::from_millis(50))?;
    let client: Arc<Client> = sched.register_client(100);
    let handle: CuCtxHandle = open_shared(&sched, &client, 0)?;
    let tracker: Tracker = Tracker::new();

    cu.set_bad_on_abort(true);
    let ids: Vec<CommandId> = submit_n(&sched, &client, &tracker, 0, 2);
    sched.close_context(&client, handle)?;
    if !tracker.wait_freed(ids.len()) {
        anyhow::bail!("commands were not released");
    }
    if !sched.bad_state() {
        anyhow::bail!("a CU reporting bad health should put the device in bad state");
    }
    Ok(())
}

#[test]
fn idle_close_skips_abort() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let cus: Vec<Arc<SimCu>> = add_configured_cus(&sched, 1);
    let client: Arc<Client> = sched.register_client(100);
    let handle: CuCtxHandle = open_shared(&sched, &client, 0)?;
    let tracker: Tracker = Tracker::new();

    submit_n(&sched, &client, &tracker, 0, 3);
    if !tracker.wait_freed(3) {
        anyhow::bail!("commands did not complete");
    }
    sched.close_context(&client, handle)?;
    if cus[0].aborts() != 0 || sched.bad_state() {
        anyhow::bail!("nothing outstanding, nothing to abort");
    }
    Ok(())
}

#[test]
fn fini_client_drains_commands() -> Result<()> {
    let sched: Arc<Scheduler> = scheduler(fast_options());
    add_slow_cu(&sched, 0x1000, 1, Duration::from_millis(10))?;
    let client: Arc<Client> = sched.register_client(100);
    open_shared(&sched, &client, 0)?;
    open_shared(&sched, &client, 0)?;
    let tracker: Tracker = Tracker::new();

    let ids: Vec<CommandId> = submit_n(&sched, &client, &tracker, 0, 4);
    sched.fini_client(&client)?;
    if !tracker.wait_freed(ids.len()) {
        anyhow::bail!("close-all left commands behind");
    }
    if sched.live_client_count() != 0 || sched.slots().refcnt(0) != 0 || sched.bad_state() {
        anyhow::bail!("close-all should release everything");
    }
    sched.fini()?;
    Ok(())
}

#[test]
fn concurrent_closes_stay_healthy() -> Result<()> {
    const NCLIENTS: u32 = 4;
    let sched: Arc<Scheduler> = scheduler(SchedOptions {
        abort_retry_interval: Duration::from_millis(5),
        abort_poll_interval: Duration::from_millis(20),
        abort_max_polls: 200,
        abort_hang_timeout: Duration::from_secs(2),
        ..fast_options()
    });
    let cu: Arc<SimCu> = add_slow_cu(&sched, 0x1000, 4, Duration::from_millis(20))?;
    let tracker: Tracker = Tracker::new();
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(NCLIENTS as usize));

    let mut handles: Vec<thread::JoinHandle<Result<Vec<CommandId>>>> = Vec::new();
    for i in 0..NCLIENTS {
        let client: Arc<Client> = sched.register_client(100 + i);
        let handle: CuCtxHandle = open_shared(&sched, &client, 0)?;
        let sched: Arc<Scheduler> = sched.clone();
        let tracker: Tracker = tracker.clone();
        let barrier: Arc<Barrier> = barrier.clone();
        handles.push(thread::spawn(move || -> Result<Vec<CommandId>> {
            barrier.wait();
            // Staggered so that one client's abort finishes while another one is being requested.
            thread::sleep(Duration::from_millis(10 * u64::from(i)));
            let ids: Vec<CommandId> = submit_n(&sched, &client, &tracker, 0, 2);
            thread::sleep(Duration::from_millis(3));
            sched.close_context(&client, handle)?;
            Ok(ids)
        }));
    }

    let mut ids: Vec<CommandId> = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(result) => ids.extend(result?),
            Err(_) => anyhow::bail!("client thread panicked"),
        }
    }
    if !tracker.wait_freed(ids.len()) {
        anyhow::bail!("commands were not released");
    }
    for id in &ids {
        if !matches!(tracker.status(*id), Some(KdsStatus::Completed) | Some(KdsStatus::Aborted)) {
            anyhow::bail!("{:?} ended {:?}", id, tracker.status(*id));
        }
        if tracker.freed(*id) != 1 {
            anyhow::bail!("{:?} released {} times", id, tracker.freed(*id));
        }
    }
    if sched.bad_state() || cu.is_bad() {
        anyhow::bail!("healthy closes must not put the device in bad state");
    }
    if sched.mgmt(CuDomain::Pl).refs(0) != 0 || cu.free_credits() != 4 {
        anyhow::bail!("every client left, the CU should be idle");
    }
    Ok(())
}

#[test]
fn close_races_with_submit() -> Result<()> {
    const COUNT: usize = 500;
    let sched: Arc<Scheduler> = scheduler(fast_options());
    let cu: Arc<SimCu> = add_slow_cu(&sched, 0x1000, 2, Duration::from_millis(1))?;
    let client: Arc<Client> = sched.register_client(100);
    let handle: CuCtxHandle = open_shared(&sched, &client, 0)?;
    let tracker: Tracker = Tracker::new();

    let submitter: thread::JoinHandle<()> = {
        let sched: Arc<Scheduler> = sched.clone();
        let client: Arc<Client> = client.clone();
        let tracker: Tracker = tracker.clone();
        thread::spawn(move || {
            for _ in 0..COUNT {
                sched.submit(&client, tracker.track(start(&[0])));
                thread::sleep(Duration::from_micros(50));
            }
        })
    };
    if !wait_started(&cu, 10) {
        anyhow::bail!("commands never reached the CU");
    }
    sched.close_context(&client, handle)?;
    let started: u64 = cu.started();

    if submitter.join().is_err() {
        anyhow::bail!("submitter panicked");
    }
    if !tracker.wait_freed(COUNT) {
        anyhow::bail!("only {} of {} commands released", tracker.total_frees(), COUNT);
    }
    if cu.started() != started {
        anyhow::bail!("{} commands started after the close", cu.started() - started);
    }
    if client.outstanding(CuDomain::Pl, 0) != 0 || sched.mgmt(CuDomain::Pl).refs(0) != 0 || sched.bad_state() {
        anyhow::bail!("the close should leave nothing behind");
    }
    Ok(())
}
