// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use anyhow::Result;
use args::ProgramArguments;
use kds::{
    sim::SimCu,
    Client,
    CmdOp,
    Command,
    Config,
    CuAccess,
    CuCtxInfo,
    CuDomain,
    CuInfo,
    CuMask,
    KdsStatus,
    Scheduler,
    XclbinId,
};
use std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

mod args;

//======================================================================================================================
// Constants
//======================================================================================================================

const XCLBIN: XclbinId = XclbinId::new([0xb3; 16]);

/// Give up on a client that sees no completion for this long.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Opens every CU shared, sends `ncommands` start commands naming all of them and waits for the completions.
fn run_client(sched: Arc<Scheduler>, pid: u32, ncus: u32, ncommands: usize, failures: Arc<AtomicUsize>) -> Result<()> {
    let client: Arc<Client> = sched.register_client(pid);
    for idx in 0..ncus {
        sched.open_context(&client, XCLBIN, CuCtxInfo::new(idx, CuDomain::Pl, CuAccess::Shared))?;
    }

    let indices: Vec<u32> = (0..ncus).collect();
    let cu_mask: CuMask = CuMask::from_indices(&indices)?;
    for i in 0..ncommands {
        let failures: Arc<AtomicUsize> = failures.clone();
        let cmd: Command = Command::new(CmdOp::Start {
            cu_mask: cu_mask.clone(),
            payload: vec![i as u32],
        })
        .on_notify(move |_, status| {
            if status != KdsStatus::Completed {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        });
        sched.submit(&client, cmd);
    }

    for _ in 0..ncommands {
        if !client.wait_event(Some(EVENT_TIMEOUT)) {
            anyhow::bail!("client {} stalled", pid);
        }
    }
    sched.fini_client(&client)?;
    Ok(())
}

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "kds-bench",
        "Microsoft Corporation",
        "Throughput benchmark for the command scheduler on simulated compute units.",
    )?;

    let sched: Arc<Scheduler> = Arc::new(match args.config() {
        Some(path) => Scheduler::from_config(&Config::new(path)?)?,
        None => Scheduler::new(Default::default()),
    });
    sched.load_xclbin(0, XCLBIN)?;

    let latency: Duration = Duration::from_micros(args.latency_us());
    let mut addrs: Vec<u64> = Vec::new();
    for i in 0..args.ncus() {
        let addr: u64 = 0x1_0000 * (u64::from(i) + 1);
        let info: CuInfo = CuInfo::new(addr, "bench", &format!("bench_{}", i));
        sched.add_cu(Arc::new(SimCu::new(info).with_latency(latency)))?;
        addrs.push(addr);
    }
    sched.configure(&addrs)?;

    let failures: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let start: Instant = Instant::now();
    let mut handles: Vec<thread::JoinHandle<Result<()>>> = Vec::new();
    for pid in 0..args.nclients() {
        let sched: Arc<Scheduler> = sched.clone();
        let failures: Arc<AtomicUsize> = failures.clone();
        let (ncus, ncommands): (u32, usize) = (args.ncus(), args.ncommands());
        handles.push(thread::spawn(move || {
            run_client(sched, 1000 + pid as u32, ncus, ncommands, failures)
        }));
    }
    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("client thread panicked"),
        }
    }
    let elapsed: Duration = start.elapsed();

    let total: usize = args.nclients() * args.ncommands();
    println!(
        "{} commands in {:?} ({:.0} commands/s), {} failed",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        failures.load(Ordering::Relaxed)
    );
    print!("{}", sched.cu_stat(CuDomain::Pl));

    sched.fini()?;
    Ok(())
}
