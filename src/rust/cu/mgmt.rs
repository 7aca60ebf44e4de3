// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    context::CuAccess,
    cu::{
        Cu,
        CuDomain,
        CuDriver,
    },
    runtime::{
        fail::Fail,
        limits::MAX_CUS,
    },
};
use ::std::{
    fmt::Write,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Reference word bit flagging an exclusive holder. The remaining bits count shared holders.
pub const CU_EXCLUSIVE: u32 = 0x8000_0000;

//======================================================================================================================
// Structures
//======================================================================================================================

struct CuMgmtInner {
    cus: [Option<Arc<Cu>>; MAX_CUS],
    /// Times each CU was selected. Only reset when the CU is removed.
    usage: [u64; MAX_CUS],
    /// Shared/exclusive reference word of each CU.
    refs: [u32; MAX_CUS],
    num_cus: usize,
    /// CU indices follow the xclbin order. Cleared when the last client leaves.
    configured: bool,
}

/// CU Resource Table
///
/// All state sits behind a single lock, which is never held across a call into a CU driver.
pub struct CuMgmt {
    domain: CuDomain,
    inner: Mutex<CuMgmtInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuMgmt {
    pub fn new(domain: CuDomain) -> Self {
        Self {
            domain,
            inner: Mutex::new(CuMgmtInner {
                cus: std::array::from_fn(|_| None),
                usage: [0; MAX_CUS],
                refs: [0; MAX_CUS],
                num_cus: 0,
                configured: false,
            }),
        }
    }

    pub fn domain(&self) -> CuDomain {
        self.domain
    }

    fn lock(&self) -> MutexGuard<'_, CuMgmtInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a CU in the first free slot and returns its provisional index.
    pub fn add_cu(&self, cu: Arc<Cu>) -> Result<u32, Fail> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let idx: usize = match inner.cus.iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None => {
                let cause: String = format!("CU table full ({} CUs)", MAX_CUS);
                error!("add_cu(): {}", cause);
                return Err(Fail::new(libc::ENOSPC, &cause));
            },
        };
        debug!("add_cu(): CU@{:#x} at index {}", cu.info().addr, idx);
        inner.cus[idx] = Some(cu);
        inner.usage[idx] = 0;
        inner.refs[idx] = 0;
        inner.num_cus += 1;
        Ok(idx as u32)
    }

    /// Unregisters the CU driven by `driver`. The caller guarantees no command is in flight on it.
    pub fn remove_cu(&self, driver: &Arc<dyn CuDriver>) -> Result<Arc<Cu>, Fail> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let target: *const () = Arc::as_ptr(driver) as *const ();
        let idx: usize = match inner
            .cus
            .iter()
            .position(|slot| matches!(slot, Some(cu) if Arc::as_ptr(cu.driver()) as *const () == target))
        {
            Some(idx) => idx,
            None => {
                let cause: String = format!("CU@{:#x} is not registered", driver.info().addr);
                error!("remove_cu(): {}", cause);
                return Err(Fail::new(libc::ENOENT, &cause));
            },
        };
        inner.usage[idx] = 0;
        inner.refs[idx] = 0;
        inner.num_cus -= 1;
        match inner.cus[idx].take() {
            Some(cu) => Ok(cu),
            None => Err(Fail::new(libc::ENOENT, "CU slot emptied concurrently")),
        }
    }

    /// Reorders CU indices so that index `i` is the CU at `addrs[i]`. CUs not named keep their relative order after
    /// the named ones. A no-op once configured. Fails with `EBUSY` while any CU is held, since contexts name CUs by
    /// index.
    pub fn configure(&self, addrs: &[u64]) -> Result<(), Fail> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        if inner.configured {
            debug!("configure(): already configured, ignoring");
            return Ok(());
        }
        if addrs.len() > MAX_CUS {
            let cause: String = format!("{} CU addresses exceed the table capacity", addrs.len());
            error!("configure(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if let Some(idx) = inner.refs.iter().position(|refs| *refs != 0) {
            let cause: String = format!("CU {} is held (refs={:#x})", idx, inner.refs[idx]);
            error!("configure(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }

        // Build the new order aside so that a failure leaves the table untouched.
        let mut order: Vec<usize> = Vec::with_capacity(inner.num_cus);
        for addr in addrs {
            let found: Option<usize> = inner
                .cus
                .iter()
                .enumerate()
                .position(|(i, slot)| matches!(slot, Some(cu) if cu.info().addr == *addr) && !order.contains(&i));
            match found {
                Some(i) => order.push(i),
                None => {
                    let cause: String = format!("CU address {:#x} is not registered", addr);
                    error!("configure(): {}", cause);
                    return Err(Fail::new(libc::EINVAL, &cause));
                },
            }
        }
        for (i, slot) in inner.cus.iter().enumerate() {
            if slot.is_some() && !order.contains(&i) {
                order.push(i);
            }
        }

        let mut cus: [Option<Arc<Cu>>; MAX_CUS] = std::array::from_fn(|_| None);
        let mut usage: [u64; MAX_CUS] = [0; MAX_CUS];
        for (new, &old) in order.iter().enumerate() {
            cus[new] = inner.cus[old].take();
            usage[new] = inner.usage[old];
        }
        inner.cus = cus;
        inner.usage = usage;
        inner.configured = true;
        info!("configure(): {:?} CU order set for {} CUs", self.domain, order.len());
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.lock().configured
    }

    /// Allows the next configuration to reorder CUs again.
    pub fn reset_configured(&self) {
        self.lock().configured = false;
    }

    pub fn num_cus(&self) -> usize {
        self.lock().num_cus
    }

    pub fn get(&self, idx: u32) -> Option<Arc<Cu>> {
        self.lock().cus.get(idx as usize)?.clone()
    }

    /// Registered CUs with their index.
    pub fn cus(&self) -> Vec<(u32, Arc<Cu>)> {
        self.lock()
            .cus
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|cu| (i as u32, cu.clone())))
            .collect()
    }

    /// Finds a CU by `kernel:instance` name within a slot.
    pub fn find_by_name(&self, slot_idx: u32, name: &str) -> Option<u32> {
        let (kernel_name, instance_name): (&str, &str) = name.split_once(':')?;
        self.lock().cus.iter().position(|slot| match slot {
            Some(cu) => {
                let info = cu.info();
                info.slot_idx == slot_idx && info.kernel_name == kernel_name && info.instance_name == instance_name
            },
            None => false,
        })
        .map(|idx| idx as u32)
    }

    /// Takes a shared or exclusive reference on a CU.
    pub fn acquire(&self, idx: u32, access: CuAccess) -> Result<(), Fail> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let i: usize = Self::check_index(&inner, idx, "acquire")?;
        let refs: u32 = inner.refs[i];
        match access {
            CuAccess::Exclusive if refs != 0 => {
                let cause: String = format!("CU {} is in use, cannot open exclusively", idx);
                warn!("acquire(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
            CuAccess::Shared if refs & CU_EXCLUSIVE != 0 => {
                let cause: String = format!("CU {} is held exclusively", idx);
                warn!("acquire(): {}", cause);
                Err(Fail::new(libc::EBUSY, &cause))
            },
            CuAccess::Exclusive => {
                inner.refs[i] = CU_EXCLUSIVE;
                Ok(())
            },
            CuAccess::Shared => {
                inner.refs[i] = refs + 1;
                Ok(())
            },
        }
    }

    /// Drops a reference taken by [CuMgmt::acquire].
    pub fn release(&self, idx: u32, access: CuAccess) -> Result<(), Fail> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let i: usize = Self::check_index(&inner, idx, "release")?;
        let refs: u32 = inner.refs[i];
        match access {
            CuAccess::Exclusive if refs & CU_EXCLUSIVE != 0 => inner.refs[i] = 0,
            CuAccess::Shared if refs & CU_EXCLUSIVE == 0 && refs > 0 => inner.refs[i] = refs - 1,
            _ => {
                let cause: String = format!("CU {} holds no {:?} reference (refs={:#x})", idx, access, refs);
                error!("release(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        }
        Ok(())
    }

    /// Reference word of a CU.
    pub fn refs(&self, idx: u32) -> u32 {
        self.lock().refs.get(idx as usize).copied().unwrap_or(0)
    }

    /// Usage counter of a CU.
    pub fn usage(&self, idx: u32) -> u64 {
        self.lock().usage.get(idx as usize).copied().unwrap_or(0)
    }

    /// Picks the least used registered CU among `valid`, lowest index first on ties, and counts the selection.
    pub fn select(&self, valid: &[u32]) -> Option<(u32, Arc<Cu>)> {
        let mut inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let mut best: Option<usize> = None;
        for &idx in valid {
            let i: usize = idx as usize;
            if !matches!(inner.cus.get(i), Some(Some(_))) {
                continue;
            }
            best = match best {
                Some(b) if inner.usage[b] <= inner.usage[i] => Some(b),
                _ => Some(i),
            };
        }
        let i: usize = best?;
        inner.usage[i] += 1;
        let cu: Arc<Cu> = inner.cus[i].clone()?;
        Some((i as u32, cu))
    }

    /// Operator report: one line per CU.
    pub fn stat(&self) -> String {
        let inner: MutexGuard<'_, CuMgmtInner> = self.lock();
        let mut out: String = String::new();
        for (i, slot) in inner.cus.iter().enumerate() {
            let cu: &Arc<Cu> = match slot {
                Some(cu) => cu,
                None => continue,
            };
            let refs: u32 = inner.refs[i];
            let holders: String = if refs & CU_EXCLUSIVE != 0 {
                "exclusive".to_string()
            } else if refs > 0 {
                format!("shared({})", refs)
            } else {
                "free".to_string()
            };
            let _ = writeln!(
                out,
                "{:>3} {:<32} {:#014x} usage={} {}",
                i,
                cu.info().name(),
                cu.info().addr,
                inner.usage[i],
                holders
            );
        }
        out
    }

    fn check_index(inner: &CuMgmtInner, idx: u32, caller: &str) -> Result<usize, Fail> {
        match inner.cus.get(idx as usize) {
            Some(Some(_)) => Ok(idx as usize),
            _ => {
                let cause: String = format!("no CU at index {}", idx);
                error!("{}(): {}", caller, cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
