// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::KdsStatus,
    cu::CuDomain,
    runtime::fail::Fail,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Health of a compute unit, as seen after an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuHealth {
    Healthy,
    Bad,
}

/// Static description of a compute unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuInfo {
    /// Base address of the CU control registers.
    pub addr: u64,
    pub kernel_name: String,
    pub instance_name: String,
    /// Partition slot the CU lives in.
    pub slot_idx: u32,
    pub domain: CuDomain,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Register-level CU control. Implementations must not block in any of these calls except `start`, which may spin
/// briefly while the CU accepts the payload.
pub trait CuDriver: Send + Sync {
    fn info(&self) -> &CuInfo;

    /// Takes one unit of hardware queue capacity. Returns `false` when the CU queue is full.
    fn get_credit(&self) -> bool;

    /// Returns units of hardware queue capacity.
    fn put_credit(&self, count: u32);

    /// Programs the CU with a command payload and starts it.
    fn start(&self, payload: &[u32]) -> Result<(), Fail>;

    /// Polls for the completion of the oldest started command.
    fn check(&self) -> Option<KdsStatus>;

    /// Asks the CU to stop accepting work for an aborting client. Fails with `EAGAIN` if the CU cannot guarantee
    /// that right now.
    fn abort(&self) -> Result<(), Fail>;

    fn health(&self) -> CuHealth;

    /// Marks the CU as unusable until the device is reset.
    fn set_bad_state(&self);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuInfo {
    /// Describes a programmable logic CU in slot 0.
    pub fn new(addr: u64, kernel_name: &str, instance_name: &str) -> Self {
        Self {
            addr,
            kernel_name: kernel_name.to_string(),
            instance_name: instance_name.to_string(),
            slot_idx: 0,
            domain: CuDomain::Pl,
        }
    }

    pub fn in_slot(mut self, slot_idx: u32) -> Self {
        self.slot_idx = slot_idx;
        self
    }

    pub fn in_domain(mut self, domain: CuDomain) -> Self {
        self.domain = domain;
        self
    }

    /// Name in `kernel:instance` form.
    pub fn name(&self) -> String {
        format!("{}:{}", self.kernel_name, self.instance_name)
    }
}
