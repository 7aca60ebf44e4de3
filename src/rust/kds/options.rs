// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    cu::CuOptions,
    kds::config::Config,
    runtime::fail::Fail,
};
use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_WORKER_BUSY_POLL: Duration = Duration::ZERO;
const DEFAULT_ABORT_RETRY_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_ABORT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_ABORT_MAX_POLLS: u32 = 100;
const DEFAULT_ABORT_HANG_TIMEOUT: Duration = Duration::from_millis(500);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedOptions {
    pub worker_idle_timeout: Duration,
    pub worker_busy_poll: Duration,
    pub abort_retry_interval: Duration,
    pub abort_poll_interval: Duration,
    /// Abort completion polls before a CU is declared hung.
    pub abort_max_polls: u32,
    pub abort_hang_timeout: Duration,
    /// Complete start commands without running them.
    pub echo: bool,
    /// Hand start commands to the ERT when one is attached.
    pub ert: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedOptions {
    /// Builds options from a configuration, keeping defaults for what it leaves out.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        let defaults: Self = Self::default();
        Ok(Self {
            worker_idle_timeout: config.worker_idle_timeout()?.unwrap_or(defaults.worker_idle_timeout),
            worker_busy_poll: config.worker_busy_poll()?.unwrap_or(defaults.worker_busy_poll),
            abort_retry_interval: config.abort_retry_interval()?.unwrap_or(defaults.abort_retry_interval),
            abort_poll_interval: config.abort_poll_interval()?.unwrap_or(defaults.abort_poll_interval),
            abort_max_polls: config.abort_max_polls()?.unwrap_or(defaults.abort_max_polls),
            abort_hang_timeout: config.abort_hang_timeout()?.unwrap_or(defaults.abort_hang_timeout),
            echo: config.echo()?.unwrap_or(defaults.echo),
            ert: config.ert()?.unwrap_or(defaults.ert),
        })
    }

    /// Worker settings handed to every CU.
    pub fn cu_options(&self) -> CuOptions {
        CuOptions {
            idle_timeout: self.worker_idle_timeout,
            busy_poll: self.worker_busy_poll,
            abort_hang_timeout: self.abort_hang_timeout,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SchedOptions {
    fn default() -> Self {
        Self {
            worker_idle_timeout: DEFAULT_WORKER_IDLE_TIMEOUT,
            worker_busy_poll: DEFAULT_WORKER_BUSY_POLL,
            abort_retry_interval: DEFAULT_ABORT_RETRY_INTERVAL,
            abort_poll_interval: DEFAULT_ABORT_POLL_INTERVAL,
            abort_max_polls: DEFAULT_ABORT_MAX_POLLS,
            abort_hang_timeout: DEFAULT_ABORT_HANG_TIMEOUT,
            echo: false,
            ert: false,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
