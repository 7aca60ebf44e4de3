// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::fmt;

//==============================================================================
// Structures
//==============================================================================

/// Command Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdsStatus {
    /// Allocated but not yet accepted by the scheduler.
    New,
    /// Accepted and waiting in a CU queue.
    Queued,
    /// Started on a compute unit.
    Running,
    /// Finished successfully.
    Completed,
    /// Rejected or failed.
    Error,
    /// Removed before it ever reached the hardware.
    Aborted,
    /// Did not finish in time, or the device is in bad state.
    Timeout,
    /// The soft kernel executing it crashed.
    SkCrashed,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl KdsStatus {
    /// Asserts whether the status is final.
    pub fn is_final(&self) -> bool {
        !matches!(self, KdsStatus::New | KdsStatus::Queued | KdsStatus::Running)
    }

    /// Asserts whether the status belongs to the error family.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            KdsStatus::Error | KdsStatus::Aborted | KdsStatus::Timeout | KdsStatus::SkCrashed
        )
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for KdsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            KdsStatus::New => "new",
            KdsStatus::Queued => "queued",
            KdsStatus::Running => "running",
            KdsStatus::Completed => "completed",
            KdsStatus::Error => "error",
            KdsStatus::Aborted => "aborted",
            KdsStatus::Timeout => "timeout",
            KdsStatus::SkCrashed => "sk-crashed",
        };
        f.write_str(name)
    }
}
