// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    command::Command,
    runtime::fail::Fail,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Embedded command queue that dispatches start commands in hardware.
pub trait ErtSubmitter: Send + Sync {
    /// Takes over a start command that passed context checks. The submitter completes it.
    fn submit(&self, cmd: Command);
}

/// Engine running copy commands.
pub trait CopyEngine: Send + Sync {
    /// Copies `size` bytes from device address `src` to `dst` and returns once done.
    fn copy(&self, src: u64, dst: u64, size: u64) -> Result<(), Fail>;
}
