// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod config;
pub mod offload;
pub mod options;
mod scheduler;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    config::Config,
    offload::{
        CopyEngine,
        ErtSubmitter,
    },
    options::SchedOptions,
    scheduler::Scheduler,
};
