// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Kernel Driver Scheduler.
//!
//! Dispatches commands from device clients to FPGA compute units, arbitrating shared and exclusive access to each
//! CU and draining in-flight work when clients let go of their contexts.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod client;
pub mod command;
pub mod context;
pub mod cu;
pub mod kds;
pub mod runtime;
pub mod sim;
pub mod slot;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    client::{
        Client,
        ClientId,
    },
    command::{
        CmdOp,
        Command,
        CommandId,
        CuMask,
        KdsStatus,
    },
    context::{
        CuAccess,
        CuCtxHandle,
        CuCtxInfo,
        HwCtxId,
    },
    cu::{
        CuDomain,
        CuDriver,
        CuHealth,
        CuInfo,
    },
    kds::{
        Config,
        SchedOptions,
        Scheduler,
    },
    runtime::{
        fail::Fail,
        limits::CU_VIRTUAL,
    },
    slot::XclbinId,
};
