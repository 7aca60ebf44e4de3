// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::{
    Mutex,
    Once,
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOG_HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);

/// Log specification used when `RUST_LOG` is not set.
const DEFAULT_LOG_SPEC: &str = "info";

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        // Install global logger configured based on RUST_LOG env var.
        let handle: LoggerHandle = match Logger::try_with_env_or_str(DEFAULT_LOG_SPEC).and_then(|l| l.start()) {
            Ok(handle) => handle,
            // Another logger is already installed, e.g. by the embedding application.
            Err(_) => return,
        };
        if let Ok(mut slot) = LOG_HANDLE.lock() {
            *slot = Some(handle);
        }
    });
}
