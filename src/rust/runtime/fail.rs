// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::c_int;
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure of a scheduler operation.
///
/// Only structural errors (argument checks, conflicting reservations, full tables) travel as a [Fail]. Errors of a
/// single command are reported through its completion status instead.
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code, one of the `libc` errno values.
    pub errno: c_int,
    /// What went wrong, for logs and operators.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Fail {
    pub fn new(errno: c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Whether the caller should back off and try again.
    pub fn would_block(&self) -> bool {
        self.errno == libc::EAGAIN || self.errno == libc::EWOULDBLOCK
    }

    /// Whether the request conflicts with a resource someone else holds.
    pub fn is_busy(&self) -> bool {
        self.errno == libc::EBUSY
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.cause, self.errno)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fail")
            .field("errno", &self.errno)
            .field("cause", &self.cause)
            .finish()
    }
}

impl error::Error for Fail {}

/// Configuration files and worker threads are the only I/O the scheduler does.
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(libc::EIO),
            cause: e.to_string(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
