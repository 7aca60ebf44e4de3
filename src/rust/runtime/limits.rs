// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum number of compute units per domain. This is the hardware limit of the CU address aperture.
pub const MAX_CUS: usize = 128;

/// Number of 32-bit words needed to name every CU in a command mask.
pub const CU_MASK_WORDS: usize = MAX_CUS / 32;

/// Maximum number of partial reconfiguration slots.
pub const MAX_SLOTS: usize = 32;

/// CU index used to lock an xclbin without claiming any compute unit.
pub const CU_VIRTUAL: u32 = 0xffff_ffff;
