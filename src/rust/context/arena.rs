// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::context::{
    CuCtx,
    CuCtxHandle,
};
use ::slab::Slab;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Storage of CU-Contexts. Slots are recycled, so every handle carries the generation of the record it was issued
/// for and goes stale once that record is freed.
pub struct CuCtxArena {
    table: Slab<CuCtx>,
    next_generation: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CuCtxArena {
    pub fn new() -> Self {
        Self {
            table: Slab::new(),
            next_generation: 1,
        }
    }

    /// Stores a CU-Context and returns its handle.
    pub fn alloc(&mut self, mut cu_ctx: CuCtx) -> CuCtxHandle {
        let generation: u64 = self.next_generation;
        self.next_generation += 1;
        cu_ctx.generation = generation;
        let index: usize = self.table.insert(cu_ctx);
        CuCtxHandle {
            index: index as u32,
            generation,
        }
    }

    pub fn get(&self, handle: CuCtxHandle) -> Option<&CuCtx> {
        self.table
            .get(handle.index as usize)
            .filter(|cu_ctx| cu_ctx.generation == handle.generation)
    }

    pub fn get_mut(&mut self, handle: CuCtxHandle) -> Option<&mut CuCtx> {
        self.table
            .get_mut(handle.index as usize)
            .filter(|cu_ctx| cu_ctx.generation == handle.generation)
    }

    /// Removes a CU-Context. Stale handles remove nothing.
    pub fn free(&mut self, handle: CuCtxHandle) -> Option<CuCtx> {
        self.get(handle)?;
        Some(self.table.remove(handle.index as usize))
    }

    /// Handles of every stored CU-Context.
    pub fn handles(&self) -> Vec<CuCtxHandle> {
        self.table
            .iter()
            .map(|(index, cu_ctx)| CuCtxHandle {
                index: index as u32,
                generation: cu_ctx.generation,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CuCtx> {
        self.table.iter().map(|(_, cu_ctx)| cu_ctx)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for CuCtxArena {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
