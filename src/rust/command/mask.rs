// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    limits::{
        CU_MASK_WORDS,
        MAX_CUS,
    },
};
use ::arrayvec::ArrayVec;
use ::bit_iter::BitIter;

//==============================================================================
// Structures
//==============================================================================

/// Dense list of CU indices, in ascending order.
pub type CuList = ArrayVec<u32, MAX_CUS>;

/// Set of candidate CUs named by a command, one bit per CU index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CuMask {
    words: ArrayVec<u32, CU_MASK_WORDS>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl CuMask {
    /// Builds a mask from raw 32-bit words. Word `i` covers CU indices `32 * i` to `32 * i + 31`.
    pub fn from_words(words: &[u32]) -> Result<Self, Fail> {
        if words.len() > CU_MASK_WORDS {
            let cause: String = format!("mask spans {} words, at most {} allowed", words.len(), CU_MASK_WORDS);
            error!("from_words(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut mask: ArrayVec<u32, CU_MASK_WORDS> = ArrayVec::new();
        mask.extend(words.iter().copied());
        Ok(Self { words: mask })
    }

    /// Builds a mask that names the given CU indices.
    pub fn from_indices(indices: &[u32]) -> Result<Self, Fail> {
        let mut mask: Self = Self::default();
        for &idx in indices {
            mask.set(idx)?;
        }
        Ok(mask)
    }

    /// Adds a CU index to the mask.
    pub fn set(&mut self, idx: u32) -> Result<(), Fail> {
        if idx as usize >= MAX_CUS {
            let cause: String = format!("CU index {} out of range", idx);
            error!("set(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let word: usize = (idx / 32) as usize;
        while self.words.len() <= word {
            self.words.push(0);
        }
        self.words[word] |= 1 << (idx % 32);
        Ok(())
    }

    /// Raw words of the mask.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Expands the mask into candidate CU indices, ascending bit order across ascending word order.
    pub fn resolve_candidates(&self) -> CuList {
        let mut candidates: CuList = ArrayVec::new();
        for (i, word) in self.words.iter().enumerate() {
            for bit in BitIter::from(*word) {
                candidates.push((i * 32 + bit) as u32);
            }
        }
        candidates
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
