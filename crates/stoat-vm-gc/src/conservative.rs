//! Conservative root discovery.
//!
//! Reads the saved register snapshot, the native stack between a live frame
//! and the thread's stack top, and every registered closure-capture range.
//! Each machine word is decoded as a possible cell pointer — honouring the
//! VM's NaN-boxed value encoding — then validated against the live block set
//! before it may root a cell. Words that fail validation are discarded
//! without a trace; that is the whole contract of a conservative scan.

use std::mem;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::heap::Heap;
use crate::heap_block::HeapBlock;
use crate::roots::{HeapRootOrigin, RootSet};
use crate::stack::capture_registers;

/// Bit position of the value tag: the low 48 bits of a tagged word are the
/// pointer payload.
pub const TAG_SHIFT: u32 = 48;

/// Tag bits every cell-backed value carries. A word whose top bits all match
/// this pattern is a NaN-boxed cell pointer.
pub const IS_CELL_PATTERN: u64 = 0xFFF8;

/// [`IS_CELL_PATTERN`] shifted into place for whole-word tests.
pub const SHIFTED_IS_CELL_PATTERN: u64 = IS_CELL_PATTERN << TAG_SHIFT;

/// Recover the canonical pointer from a tagged word by sign-extending the low
/// 48 bits.
pub fn extract_pointer_bits(encoded: u64) -> usize {
    (((encoded << 16) as i64) >> 16) as usize
}

#[cfg(target_pointer_width = "64")]
fn add_possible_value(
    possible_pointers: &mut FxHashMap<usize, HeapRootOrigin>,
    data: usize,
    origin: HeapRootOrigin,
) {
    // Values store cell pointers in non-canonical tagged form, so a word with
    // a cell tag is decoded back to the pointer it carries. Anything else is
    // taken at face value.
    let data = data as u64;
    if (data & SHIFTED_IS_CELL_PATTERN) == SHIFTED_IS_CELL_PATTERN {
        possible_pointers.insert(extract_pointer_bits(data), origin);
    } else {
        possible_pointers.insert(data as usize, origin);
    }
}

#[cfg(target_pointer_width = "32")]
fn add_possible_value(
    possible_pointers: &mut FxHashMap<usize, HeapRootOrigin>,
    data: usize,
    origin: HeapRootOrigin,
) {
    // The two halves of a Value are separate machine words here, so each word
    // is scanned independently and taken as-is.
    possible_pointers.insert(data, origin);
}

impl Heap {
    /// Scan registers, the native stack and registered custom ranges; every
    /// word resolving to a live cell is added to `roots` with its origin.
    #[inline(never)]
    pub(crate) fn gather_conservative_roots(&self, roots: &mut RootSet) {
        let dummy: usize = 0;

        #[cfg(feature = "heap_debug")]
        tracing::trace!(target: "stoat::gc", "gather_conservative_roots");

        let mut possible_pointers: FxHashMap<usize, HeapRootOrigin> = FxHashMap::default();

        let snapshot = capture_registers();
        for &word in snapshot.words() {
            add_possible_value(&mut possible_pointers, word, HeapRootOrigin::RegisterPointer);
        }

        let word_size = mem::size_of::<usize>();
        let stack_reference = &dummy as *const usize as usize;
        let stack_top = self.vm().stack_info().top();
        let mut stack_address = (stack_reference + word_size - 1) & !(word_size - 1);
        while stack_address < stack_top {
            // SAFETY: [stack_reference, stack_top) is mapped stack memory of
            // the current thread.
            let data = unsafe { *(stack_address as *const usize) };
            add_possible_value(&mut possible_pointers, data, HeapRootOrigin::StackPointer);
            stack_address += word_size;
        }

        for (&base, range) in self.custom_ranges().iter() {
            for index in 0..range.word_count {
                // SAFETY: registered ranges are live embedder storage; the
                // registration contract forbids unregistering stale ranges
                // late.
                let data = unsafe { *(base as *const usize).add(index) };
                add_possible_value(
                    &mut possible_pointers,
                    data,
                    HeapRootOrigin::SafeFunction(range.location),
                );
            }
        }

        let mut all_live_blocks: FxHashSet<usize> = FxHashSet::default();
        self.for_each_block(|block| {
            all_live_blocks.insert(block.as_ptr() as usize);
        });

        for (&possible_pointer, origin) in &possible_pointers {
            if possible_pointer == 0 {
                continue;
            }
            let block = HeapBlock::from_cell(possible_pointer);
            if !all_live_blocks.contains(&(block as usize)) {
                continue;
            }
            // SAFETY: the block is in the live set, so it is mapped.
            let block = unsafe { &*block };
            if let Some(cell) = block.cell_from_possible_pointer(possible_pointer) {
                #[cfg(feature = "heap_debug")]
                tracing::trace!(target: "stoat::gc", ?cell, ?origin, "conservative root");
                roots.insert(cell, *origin);
            }
        }
    }
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_word_is_decoded() {
        let pointer: usize = 0x1234_5678_9ab0;
        let encoded = SHIFTED_IS_CELL_PATTERN | pointer as u64;

        let mut possible = FxHashMap::default();
        add_possible_value(&mut possible, encoded as usize, HeapRootOrigin::StackPointer);
        assert!(possible.contains_key(&pointer));
    }

    #[test]
    fn test_untagged_word_passes_through() {
        let pointer: usize = 0x5555_0000_1230;
        let mut possible = FxHashMap::default();
        add_possible_value(&mut possible, pointer, HeapRootOrigin::RegisterPointer);
        assert!(possible.contains_key(&pointer));
    }

    #[test]
    fn test_extract_sign_extends_high_half_addresses() {
        let encoded = SHIFTED_IS_CELL_PATTERN | 0x8000_0000_0000u64;
        assert_eq!(
            extract_pointer_bits(encoded),
            0xFFFF_8000_0000_0000usize
        );
    }
}
