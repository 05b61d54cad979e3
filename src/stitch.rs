//! Allocation resolution: spill slots and stitches.
//!
//! After the engine settles every range, this post-pass walks the final
//! range set in code order and
//!
//! 1. turns each pending spill into a concrete stack slot, one slot per
//!    spilled virtual register, sized and aligned by the vreg's type;
//! 2. discovers the **stitches**: wherever two consecutive ranges of the
//!    same vreg ended up in different locations, one move carries the
//!    value across the boundary, logically placed immediately before the
//!    instruction at its code point.
//!
//! Slots are assigned before stitches so stitch endpoints never carry the
//! pending sentinel.

use crate::allocator::AllocatorStats;
use crate::bundle::{LiveMap, RangeId};
use crate::interval::CodePoint;
use crate::{Allocation, VReg};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Spill Slot
// =============================================================================

/// A byte offset into the spill area of the stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpillSlot(u32);

impl SpillSlot {
    /// Sentinel: the bundle must spill but no offset has been chosen yet.
    pub const PENDING: SpillSlot = SpillSlot(u32::MAX);

    /// A slot at a concrete byte offset.
    #[inline]
    #[must_use]
    pub const fn at(offset: u32) -> Self {
        SpillSlot(offset)
    }

    /// The byte offset.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0
    }

    /// Check if this is the unchosen-slot sentinel.
    #[inline]
    #[must_use]
    pub const fn is_pending(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pending() {
            f.write_str("[sp+?]")
        } else {
            write!(f, "[sp+{}]", self.0)
        }
    }
}

// =============================================================================
// Spill Slot Allocator
// =============================================================================

/// Bump allocator for spill slots.
///
/// Offsets grow monotonically; each new slot is rounded up to the natural
/// alignment of its type (the power-of-two total size) before assignment.
/// A vreg spilled over several ranges keeps one slot.
#[derive(Debug, Clone, Default)]
pub struct SpillSlotAllocator {
    delta: u32,
    slots: FxHashMap<VReg, SpillSlot>,
}

impl SpillSlotAllocator {
    /// Create an allocator starting at offset zero.
    #[must_use]
    pub fn new() -> Self {
        SpillSlotAllocator::default()
    }

    /// The slot for a vreg, allocating one on first sight.
    pub fn slot_for(&mut self, vreg: VReg) -> SpillSlot {
        if let Some(&slot) = self.slots.get(&vreg) {
            return slot;
        }
        let size = vreg.ty.size_bytes();
        debug_assert!(size.is_power_of_two());
        let offset = (self.delta + size - 1) & !(size - 1);
        self.delta = offset + size;
        let slot = SpillSlot::at(offset);
        self.slots.insert(vreg, slot);
        slot
    }

    /// Total bytes of spill area used so far.
    #[must_use]
    pub const fn total_bytes(&self) -> u32 {
        self.delta
    }
}

// =============================================================================
// Stitch
// =============================================================================

/// A move carrying a vreg's value across an allocation change, taking
/// effect immediately before the instruction at `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stitch {
    /// The virtual register whose value moves.
    pub vreg: VReg,
    /// Location the value leaves.
    pub from: Allocation,
    /// Location the value enters.
    pub to: Allocation,
    /// The code point of the move.
    pub at: CodePoint,
}

impl fmt::Display for Stitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {} @ {}", self.vreg, self.from, self.to, self.at)
    }
}

// =============================================================================
// Output
// =============================================================================

/// One finalized live range: where the value lives over `[start, end]`.
///
/// Carries the range's cost and uses so an output can be re-packaged as
/// fresh input, e.g. to re-run after the caller tightens the register
/// file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedRange {
    /// The virtual register.
    pub vreg: VReg,
    /// First covered point.
    pub start: CodePoint,
    /// Last covered point.
    pub end: CodePoint,
    /// The spill cost the range carried through allocation.
    pub spill_cost: u64,
    /// Use positions within `[start, end]`.
    pub uses: SmallVec<[CodePoint; 4]>,
    /// Register or concrete spill slot; never unassigned or pending.
    pub allocation: Allocation,
}

impl fmt::Display for AllocatedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:[{}, {}] in {}",
            self.vreg, self.start, self.end, self.allocation
        )
    }
}

/// The result of an allocation run.
#[derive(Debug, Clone)]
pub struct Output {
    /// Every final range with its resolved location, sorted by
    /// `(start, end, vreg)`.
    pub allocations: Vec<AllocatedRange>,
    /// Moves required at allocation boundaries, in code order of
    /// discovery.
    pub stitches: Vec<Stitch>,
    /// Counters describing what the engine did.
    pub stats: AllocatorStats,
}

impl Output {
    /// Resolve the engine's final range set: sort, assign spill slots,
    /// discover stitches.
    pub(crate) fn resolve(
        mut ranges: Vec<RangeId>,
        live: &mut LiveMap,
        stats: AllocatorStats,
    ) -> Output {
        ranges.sort_by_key(|&id| {
            let range = live.range(id);
            (range.start, range.end, range.vreg.id, range.vreg.ty)
        });

        // Pass 1: concrete slots for every spilled bundle.
        let mut slots = SpillSlotAllocator::new();
        for &id in &ranges {
            let parent = live.range(id).parent;
            if live.bundle(parent).allocation().is_spill() {
                let slot = slots.slot_for(live.range(id).vreg);
                live.bundle_mut(parent)
                    .set_allocation(Allocation::Spill(slot));
            }
        }

        // Pass 2: one stitch per allocation change between consecutive
        // ranges of a vreg.
        let mut stitches = Vec::new();
        let mut last_seen: FxHashMap<VReg, RangeId> = FxHashMap::default();
        for &id in &ranges {
            let range = live.range(id);
            let vreg = range.vreg;
            let current = live.bundle(range.parent).allocation();
            if let Some(&prior) = last_seen.get(&vreg) {
                let prior_alloc = live.bundle(live.range(prior).parent).allocation();
                if prior_alloc != current {
                    stitches.push(Stitch {
                        vreg,
                        from: prior_alloc,
                        to: current,
                        at: live.range(prior).end.next_inst(),
                    });
                }
            }
            last_seen.insert(vreg, id);
        }

        let allocations = ranges
            .iter()
            .map(|&id| {
                let range = live.range(id);
                let allocation = live.bundle(range.parent).allocation();
                debug_assert!(!matches!(allocation, Allocation::Unassigned));
                debug_assert!(!allocation.is_pending_spill());
                AllocatedRange {
                    vreg: range.vreg,
                    start: range.start,
                    end: range.end,
                    spill_cost: range.spill_cost,
                    uses: range.uses.clone(),
                    allocation,
                }
            })
            .collect();

        Output {
            allocations,
            stitches,
            stats,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
