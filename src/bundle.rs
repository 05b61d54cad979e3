//! Live ranges, live bundles, and the arena that owns them.
//!
//! # Ownership Model
//!
//! A bundle owns its ranges and a range needs to reach its bundle, which
//! is a cycle. It is broken the usual way: both kinds of entity live in a
//! [`LiveMap`] arena and refer to each other through dense integer handles
//! ([`RangeId`], [`BundleId`]). The bundle holds the membership list; the
//! range's `parent` handle is a lookup capability, never a second owner.
//!
//! Splitting retires a bundle without freeing its slot, so stale handles
//! held by the allocator's queues stay indexable; a retired parent is how
//! the engine recognizes an entry it must not act on.

use crate::interval::{CodePoint, Interval};
use crate::{Allocation, VReg};
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Handles
// =============================================================================

/// Handle to a [`LiveRange`] inside a [`LiveMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeId(u32);

impl RangeId {
    /// Create a handle from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        RangeId(index)
    }

    /// The raw index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lr{}", self.0)
    }
}

/// Handle to a [`LiveBundle`] inside a [`LiveMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleId(u32);

impl BundleId {
    /// Create a handle from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        BundleId(index)
    }

    /// The raw index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// =============================================================================
// Live Range
// =============================================================================

/// A contiguous span `[start, end]` over which one virtual register holds
/// a meaningful value, with the positions where it is used.
#[derive(Debug, Clone)]
pub struct LiveRange {
    /// First covered point; always an early slot.
    pub start: CodePoint,
    /// Last covered point.
    pub end: CodePoint,
    /// The bundle currently owning this range.
    pub parent: BundleId,
    /// Penalty for forcing this range to memory. Higher binds harder to a
    /// register.
    pub spill_cost: u64,
    /// Use positions, ascending, all within `[start, end]`.
    pub uses: SmallVec<[CodePoint; 4]>,
    /// The virtual register this range belongs to.
    pub vreg: VReg,
}

impl LiveRange {
    /// The interval this range covers.
    #[inline]
    #[must_use]
    pub const fn interval(&self) -> Interval {
        Interval::new(self.start, self.end)
    }

    /// Check whether this range spans exactly one instruction and so
    /// cannot be split.
    #[inline]
    #[must_use]
    pub const fn is_minimal(&self) -> bool {
        self.interval().is_minimal()
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vreg, self.interval())
    }
}

// =============================================================================
// Live Bundle
// =============================================================================

/// A non-empty set of non-intersecting ranges, sorted by start, that share
/// one allocation.
#[derive(Debug, Clone)]
pub struct LiveBundle {
    ranges: SmallVec<[RangeId; 4]>,
    allocation: Allocation,
    retired: bool,
}

impl LiveBundle {
    /// The shared allocation of every range in this bundle.
    #[inline]
    #[must_use]
    pub const fn allocation(&self) -> Allocation {
        self.allocation
    }

    /// Replace the shared allocation.
    #[inline]
    pub fn set_allocation(&mut self, allocation: Allocation) {
        self.allocation = allocation;
    }

    /// The member ranges, in code order.
    #[inline]
    #[must_use]
    pub fn ranges(&self) -> &[RangeId] {
        &self.ranges
    }

    /// Number of member ranges.
    #[inline]
    #[must_use]
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// The earliest member range.
    #[inline]
    #[must_use]
    pub fn first_range(&self) -> RangeId {
        debug_assert!(!self.ranges.is_empty());
        self.ranges[0]
    }

    /// The latest member range.
    #[inline]
    #[must_use]
    pub fn last_range(&self) -> RangeId {
        debug_assert!(!self.ranges.is_empty());
        self.ranges[self.ranges.len() - 1]
    }

    /// Check whether this bundle has been split away and must no longer
    /// be allocated.
    #[inline]
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }
}

// =============================================================================
// Live Map
// =============================================================================

/// Arena owning every bundle and range of one allocation problem.
///
/// The caller builds its input here ([`LiveMap::new_bundle`],
/// [`LiveMap::push_range`]) and hands the map to
/// [`Allocator::run`](crate::Allocator::run), which consumes it.
#[derive(Debug, Clone, Default)]
pub struct LiveMap {
    ranges: Vec<LiveRange>,
    bundles: Vec<LiveBundle>,
}

impl LiveMap {
    /// Create an empty map.
    #[must_use]
    pub const fn new() -> Self {
        LiveMap {
            ranges: Vec::new(),
            bundles: Vec::new(),
        }
    }

    /// Create an empty bundle.
    ///
    /// Pass a concrete [`Allocation::Register`] to pre-assign the bundle;
    /// the allocator will honor the choice and only ever evict it.
    pub fn new_bundle(&mut self, allocation: Allocation) -> BundleId {
        let id = BundleId::new(u32::try_from(self.bundles.len()).expect("bundle count overflow"));
        self.bundles.push(LiveBundle {
            ranges: SmallVec::new(),
            allocation,
            retired: false,
        });
        id
    }

    /// Append a range to a bundle, in code order.
    ///
    /// `uses` must be ascending and contained in `[start, end]`; `start`
    /// must be an early slot and come after the bundle's current end.
    pub fn push_range(
        &mut self,
        bundle: BundleId,
        vreg: VReg,
        start: CodePoint,
        end: CodePoint,
        spill_cost: u64,
        uses: &[CodePoint],
    ) -> RangeId {
        debug_assert!(start <= end);
        debug_assert!(start.is_early(), "range must start at an early slot");
        debug_assert!(uses.windows(2).all(|w| w[0] <= w[1]), "uses must be sorted");
        debug_assert!(uses.iter().all(|&u| start <= u && u <= end));
        debug_assert!(
            self.bundles[bundle.index()]
                .ranges
                .last()
                .is_none_or(|&last| self.ranges[last.index()].end < start),
            "bundle ranges must be disjoint and ordered"
        );

        let id = self.alloc_range(LiveRange {
            start,
            end,
            parent: bundle,
            spill_cost,
            uses: SmallVec::from_slice(uses),
            vreg,
        });
        self.bundles[bundle.index()].ranges.push(id);
        id
    }

    /// Look up a range.
    #[inline]
    #[must_use]
    pub fn range(&self, id: RangeId) -> &LiveRange {
        &self.ranges[id.index()]
    }

    /// Look up a bundle.
    #[inline]
    #[must_use]
    pub fn bundle(&self, id: BundleId) -> &LiveBundle {
        &self.bundles[id.index()]
    }

    /// Mutable bundle access.
    #[inline]
    pub fn bundle_mut(&mut self, id: BundleId) -> &mut LiveBundle {
        &mut self.bundles[id.index()]
    }

    /// Start of a bundle: its first range's start.
    #[must_use]
    pub fn bundle_start(&self, id: BundleId) -> CodePoint {
        self.range(self.bundle(id).first_range()).start
    }

    /// End of a bundle: its last range's end.
    #[must_use]
    pub fn bundle_end(&self, id: BundleId) -> CodePoint {
        self.range(self.bundle(id).last_range()).end
    }

    /// A bundle is minimal when it holds a single one-instruction range;
    /// minimal bundles refuse to split.
    #[must_use]
    pub fn bundle_is_minimal(&self, id: BundleId) -> bool {
        let bundle = self.bundle(id);
        bundle.num_ranges() == 1 && self.range(bundle.first_range()).is_minimal()
    }

    /// Number of ranges ever created, splits included.
    #[must_use]
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// Iterate over every range handle ever created.
    pub fn range_ids(&self) -> impl Iterator<Item = RangeId> {
        (0..self.ranges.len()).map(|i| RangeId::new(i as u32))
    }

    fn alloc_range(&mut self, range: LiveRange) -> RangeId {
        let id = RangeId::new(u32::try_from(self.ranges.len()).expect("range count overflow"));
        self.ranges.push(range);
        id
    }

    /// Clone a range onto a narrower interval, keeping only the uses that
    /// survive the cut. The clone starts out parented like the original.
    pub(crate) fn clone_range(
        &mut self,
        id: RangeId,
        new_start: CodePoint,
        new_end: CodePoint,
    ) -> RangeId {
        let orig = &self.ranges[id.index()];
        let uses = orig
            .uses
            .iter()
            .copied()
            .filter(|&u| new_start <= u && u <= new_end)
            .collect();
        let clone = LiveRange {
            start: new_start,
            end: new_end,
            parent: orig.parent,
            spill_cost: orig.spill_cost,
            uses,
            vreg: orig.vreg,
        };
        self.alloc_range(clone)
    }

    /// Restrict a bundle to `interval`, producing the member list of the
    /// would-be half-bundle.
    ///
    /// Fully-covered ranges are carried over by handle; partially-covered
    /// ranges are cloned onto the cut interval with their uses filtered;
    /// non-overlapping ranges are dropped. Returns `None` when nothing
    /// survives.
    pub(crate) fn truncated(
        &mut self,
        bundle: BundleId,
        interval: Interval,
    ) -> Option<SmallVec<[RangeId; 4]>> {
        let members: SmallVec<[RangeId; 4]> = self.bundle(bundle).ranges.clone();
        let mut kept: SmallVec<[RangeId; 4]> = SmallVec::new();

        for id in members {
            let live_in = self.range(id).interval();
            if !interval.overlaps(&live_in) {
                continue;
            }
            if live_in.fully_within(&interval) {
                kept.push(id);
                continue;
            }
            let new_start = self.range(id).start.max(interval.low);
            let new_end = std::cmp::min(self.range(id).end, interval.high);
            kept.push(self.clone_range(id, new_start, new_end));
        }

        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }

    /// Hand a member list to a bundle and point every member back at it.
    pub(crate) fn adopt(&mut self, bundle: BundleId, ranges: SmallVec<[RangeId; 4]>) {
        for &id in &ranges {
            self.ranges[id.index()].parent = bundle;
        }
        self.bundles[bundle.index()].ranges = ranges;
    }

    /// Flag a bundle as replaced by its split halves. The slot stays so
    /// stale handles remain indexable.
    pub(crate) fn retire(&mut self, bundle: BundleId) {
        self.bundles[bundle.index()].retired = true;
    }
}

// =============================================================================
// Tests
// =============================================================================
