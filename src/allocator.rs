//! The allocation engine.
//!
//! Ranges drain through a spill-cost max-priority queue. Each popped range
//! is checked against the interval index of its register class and then
//! walked through a fixed ladder:
//!
//! 1. **try-assign**: first register in ISA declaration order not claimed
//!    by an overlapping assigned range;
//! 2. **evict**: if every register is claimed, take the one whose
//!    occupants are cheapest to displace, but only when their summed
//!    spill cost is strictly below the candidate's — evictees go back to
//!    the second-chance queue;
//! 3. **split**: cut the parent bundle at the first point of interference
//!    (or past the first use) and re-queue the cut edges;
//! 4. **second chance**: retry once after all higher-priority work; what
//!    still fails is marked for spilling.
//!
//! The engine is single-threaded and deterministic: the queue ordering
//! below plus ISA declaration order fully determine the outcome.

use crate::bundle::{LiveMap, RangeId};
use crate::error::{AllocError, AllocResult};
use crate::interval::{CodePoint, Interval};
use crate::stitch::{Output, SpillSlot};
use crate::tree::IntervalTree;
use crate::{Allocation, PReg, RegClass, TargetIsa};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

// =============================================================================
// Statistics
// =============================================================================

/// Counters describing one allocation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Ranges supplied by the caller.
    pub num_ranges: usize,
    /// Register assignments performed by the engine (pre-assigned bundles
    /// not included).
    pub num_assigned: usize,
    /// Eviction events.
    pub num_evictions: usize,
    /// Successful bundle splits.
    pub num_splits: usize,
    /// Ranges that ended up spilled.
    pub num_spilled: usize,
}

// =============================================================================
// Queue Entry
// =============================================================================

/// A queued range with its priority key captured at push time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    cost: u64,
    vreg: u32,
    start: CodePoint,
    range: RangeId,
}

impl QueueEntry {
    fn for_range(live: &LiveMap, id: RangeId) -> Self {
        let range = live.range(id);
        QueueEntry {
            cost: range.spill_cost,
            vreg: range.vreg.id,
            start: range.start,
            range: id,
        }
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher spill cost pops first. Ties prefer the lower
        // vreg id, then the earlier start, then the older range.
        self.cost
            .cmp(&other.cost)
            .then_with(|| other.vreg.cmp(&self.vreg))
            .then_with(|| other.start.cmp(&self.start))
            .then_with(|| other.range.cmp(&self.range))
    }
}

// =============================================================================
// Allocator
// =============================================================================

type Interferences = SmallVec<[RangeId; 8]>;

/// The register allocator.
///
/// Create one per run against a [`TargetIsa`], then consume a [`LiveMap`]
/// with [`run`](Allocator::run).
#[derive(Debug)]
pub struct Allocator<'a> {
    isa: &'a TargetIsa,
    /// One index of currently-assigned ranges per register class.
    trees: [IntervalTree<RangeId>; 3],
    pending: BinaryHeap<QueueEntry>,
    second_chance: BinaryHeap<QueueEntry>,
    /// Ranges marked for spilling; concatenated with the drained indices
    /// at teardown so no input range is lost.
    spilled: Vec<RangeId>,
    stats: AllocatorStats,
}

impl<'a> Allocator<'a> {
    /// Create an allocator for a register file.
    #[must_use]
    pub fn new(isa: &'a TargetIsa) -> Self {
        Allocator {
            isa,
            trees: [IntervalTree::new(), IntervalTree::new(), IntervalTree::new()],
            pending: BinaryHeap::new(),
            second_chance: BinaryHeap::new(),
            spilled: Vec::new(),
            stats: AllocatorStats::default(),
        }
    }

    /// Allocate every bundle in `live`.
    ///
    /// Always produces a complete [`Output`]; pressure degrades into
    /// splits and spills, never into failure.
    ///
    /// # Errors
    ///
    /// [`AllocError::DuplicateRange`] if two input ranges of the same
    /// register class cover exactly the same interval.
    pub fn run(mut self, mut live: LiveMap) -> AllocResult<Output> {
        self.ingest(&live)?;

        // Phase 1: pending queue, splits allowed.
        while let Some(entry) = self.pending.pop() {
            if live.bundle(live.range(entry.range).parent).is_retired() {
                continue;
            }
            let interferences = self.interferences(&live, entry.range);
            if let Some(reg) = self.try_assign_may_evict(&live, entry.range, &interferences) {
                let parent = live.range(entry.range).parent;
                live.bundle_mut(parent)
                    .set_allocation(Allocation::Register(reg));
                let class = live.range(entry.range).vreg.reg_class();
                let interval = live.range(entry.range).interval();
                if self.trees[class.index()].insert(interval, entry.range) {
                    self.stats.num_assigned += 1;
                } else {
                    // A split manufactured an interval equal to an indexed
                    // one; retry rather than drop the range.
                    self.second_chance.push(entry);
                }
                continue;
            }
            if let Some(at) = self.find_split_spot(&live, entry.range, &interferences) {
                if self.try_split(&mut live, entry.range, at) {
                    continue;
                }
            }
            self.second_chance.push(entry);
        }

        // Phase 2: one retry each, then spill.
        while let Some(entry) = self.second_chance.pop() {
            if live.bundle(live.range(entry.range).parent).is_retired() {
                continue;
            }
            let interferences = self.interferences(&live, entry.range);
            if let Some(reg) = self.try_assign_may_evict(&live, entry.range, &interferences) {
                let parent = live.range(entry.range).parent;
                live.bundle_mut(parent)
                    .set_allocation(Allocation::Register(reg));
                let class = live.range(entry.range).vreg.reg_class();
                let interval = live.range(entry.range).interval();
                if self.trees[class.index()].insert(interval, entry.range) {
                    self.stats.num_assigned += 1;
                } else {
                    self.spill(&mut live, entry.range);
                }
            } else {
                self.spill(&mut live, entry.range);
            }
        }

        let mut finals = Vec::with_capacity(live.num_ranges());
        for class in RegClass::ALL {
            finals.extend(self.trees[class.index()].extract_all());
        }
        finals.append(&mut self.spilled);

        Ok(Output::resolve(finals, &mut live, self.stats))
    }

    /// Validate the input and seed the queue. Ranges of pre-assigned
    /// bundles are indexed immediately so their claims are visible to
    /// every interference query, and are not queued.
    fn ingest(&mut self, live: &LiveMap) -> AllocResult<()> {
        let mut seen: FxHashSet<(RegClass, Interval)> = FxHashSet::default();
        for id in live.range_ids() {
            let range = live.range(id);
            let class = range.vreg.reg_class();
            let interval = range.interval();
            if !seen.insert((class, interval)) {
                return Err(AllocError::DuplicateRange { class, interval });
            }
            self.stats.num_ranges += 1;
            if live.bundle(range.parent).allocation().is_register() {
                let inserted = self.trees[class.index()].insert(interval, id);
                debug_assert!(inserted);
            } else {
                self.pending.push(QueueEntry::for_range(live, id));
            }
        }
        Ok(())
    }

    /// Every assigned range overlapping `id`'s interval, in its class.
    fn interferences(&self, live: &LiveMap, id: RangeId) -> Interferences {
        let range = live.range(id);
        let class = range.vreg.reg_class();
        self.trees[class.index()]
            .overlap(range.interval())
            .map(|(_, &hit)| hit)
            .collect()
    }

    /// Scan for an unclaimed register, else evict the cheapest occupants
    /// when strictly profitable.
    fn try_assign_may_evict(
        &mut self,
        live: &LiveMap,
        id: RangeId,
        interferences: &Interferences,
    ) -> Option<PReg> {
        let class = live.range(id).vreg.reg_class();

        // Tally claims per register; the map doubles as the claimed set.
        let mut claims: FxHashMap<PReg, u64> = FxHashMap::default();
        for &other in interferences {
            if let Some(reg) = live.bundle(live.range(other).parent).allocation().register() {
                *claims.entry(reg).or_insert(0) += live.range(other).spill_cost;
            }
        }

        for &reg in self.isa.registers(class) {
            if !claims.contains_key(&reg) {
                return Some(reg);
            }
        }

        // Cheapest eviction, ties broken by declaration order.
        let mut best: Option<(PReg, u64)> = None;
        for &reg in self.isa.registers(class) {
            if let Some(&cost) = claims.get(&reg) {
                if best.is_none_or(|(_, current)| cost < current) {
                    best = Some((reg, cost));
                }
            }
        }
        let (reg, cost) = best?;

        if cost < live.range(id).spill_cost {
            self.evict_for(live, reg, interferences);
            Some(reg)
        } else {
            None
        }
    }

    /// Remove every interference holding `reg` from the index and hand it
    /// to the second-chance queue for re-placement.
    fn evict_for(&mut self, live: &LiveMap, reg: PReg, interferences: &Interferences) {
        for &other in interferences {
            let range = live.range(other);
            if live.bundle(range.parent).allocation() == Allocation::Register(reg) {
                self.trees[range.vreg.reg_class().index()].remove(range.interval());
                self.second_chance.push(QueueEntry::for_range(live, other));
                self.stats.num_evictions += 1;
            }
        }
    }

    /// The point where `id` should be cut away from its interferences,
    /// if one exists: the earliest point of overlap, or just past the
    /// first use when the overlap already covers the start.
    fn find_split_spot(
        &self,
        live: &LiveMap,
        id: RangeId,
        interferences: &Interferences,
    ) -> Option<CodePoint> {
        let range = live.range(id);

        let mut first_overlap = CodePoint::INVALID;
        for &other in interferences {
            let candidate = live.range(other).start.max(range.start);
            if candidate < first_overlap {
                first_overlap = candidate;
            }
        }
        if !first_overlap.is_valid() {
            return None;
        }
        if first_overlap != range.start {
            return Some(first_overlap);
        }

        // The interference already covers our start; cut past the first
        // use instead, or past the first instruction when the uses give
        // no better point.
        match range.uses.first() {
            Some(&first) if first != range.start && first != range.end => Some(first),
            _ => Some(range.start.next_inst()),
        }
    }

    /// Replace `id`'s bundle with truncated halves around `at`. Cut edge
    /// ranges are re-queued; untouched ranges keep their handles, so
    /// queue entries pointing at them stay live.
    fn try_split(&mut self, live: &mut LiveMap, id: RangeId, at: CodePoint) -> bool {
        let bundle = live.range(id).parent;
        if live.bundle_is_minimal(bundle) {
            return false;
        }
        let start = live.bundle_start(bundle);
        let end = live.bundle_end(bundle);
        // A cut at or before the bundle start has no left half (and no
        // previous instruction to end it at).
        if at.early() <= start {
            return false;
        }

        let count_before = live.bundle(bundle).num_ranges();
        let left = live.truncated(bundle, Interval::new(start, at.prev_inst().late()));
        let right = live.truncated(bundle, Interval::new(at, end));
        let (Some(left), Some(right)) = (left, right) else {
            return false;
        };

        let allocation = live.bundle(bundle).allocation();
        let split_mid_range = left.len() + right.len() != count_before;
        let left_edge = left[left.len() - 1];
        let right_edge = right[0];

        let left_bundle = live.new_bundle(allocation);
        live.adopt(left_bundle, left);
        let right_bundle = live.new_bundle(allocation);
        live.adopt(right_bundle, right);
        live.retire(bundle);

        if split_mid_range {
            // The cut range's two clones sit at the facing edges of the
            // halves; they are new and must be queued.
            self.pending.push(QueueEntry::for_range(live, left_edge));
            self.pending.push(QueueEntry::for_range(live, right_edge));
        } else {
            // The cut fell in a hole of the bundle, so the popped range
            // was carried whole into one half; nothing else re-queues it.
            self.pending.push(QueueEntry::for_range(live, id));
        }

        self.stats.num_splits += 1;
        true
    }

    /// Mark `id`'s bundle as spilled; the post-pass picks the slot.
    fn spill(&mut self, live: &mut LiveMap, id: RangeId) {
        let parent = live.range(id).parent;
        live.bundle_mut(parent)
            .set_allocation(Allocation::Spill(SpillSlot::PENDING));
        self.spilled.push(id);
        self.stats.num_spilled += 1;
    }
}

// =============================================================================
// Tests
// =============================================================================
