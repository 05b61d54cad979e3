//! End-to-end allocation scenarios.
//!
//! These tests drive the full pipeline (bundle construction, engine,
//! resolution) and check the allocator's quantified guarantees: same-class
//! overlaps never share a register, every input instruction stays covered,
//! stitches appear exactly at allocation changes, spill slots are unique
//! per vreg and reused across a vreg's ranges, and the whole run is
//! deterministic.

use bobbin::{
    AllocError, Allocation, Allocator, CodePoint, LiveMap, Output, PReg, RegClass, ScalarSize,
    SpillSlot, TargetIsa, VReg, ValueType,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn cp(raw: u32) -> CodePoint {
    CodePoint::from_raw(raw)
}

fn int_vreg(id: u32) -> VReg {
    VReg::new(id, ValueType::int(ScalarSize::B64))
}

fn int_isa(count: u8) -> TargetIsa {
    let mut isa = TargetIsa::new();
    for encoding in 0..count {
        isa.add(PReg::int(encoding));
    }
    isa
}

/// Add a one-range bundle and return its vreg.
fn add_range(live: &mut LiveMap, vreg: VReg, start: u32, end: u32, cost: u64, uses: &[u32]) {
    let bundle = live.new_bundle(Allocation::Unassigned);
    let uses: Vec<CodePoint> = uses.iter().map(|&u| cp(u)).collect();
    live.push_range(bundle, vreg, cp(start), cp(end), cost, &uses);
}

fn allocation_of(output: &Output, vreg: VReg, start: u32) -> Allocation {
    output
        .allocations
        .iter()
        .find(|a| a.vreg == vreg && a.start == cp(start))
        .unwrap_or_else(|| panic!("no output range for {vreg} at {start}"))
        .allocation
}

/// Same-class overlapping ranges must live in different locations unless
/// one of them is in memory.
fn check_non_interference(output: &Output) {
    for (i, a) in output.allocations.iter().enumerate() {
        for b in &output.allocations[i + 1..] {
            if a.vreg.reg_class() != b.vreg.reg_class() {
                continue;
            }
            let overlap = a.start <= b.end && a.end >= b.start;
            if overlap && a.allocation.is_register() && b.allocation.is_register() {
                assert_ne!(
                    a.allocation, b.allocation,
                    "{a} and {b} overlap in the same register"
                );
            }
        }
    }
}

/// Every instruction of the vreg's original span must still be covered by
/// some output range of that vreg.
fn check_coverage(output: &Output, vreg: VReg, start: u32, end: u32) {
    for inst in cp(start).inst_index()..=cp(end).inst_index() {
        let covered = output.allocations.iter().any(|a| {
            a.vreg == vreg && a.start.inst_index() <= inst && inst <= a.end.inst_index()
        });
        assert!(covered, "{vreg} lost coverage of instruction {inst}");
    }
}

/// Stitches must appear exactly where consecutive ranges of a vreg change
/// allocation, carrying the earlier and later locations and the point
/// right after the earlier range.
fn check_stitches(output: &Output) {
    let mut expected = Vec::new();
    let mut last_seen: Vec<(VReg, usize)> = Vec::new();
    for (idx, range) in output.allocations.iter().enumerate() {
        if let Some(entry) = last_seen.iter_mut().find(|(v, _)| *v == range.vreg) {
            let prior = &output.allocations[entry.1];
            if prior.allocation != range.allocation {
                expected.push((
                    range.vreg,
                    prior.allocation,
                    range.allocation,
                    prior.end.next_inst(),
                ));
            }
            entry.1 = idx;
        } else {
            last_seen.push((range.vreg, idx));
        }
    }
    let actual: Vec<_> = output
        .stitches
        .iter()
        .map(|s| (s.vreg, s.from, s.to, s.at))
        .collect();
    assert_eq!(actual, expected);
}

/// One slot per spilled vreg, reused across all its spilled ranges.
fn check_spill_slots(output: &Output) {
    let mut by_vreg: Vec<(VReg, SpillSlot)> = Vec::new();
    for range in &output.allocations {
        let Some(slot) = range.allocation.spill_slot() else {
            continue;
        };
        assert!(!slot.is_pending(), "{range} kept the pending sentinel");
        match by_vreg.iter().find(|(v, _)| *v == range.vreg) {
            Some(&(_, seen)) => assert_eq!(slot, seen, "{} changed slots", range.vreg),
            None => by_vreg.push((range.vreg, slot)),
        }
    }
    for (i, &(_, a)) in by_vreg.iter().enumerate() {
        for &(_, b) in &by_vreg[i + 1..] {
            assert_ne!(a, b, "two vregs share a spill slot");
        }
    }
}

fn check_all(output: &Output) {
    check_non_interference(output);
    check_stitches(output);
    check_spill_slots(output);
}

// =============================================================================
// Core Scenarios
// =============================================================================

#[test]
fn test_single_range() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 4, 10, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert!(output.stitches.is_empty());
    assert_eq!(output.stats.num_spilled, 0);
    check_all(&output);
}

#[test]
fn test_two_disjoint_ranges_share_r0() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 4, 10, &[]);
    add_range(&mut live, int_vreg(1), 6, 10, 5, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert_eq!(
        allocation_of(&output, int_vreg(1), 6),
        Allocation::Register(PReg::int(0))
    );
    assert!(output.stitches.is_empty());
    check_all(&output);
}

#[test]
fn test_two_overlapping_ranges() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 10, 20, &[]);
    add_range(&mut live, int_vreg(1), 4, 14, 5, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert_eq!(
        allocation_of(&output, int_vreg(1), 4),
        Allocation::Register(PReg::int(1))
    );
    assert!(output.stitches.is_empty());
    check_all(&output);
}

#[test]
fn test_eviction_refused_when_unprofitable() {
    let isa = int_isa(1);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 10, 3, &[]);
    add_range(&mut live, int_vreg(1), 4, 6, 20, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    // v1 pops first (cost 20) and may not be displaced by v0 (cost 3).
    assert_eq!(
        allocation_of(&output, int_vreg(1), 4),
        Allocation::Register(PReg::int(0))
    );
    // Whatever fragments of v0 overlap v1 are spilled into slot 0.
    let v0_spills: Vec<_> = output
        .allocations
        .iter()
        .filter(|a| a.vreg == int_vreg(0) && a.allocation.is_spill())
        .collect();
    assert!(!v0_spills.is_empty());
    for spilled in v0_spills {
        assert_eq!(spilled.allocation, Allocation::Spill(SpillSlot::at(0)));
    }
    check_coverage(&output, int_vreg(0), 0, 10);
    check_all(&output);
}

#[test]
fn test_split_across_expensive_interference() {
    let isa = int_isa(1);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 20, 5, &[10]);
    add_range(&mut live, int_vreg(1), 8, 12, 100, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(1), 8),
        Allocation::Register(PReg::int(0))
    );
    assert!(output.stats.num_splits >= 1);
    // The prefix of v0 clears the interference and keeps r0; the covered
    // middle is pushed to memory; a stitch marks each transition.
    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert!(output
        .stitches
        .iter()
        .any(|s| s.vreg == int_vreg(0) && s.from.is_register() && s.to.is_spill()));
    check_coverage(&output, int_vreg(0), 0, 20);
    check_all(&output);
}

#[test]
fn test_minimal_range_cannot_split() {
    let isa = int_isa(1);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 10, 50, &[]);
    add_range(&mut live, int_vreg(1), 4, 6, 2, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert_eq!(
        allocation_of(&output, int_vreg(1), 4),
        Allocation::Spill(SpillSlot::at(0))
    );
    assert_eq!(output.stats.num_splits, 0);
    check_all(&output);
}

// =============================================================================
// Structural Properties
// =============================================================================

#[test]
fn test_duplicate_range_is_rejected_at_ingest() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 10, 5, &[]);
    add_range(&mut live, int_vreg(1), 0, 10, 9, &[]);

    assert!(matches!(
        Allocator::new(&isa).run(live),
        Err(AllocError::DuplicateRange {
            class: RegClass::Int,
            ..
        })
    ));
}

#[test]
fn test_multi_range_bundle_keeps_one_allocation() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    let bundle = live.new_bundle(Allocation::Unassigned);
    live.push_range(bundle, int_vreg(0), cp(0), cp(3), 10, &[]);
    live.push_range(bundle, int_vreg(0), cp(8), cp(11), 10, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    let first = allocation_of(&output, int_vreg(0), 0);
    let second = allocation_of(&output, int_vreg(0), 8);
    assert_eq!(first, second);
    assert!(first.is_register());
    // Same location on both sides of the hole: nothing to stitch.
    assert!(output.stitches.is_empty());
    check_all(&output);
}

#[test]
fn test_pre_assigned_bundle_is_honored() {
    let isa = int_isa(2);
    let mut live = LiveMap::new();
    let pre = live.new_bundle(Allocation::Register(PReg::int(1)));
    live.push_range(pre, int_vreg(0), cp(0), cp(10), 1, &[]);
    add_range(&mut live, int_vreg(1), 2, 8, 50, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    // The competitor sees r1 claimed and lands on r0; the pre-assignment
    // survives untouched even at cost 1.
    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(1))
    );
    assert_eq!(
        allocation_of(&output, int_vreg(1), 2),
        Allocation::Register(PReg::int(0))
    );
    check_all(&output);
}

#[test]
fn test_evicted_pre_assignment_stays_covered() {
    let isa = int_isa(1);
    let mut live = LiveMap::new();
    let pre = live.new_bundle(Allocation::Register(PReg::int(0)));
    live.push_range(pre, int_vreg(0), cp(0), cp(10), 1, &[]);
    add_range(&mut live, int_vreg(1), 4, 6, 20, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(1), 4),
        Allocation::Register(PReg::int(0))
    );
    assert_eq!(output.stats.num_evictions, 1);
    check_coverage(&output, int_vreg(0), 0, 10);
    check_all(&output);
}

#[test]
fn test_float_and_int_classes_do_not_contend() {
    let mut isa = int_isa(1);
    isa.add(PReg::float(0));
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 10, 5, &[]);
    let f = VReg::new(1, ValueType::float(ScalarSize::B64));
    add_range(&mut live, f, 0, 10, 5, &[]);

    let output = Allocator::new(&isa).run(live).unwrap();

    assert_eq!(
        allocation_of(&output, int_vreg(0), 0),
        Allocation::Register(PReg::int(0))
    );
    assert_eq!(allocation_of(&output, f, 0), Allocation::Register(PReg::float(0)));
    check_all(&output);
}

// =============================================================================
// Determinism and Re-running
// =============================================================================

/// A fixed medium-pressure workload, deterministically scrambled.
fn pressure_workload() -> LiveMap {
    let mut live = LiveMap::new();
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let mut taken: Vec<(u32, u32)> = Vec::new();
    for id in 0..60 {
        // Re-roll exact interval collisions; ingest rejects them.
        let (start, len) = loop {
            let start = (next() % 120) as u32 * 2;
            let len = (next() % 16) as u32 * 2 + 2;
            if !taken.contains(&(start, len)) {
                taken.push((start, len));
                break (start, len);
            }
        };
        let cost = next() % 100 + 1;
        let use_point = start + next() as u32 % (len + 1);
        add_range(&mut live, int_vreg(id), start, start + len, cost, &[use_point]);
    }
    live
}

#[test]
fn test_pressure_workload_invariants() {
    let isa = int_isa(3);
    let output = Allocator::new(&isa).run(pressure_workload()).unwrap();

    assert_eq!(output.stats.num_ranges, 60);
    check_all(&output);
    // Rebuild the workload to recover each vreg's original extent.
    let inputs = Allocator::new(&int_isa(64))
        .run(pressure_workload())
        .unwrap();
    for range in &inputs.allocations {
        check_coverage(&output, range.vreg, range.start.raw(), range.end.raw());
    }
}

#[test]
fn test_rerun_is_deterministic() {
    let isa = int_isa(2);
    let first = Allocator::new(&isa).run(pressure_workload()).unwrap();
    let second = Allocator::new(&isa).run(pressure_workload()).unwrap();

    assert_eq!(first.allocations, second.allocations);
    assert_eq!(first.stitches, second.stitches);
    assert_eq!(first.stats, second.stats);
}

#[test]
fn test_no_interference_uses_first_register_only() {
    let isa = int_isa(3);
    let mut live = LiveMap::new();
    for id in 0..8 {
        let start = id * 10;
        add_range(&mut live, int_vreg(id), start, start + 6, 5, &[]);
    }

    let output = Allocator::new(&isa).run(live).unwrap();

    for range in &output.allocations {
        assert_eq!(range.allocation, Allocation::Register(PReg::int(0)));
    }
    assert!(output.stitches.is_empty());
}

#[test]
fn test_round_trip_preserves_transitions() {
    let isa = int_isa(1);
    let mut live = LiveMap::new();
    add_range(&mut live, int_vreg(0), 0, 20, 5, &[10]);
    add_range(&mut live, int_vreg(1), 8, 12, 100, &[]);
    let output = Allocator::new(&isa).run(live).unwrap();

    // Re-package the output as fresh unassigned singleton bundles.
    let mut again = LiveMap::new();
    for range in &output.allocations {
        let bundle = again.new_bundle(Allocation::Unassigned);
        again.push_range(
            bundle,
            range.vreg,
            range.start,
            range.end,
            range.spill_cost,
            &range.uses,
        );
    }
    let second = Allocator::new(&isa).run(again).unwrap();

    let transitions = |output: &Output| {
        let mut set: Vec<(VReg, CodePoint)> =
            output.stitches.iter().map(|s| (s.vreg, s.at)).collect();
        set.sort();
        set
    };
    assert_eq!(transitions(&output), transitions(&second));
    check_all(&second);
}
