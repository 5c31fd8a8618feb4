//! Loop-breaking state machine.
//!
//! When enabled, the controller watches block entries. On the first visit
//! of a retained loop's header it opens a frame; the body then runs
//! exactly twice, giving two observations of every header PHI and of
//! every address stored in the loop. On the third header visit the loop
//! is closed: each written location and each header PHI is rebound to a
//! fresh unconstrained symbol whose error is the closed-form
//! extrapolation over the trip count, and execution skips to the exit
//! block. Leaving the loop before the second header visit discards the
//! frame silently.

use crate::error_expr::{array_value, extrapolate, zero8};
use crate::error_state::ErrorState;
use drift_expr::{ArrayRef, ExprRef};
use drift_ir::{BlockId, TripCounts, ValueId};
use std::collections::BTreeMap;
use tracing::debug;

/// Interpreter-side rebinding primitives the controller needs when
/// closing a loop. Implemented by the host over its register file,
/// memory, and fresh-symbol counter.
pub trait HostBinder {
    /// Rebind an SSA result to a new symbolic value.
    fn bind_local(&mut self, value: ValueId, expr: ExprRef);
    /// Overwrite memory at a concrete address with a symbolic value.
    fn write_memory(&mut self, addr: u64, value: ExprRef);
    /// Allocate a fresh unconstrained symbol wide enough for `width_bits`,
    /// advancing the shared fresh-symbol counter.
    fn fresh_array(&mut self, width_bits: u32) -> ArrayRef;
}

/// Verdict of the block-entry hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntryAction {
    /// Dispatch the block normally.
    Continue,
    /// A loop was closed; skip the body and resume at the exit block.
    SkipToExit(BlockId),
}

/// Per-loop record while the loop is being broken.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    /// Header-entry instruction; the frame key.
    pub header: ValueId,
    pub trip_count: i64,
    pub exit: BlockId,
    /// Last stored value per address written during this frame.
    pub writes: BTreeMap<u64, ExprRef>,
    /// Error already stored at each address when the frame's first store
    /// to it happened; the loop-entry error of that location.
    pub init_write_error: BTreeMap<u64, ExprRef>,
    /// Header PHIs observed in this loop with their captured errors.
    /// Holds the entry error after the first visit and the
    /// end-of-first-iteration error after the second.
    pub phi_error: BTreeMap<ValueId, ExprRef>,
    pub phi_widths: BTreeMap<ValueId, u32>,
    /// Counts down from 2 on each header visit; 1 means the second
    /// iteration is running, 0 closes the loop.
    pub iterations_left: u8,
}

/// Per-state loop-breaking controller: a LIFO stack of open frames plus
/// the staging map header PHIs are captured through.
#[derive(Debug, Clone, Default)]
pub struct LoopController {
    enabled: bool,
    frames: Vec<LoopFrame>,
    staged_phi: BTreeMap<ValueId, (ExprRef, u32)>,
}

impl LoopController {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether any loop is currently being broken.
    pub fn in_loop(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Capture the just-computed error of a header PHI. Called by the
    /// dispatch glue whenever a PHI of a retained loop header executes.
    pub fn stage_phi(&mut self, phi: ValueId, error: ExprRef, width: u32) {
        if self.enabled {
            self.staged_phi.insert(phi, (error, width));
        }
    }

    /// Record a store observed while a frame is open. The store is
    /// attributed to the frame of the loop whose body contains the
    /// executing block (`header_for`, innermost wins); stores dispatched
    /// from blocks outside any retained loop body, such as inside a
    /// function called from the loop, are not loop writes. `prior_error`
    /// is the error stored at the address before this store.
    pub fn record_store(
        &mut self,
        block: BlockId,
        trips: &TripCounts,
        addr: u64,
        value: ExprRef,
        prior_error: Option<ExprRef>,
    ) {
        let header = match trips.header_for(block) {
            Some(h) => h,
            None => return,
        };
        if let Some(frame) = self.frames.iter_mut().rev().find(|f| f.header == header) {
            frame.writes.insert(addr, value);
            frame
                .init_write_error
                .entry(addr)
                .or_insert_with(|| prior_error.unwrap_or_else(zero8));
        }
    }

    /// Block-entry hook: drives the per-header state machine.
    pub fn on_block_entry(
        &mut self,
        inst: ValueId,
        trips: &TripCounts,
        errors: &mut ErrorState,
        host: &mut dyn HostBinder,
    ) -> BlockEntryAction {
        if !self.enabled {
            return BlockEntryAction::Continue;
        }

        // Arriving at a retained loop's exit block while its frame is
        // still open means the loop left early; discard without summary.
        if let Some(header) = trips.first_of_exit(inst) {
            if let Some(pos) = self.frames.iter().rposition(|f| f.header == header) {
                debug!(
                    discarded = self.frames.len() - pos,
                    "early loop exit, discarding open frame(s)"
                );
                self.frames.truncate(pos);
                return BlockEntryAction::Continue;
            }
        }

        if !trips.is_header_entry(inst) {
            return BlockEntryAction::Continue;
        }

        let action = if let Some(pos) = self.frames.iter().rposition(|f| f.header == inst) {
            // Inner frames above a revisited header are stale.
            self.frames.truncate(pos + 1);
            let frame = self.frames.last_mut().expect("frame at rposition");
            frame.iterations_left -= 1;
            if frame.iterations_left == 1 {
                // First iteration complete; re-capture each header PHI at
                // its end-of-first-iteration error so the close below
                // extrapolates between consecutive iterations.
                for (phi, captured) in frame.phi_error.iter_mut() {
                    *captured = errors.retrieve_error(*phi).unwrap_or_else(zero8);
                }
                debug!(header = %inst, "first loop iteration complete");
                BlockEntryAction::Continue
            } else {
                let frame = self.frames.pop().expect("closing frame");
                Self::close(frame, errors, host)
            }
        } else if let Some(info) = trips.trip_count_of(inst) {
            let mut frame = LoopFrame {
                header: inst,
                trip_count: info.trip_count,
                exit: info.exit,
                writes: BTreeMap::new(),
                init_write_error: BTreeMap::new(),
                phi_error: BTreeMap::new(),
                phi_widths: BTreeMap::new(),
                iterations_left: 2,
            };
            for (phi, (error, width)) in std::mem::take(&mut self.staged_phi) {
                frame.phi_error.insert(phi, error);
                frame.phi_widths.insert(phi, width);
            }
            debug!(header = %inst, trip_count = frame.trip_count, "opened loop frame");
            self.frames.push(frame);
            BlockEntryAction::Continue
        } else {
            BlockEntryAction::Continue
        };

        // Crossing any retained header re-stages PHI capture, so nested
        // loops stage cleanly.
        self.staged_phi.clear();
        action
    }

    /// Apply the closed-form summary and rebind everything the loop
    /// wrote to fresh symbols.
    fn close(
        frame: LoopFrame,
        errors: &mut ErrorState,
        host: &mut dyn HostBinder,
    ) -> BlockEntryAction {
        let k = frame.trip_count;

        for (addr, last_value) in &frame.writes {
            let e_init = frame
                .init_write_error
                .get(addr)
                .cloned()
                .unwrap_or_else(zero8);
            let e_end = errors.stored_error_at(*addr).unwrap_or_else(zero8);
            let loop_error = extrapolate(k, &e_init, &e_end);
            let width = last_value.width();
            let fresh = host.fresh_array(width);
            host.write_memory(*addr, array_value(&fresh, width));
            errors.set_stored_error(*addr, loop_error);
        }

        for (phi, first_iter_error) in &frame.phi_error {
            let e_end = errors.retrieve_error(*phi).unwrap_or_else(zero8);
            let predicted = extrapolate(k, first_iter_error, &e_end);
            let width = frame.phi_widths.get(phi).copied().unwrap_or(64);
            let fresh = host.fresh_array(width);
            host.bind_local(*phi, array_value(&fresh, width));
            errors.set_value_error(*phi, predicted);
        }

        debug!(
            header = %frame.header,
            trip_count = k,
            writes = frame.writes.len(),
            phis = frame.phi_error.len(),
            "closed loop, skipping to exit block"
        );
        BlockEntryAction::SkipToExit(frame.exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_expr::{array_value, extrapolate};
    use drift_expr::{ArrayCache, Expr};
    use drift_ir::{parse_module, Module};

    /// Minimal host: fresh symbols out of its own cache, binds recorded.
    struct MockHost {
        cache: ArrayCache,
        fresh_id: u64,
        bound: Vec<(ValueId, ExprRef)>,
        written: Vec<(u64, ExprRef)>,
    }

    impl MockHost {
        fn new() -> Self {
            Self {
                cache: ArrayCache::new(),
                fresh_id: 0,
                bound: Vec::new(),
                written: Vec::new(),
            }
        }
    }

    impl HostBinder for MockHost {
        fn bind_local(&mut self, value: ValueId, expr: ExprRef) {
            self.bound.push((value, expr));
        }
        fn write_memory(&mut self, addr: u64, value: ExprRef) {
            self.written.push((addr, value));
        }
        fn fresh_array(&mut self, width_bits: u32) -> ArrayRef {
            let name = format!("__fresh_sym_{}", self.fresh_id);
            self.fresh_id += 1;
            self.cache.create(&name, (width_bits as u64 + 7) / 8)
        }
    }

    const LOOP: &str = r#"
fn @main() {
entry:
  br header
header:
  %i = phi i32, [ 0, entry ], [ %inc, body ]
  %c = icmp slt i32, %i, 3
  cbr %c, body, exit
body:
  %inc = add i32, %i, 1
  br header
exit:
  ret
}
"#;

    fn setup() -> (Module, TripCounts, ValueId, ValueId, ValueId) {
        let module = parse_module(LOOP).unwrap();
        let trips = TripCounts::analyze(&module);
        let f = &module.functions[0];
        let phi = f.blocks[1].insts[0].id;
        let header_entry = f.blocks[1].entry_inst().unwrap().id;
        let exit_entry = f.blocks[3].entry_inst().unwrap().id;
        (module, trips, phi, header_entry, exit_entry)
    }

    fn err_read(cache: &mut ArrayCache, idx: u64) -> ExprRef {
        let arr = cache.create("_unspecified_error_x", 4);
        Expr::read(arr, Expr::constant(32, idx))
    }

    #[test]
    fn test_disabled_controller_is_inert() {
        let (_module, trips, phi, header_entry, _) = setup();
        let mut ctl = LoopController::new(false);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();
        ctl.stage_phi(phi, zero8(), 32);
        let action = ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert_eq!(action, BlockEntryAction::Continue);
        assert_eq!(ctl.depth(), 0);
    }

    #[test]
    fn test_three_visits_close_loop_with_phi_extrapolation() {
        let (_module, trips, phi, header_entry, _) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();
        let mut cache = ArrayCache::new();

        // Visit 1: PHI carries its entry error.
        ctl.stage_phi(phi, zero8(), 32);
        assert_eq!(
            ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host),
            BlockEntryAction::Continue
        );
        assert_eq!(ctl.depth(), 1);

        // Iteration 1 runs; the PHI's error after it is e1.
        let e1 = err_read(&mut cache, 0);
        errors.set_value_error(phi, e1.clone());
        ctl.stage_phi(phi, e1.clone(), 32);
        assert_eq!(
            ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host),
            BlockEntryAction::Continue
        );

        // Iteration 2 runs; the PHI's error after it is e2.
        let e2 = Expr::add(e1.clone(), err_read(&mut cache, 1));
        errors.set_value_error(phi, e2.clone());
        ctl.stage_phi(phi, e2.clone(), 32);
        let action = ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert_eq!(
            action,
            BlockEntryAction::SkipToExit(BlockId { func: 0, block: 3 })
        );
        assert_eq!(ctl.depth(), 0);

        // PHI error is now the closed form over (e1, e2), and the PHI is
        // rebound to a fresh 32-bit symbol.
        assert_eq!(errors.retrieve_error(phi), Some(extrapolate(3, &e1, &e2)));
        assert_eq!(host.bound.len(), 1);
        assert_eq!(host.bound[0].0, phi);
        assert_eq!(host.bound[0].1.width(), 32);
    }

    #[test]
    fn test_write_replay_binds_fresh_symbol() {
        let (_module, trips, phi, header_entry, _) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();
        let mut cache = ArrayCache::new();

        // Stores happen in the loop body block.
        let body = BlockId { func: 0, block: 2 };

        ctl.stage_phi(phi, zero8(), 32);
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);

        // Iteration 1 stores at 0x40 with error s1 (entry error zero).
        let s1 = err_read(&mut cache, 0);
        let stored1 = Expr::zext(err_read(&mut cache, 0), 32);
        errors.set_stored_error(0x40, s1.clone());
        ctl.record_store(body, &trips, 0x40, stored1, None);
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);

        // Iteration 2 stores again with error s2.
        let s2 = Expr::add(s1.clone(), err_read(&mut cache, 1));
        let stored2 = Expr::zext(err_read(&mut cache, 1), 32);
        errors.set_stored_error(0x40, s2.clone());
        ctl.record_store(body, &trips, 0x40, stored2, Some(s1.clone()));
        let action = ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert!(matches!(action, BlockEntryAction::SkipToExit(_)));

        // Stored error is extrapolated from the pre-loop error (zero).
        assert_eq!(
            errors.stored_error_at(0x40),
            Some(extrapolate(3, &zero8(), &s2))
        );
        // Memory rebound to a fresh symbol of the stored width.
        assert_eq!(host.written.len(), 1);
        assert_eq!(host.written[0].0, 0x40);
        assert_eq!(host.written[0].1.width(), 32);
        let fresh = host.cache.get("__fresh_sym_0").unwrap();
        assert_eq!(host.written[0].1, array_value(&fresh, 32));
    }

    #[test]
    fn test_store_outside_loop_body_is_not_a_loop_write() {
        let (_module, trips, phi, header_entry, _) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();

        ctl.stage_phi(phi, zero8(), 32);
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);

        // A store dispatched from a block outside the loop body (for
        // example inside a function called from the loop) must not be
        // folded into the open frame.
        let outside = BlockId { func: 0, block: 0 };
        ctl.record_store(outside, &trips, 0x80, Expr::constant(32, 1), None);

        errors.set_value_error(phi, zero8());
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        errors.set_value_error(phi, zero8());
        let action = ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert!(matches!(action, BlockEntryAction::SkipToExit(_)));

        // Nothing was replayed for the outside store: no fresh symbol
        // written and no extrapolated stored error at its address.
        assert!(host.written.is_empty());
        assert!(errors.stored_error_at(0x80).is_none());
    }

    #[test]
    fn test_early_exit_discards_frame() {
        let (_module, trips, phi, header_entry, exit_entry) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();

        ctl.stage_phi(phi, zero8(), 32);
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert_eq!(ctl.depth(), 1);

        let action = ctl.on_block_entry(exit_entry, &trips, &mut errors, &mut host);
        assert_eq!(action, BlockEntryAction::Continue);
        assert_eq!(ctl.depth(), 0);
        assert!(host.bound.is_empty());
        assert!(host.written.is_empty());
    }

    #[test]
    fn test_exit_entry_without_frame_is_ignored() {
        let (_module, trips, _phi, _header, exit_entry) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();
        let action = ctl.on_block_entry(exit_entry, &trips, &mut errors, &mut host);
        assert_eq!(action, BlockEntryAction::Continue);
    }

    #[test]
    fn test_fork_isolation() {
        let (_module, trips, phi, header_entry, _) = setup();
        let mut ctl = LoopController::new(true);
        let mut errors = ErrorState::new();
        let mut host = MockHost::new();
        let mut cache = ArrayCache::new();

        ctl.stage_phi(phi, zero8(), 32);
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);

        // Fork mid-loop: both sides carry the frame.
        let mut ctl2 = ctl.clone();
        let mut errors2 = errors.clone();

        let e1 = err_read(&mut cache, 0);
        errors.set_value_error(phi, e1.clone());
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        errors.set_value_error(phi, e1.clone());
        ctl.on_block_entry(header_entry, &trips, &mut errors, &mut host);
        assert_eq!(ctl.depth(), 0);

        // The sibling still has its open frame and no summary.
        assert_eq!(ctl2.depth(), 1);
        assert_eq!(errors2.retrieve_error(phi), None);

        // It can close independently.
        let e1b = err_read(&mut cache, 2);
        errors2.set_value_error(phi, e1b.clone());
        ctl2.on_block_entry(header_entry, &trips, &mut errors2, &mut host);
        errors2.set_value_error(phi, e1b.clone());
        let action = ctl2.on_block_entry(header_entry, &trips, &mut errors2, &mut host);
        assert!(matches!(action, BlockEntryAction::SkipToExit(_)));
    }
}
