use std::time::Instant;

use crate::device::{BlockStats, GpuEvent};
use crate::dpb::DpbView;
use crate::pool::SlotId;
use crate::{ControlHints, EncodedUnit, FrameType, PoolKind, Timestamp90k};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

/// Slots a task currently holds, at most one per pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskResources {
    pub raw: Option<SlotId>,
    pub lookahead: Option<SlotId>,
    pub mb_data: Option<SlotId>,
    pub curbe: Option<SlotId>,
    pub recon: Option<SlotId>,
    pub bitstream: Option<SlotId>,
}

impl TaskResources {
    pub fn get(&self, pool: PoolKind) -> Option<SlotId> {
        match pool {
            PoolKind::Raw => self.raw,
            PoolKind::Lookahead => self.lookahead,
            PoolKind::MbData => self.mb_data,
            PoolKind::Curbe => self.curbe,
            PoolKind::Recon => self.recon,
            PoolKind::Bitstream => self.bitstream,
        }
    }

    pub fn set(&mut self, pool: PoolKind, slot: Option<SlotId>) {
        let entry = match pool {
            PoolKind::Raw => &mut self.raw,
            PoolKind::Lookahead => &mut self.lookahead,
            PoolKind::MbData => &mut self.mb_data,
            PoolKind::Curbe => &mut self.curbe,
            PoolKind::Recon => &mut self.recon,
            PoolKind::Bitstream => &mut self.bitstream,
        };
        debug_assert!(
            slot.is_none() || entry.is_none(),
            "task already owns a {pool} slot"
        );
        *entry = slot;
    }

    pub fn take(&mut self, pool: PoolKind) -> Option<SlotId> {
        let slot = self.get(pool);
        self.set(pool, None);
        slot
    }

    pub fn is_empty(&self) -> bool {
        PoolKind::ALL.iter().all(|&pool| self.get(pool).is_none())
    }
}

/// A live GPU or hardware submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub event: GpuEvent,
    pub submitted_at: Instant,
}

impl Submission {
    pub fn new(event: GpuEvent) -> Self {
        Self {
            event,
            submitted_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookaheadPhase {
    #[default]
    NotSubmitted,
    Submitted(Submission),
    Queried,
    Released,
}

#[derive(Debug, Clone, Default)]
pub struct LookaheadResult {
    pub stats: Vec<BlockStats>,
    pub propagate_in: Vec<f32>,
    pub qp_offset: i8,
}

impl LookaheadResult {
    /// Sum of the cheaper prediction per block, the rate model's complexity input.
    pub fn complexity(&self, intra_only: bool) -> u64 {
        self.stats
            .iter()
            .map(|block| {
                let cost = if intra_only {
                    block.intra_cost
                } else {
                    block.intra_cost.min(block.inter_cost)
                };
                u64::from(cost)
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrcPhase {
    #[default]
    NotEncoded,
    EncodedOnce,
    RecodeRequested,
    Reencoded,
    Accepted,
    PanicSkip,
}

#[derive(Debug, Clone, Default)]
pub struct BrcState {
    pub phase: BrcPhase,
    pub qp: u8,
    pub recode_count: u32,
    pub panic: bool,
    pub min_bits: u64,
    pub max_bits: u64,
    /// Every QP this task was submitted with, in order.
    pub qp_history: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeProgress {
    pub submitted_at: Option<Instant>,
    pub fields_done: u8,
    pub bytes: [usize; 2],
    pub resubmits: u32,
}

impl EncodeProgress {
    pub fn total_bytes(&self) -> usize {
        self.bytes.iter().sum()
    }
}

/// Per-frame state from acceptance to emission.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub display_order: u64,
    pub encode_order: Option<u64>,
    pub pts_90k: Option<Timestamp90k>,
    pub hints: ControlHints,
    pub frame_type: FrameType,
    pub gop_position: u32,
    pub pyramid_layer: u8,
    pub resources: TaskResources,
    pub dpb: DpbView,
    pub analysis: Option<Submission>,
    pub lookahead: LookaheadPhase,
    pub la_result: Option<LookaheadResult>,
    pub scene_cut: bool,
    pub luma_mean: Option<f32>,
    pub weighted_prediction: bool,
    pub brc: BrcState,
    pub encode: EncodeProgress,
    pub output: Option<EncodedUnit>,
}

impl Task {
    pub fn empty(id: TaskId) -> Self {
        Self {
            id,
            display_order: 0,
            encode_order: None,
            pts_90k: None,
            hints: ControlHints::default(),
            frame_type: FrameType::P,
            gop_position: 0,
            pyramid_layer: 0,
            resources: TaskResources::default(),
            dpb: DpbView::default(),
            analysis: None,
            lookahead: LookaheadPhase::default(),
            la_result: None,
            scene_cut: false,
            luma_mean: None,
            weighted_prediction: false,
            brc: BrcState::default(),
            encode: EncodeProgress::default(),
            output: None,
        }
    }

    pub fn reset(&mut self) {
        debug_assert!(
            self.resources.is_empty(),
            "task {} reset while holding slots",
            self.display_order
        );
        *self = Self::empty(self.id);
    }

    /// Whether `encode_order` appears in this task's reference lists.
    pub fn references(&self, encode_order: u64) -> bool {
        self.dpb
            .entries()
            .any(|entry| entry.encode_order == encode_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_track_one_slot_per_pool() {
        let mut res = TaskResources::default();
        assert!(res.is_empty());
        res.set(PoolKind::Raw, Some(SlotId(3)));
        res.set(PoolKind::Recon, Some(SlotId(1)));
        assert_eq!(res.get(PoolKind::Raw), Some(SlotId(3)));
        assert_eq!(res.take(PoolKind::Raw), Some(SlotId(3)));
        assert_eq!(res.take(PoolKind::Raw), None);
        assert!(!res.is_empty());
        res.take(PoolKind::Recon);
        assert!(res.is_empty());
    }

    #[test]
    fn reset_returns_task_to_empty() {
        let mut task = Task::empty(TaskId(4));
        task.display_order = 9;
        task.brc.recode_count = 2;
        task.reset();
        assert_eq!(task.id, TaskId(4));
        assert_eq!(task.display_order, 0);
        assert_eq!(task.brc.recode_count, 0);
    }
}
