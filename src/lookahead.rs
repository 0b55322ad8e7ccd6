//! GPU lookahead: downscaled motion estimation per frame and the backward
//! cost-propagation pass over the lookahead window.
//!
//! Each frame's motion-estimation kernel writes its own downscaled luma into
//! the frame's lookahead surface, and later frames search against it. A task
//! moves `NotSubmitted -> Submitted -> Queried -> Released`; the mb-data and
//! curbe slots live exactly between submission and release.
//!
//! Propagation follows the macroblock-tree idea: every inter block hands
//! the fraction of its cost that prediction saved to the reference area it
//! predicted from, so frames that many later frames lean on get a lower QP.

use tracing::{debug, trace};

use crate::device::{
    BlockStats, CurbeBlock, GpuHandle, Kernel, KernelArgs, KernelOutput, MotionVector, Prediction,
};
use crate::dpb::DpbEntry;
use crate::pipeline::Pipeline;
use crate::queue::QueueKind;
use crate::scheduler::StageOutcome;
use crate::task::{LookaheadPhase, LookaheadResult, Submission, TaskId};
use crate::{PipelineConfig, PipelineError, PoolKind};

/// Lookahead block edge in downscaled pixels.
pub const BLOCK_SIZE: u32 = 16;
/// One block edge in quarter-pel motion vector units.
pub const BLOCK_MV: i32 = BLOCK_SIZE as i32 * 4;

/// Block layout of the downscaled lookahead surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrid {
    pub cols: u32,
    pub rows: u32,
}

impl BlockGrid {
    pub fn for_config(config: &PipelineConfig) -> Self {
        let ds = config.lookahead.downscale.max(1);
        let width = config.dims.width.get().div_ceil(ds);
        let height = config.dims.height.get().div_ceil(ds);
        Self {
            cols: width.div_ceil(BLOCK_SIZE),
            rows: height.div_ceil(BLOCK_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, col: i32, row: i32) -> Option<usize> {
        let inside = (0..self.cols as i32).contains(&col) && (0..self.rows as i32).contains(&row);
        inside.then(|| row as usize * self.cols as usize + col as usize)
    }
}

// Mode cost multipliers in lambda units: intra16, intra8, intra4, inter16x16,
// inter16x8, inter8x16, inter8x8, skip.
const MODE_WEIGHTS: [u32; 8] = [4, 6, 10, 1, 2, 2, 3, 0];

fn cost_byte(cost: u32) -> u8 {
    cost.min(u32::from(u8::MAX)) as u8
}

pub fn build_curbe(qp: u8, grid: BlockGrid, bidirectional: bool) -> CurbeBlock {
    let lambda = (0.85 * 2f64.powf((f64::from(qp) - 12.0) / 3.0)).round().max(1.0) as u32;
    let (search_width, search_height) = if bidirectional { (32, 32) } else { (48, 40) };
    CurbeBlock {
        qp,
        lambda,
        search_width,
        search_height,
        mode_costs: std::array::from_fn(|i| cost_byte(lambda * MODE_WEIGHTS[i])),
        // Cost per motion vector magnitude class.
        mv_costs: std::array::from_fn(|i| cost_byte(lambda * (2 * i as u32 + 1) / 4)),
        block_cols: grid.cols,
        block_rows: grid.rows,
        bidirectional,
    }
}

fn reference_surface(p: &Pipeline, entry: Option<&DpbEntry>) -> Option<GpuHandle> {
    let slot = entry?.lookahead?;
    Some(p.pools.gpu_handle(PoolKind::Lookahead, slot))
}

/// LOOKAHEAD_START: queue motion estimation for the oldest analysed frame.
pub(crate) fn submit(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    if !p.config.lookahead.enabled {
        let moved = p.queues.move_front(QueueKind::ScdDone, QueueKind::LookaheadFinished);
        return Ok(match moved {
            Some(_) => StageOutcome::Advanced,
            None => StageOutcome::Idle,
        });
    }
    let Some(id) = p.queues.front(QueueKind::ScdDone) else {
        return Ok(StageOutcome::Idle);
    };
    let task = &mut p.tasks[id.0];
    if !p.pools.acquire_all(id, &[PoolKind::MbData, PoolKind::Curbe], &mut task.resources) {
        return Ok(StageOutcome::Deferred);
    }

    let task = &p.tasks[id.0];
    let (display_order, frame_type) = (task.display_order, task.frame_type);
    let (forward, backward) = if frame_type.is_intra() {
        (None, None)
    } else {
        (
            reference_surface(p, task.dpb.forward()),
            reference_surface(p, task.dpb.backward()),
        )
    };
    let slot = |kind| match task.resources.get(kind) {
        Some(slot) => p.pools.gpu_handle(kind, slot),
        None => panic!("task {} lacks a {kind} slot at lookahead submit", id.0),
    };
    let curbe_buffer = slot(PoolKind::Curbe);
    let args = KernelArgs {
        target: Some(slot(PoolKind::Lookahead)),
        forward,
        backward,
        output: Some(slot(PoolKind::MbData)),
        curbe: Some(curbe_buffer),
        ..KernelArgs::new(display_order, p.raw_gpu(id))
    };
    let curbe = build_curbe(
        p.brc.preview_qp(frame_type),
        p.grid,
        forward.is_some() && backward.is_some(),
    );

    let result = p
        .devices
        .gpu
        .write_curbe(curbe_buffer, &curbe)
        .and_then(|()| p.devices.gpu.submit_kernel(Kernel::MotionEstimation, &args));
    let event = match result {
        Ok(event) => event,
        Err(err) => {
            release_scratch(p, id);
            return Err(err);
        }
    };
    p.tasks[id.0].lookahead = LookaheadPhase::Submitted(Submission::new(event));
    p.counters.lookahead_submissions += 1;
    p.queues.move_task(id, QueueKind::ScdDone, QueueKind::LookaheadStarted);
    debug!(display_order, lambda = curbe.lambda, "lookahead submitted");
    Ok(StageOutcome::Advanced)
}

fn release_scratch(p: &mut Pipeline, id: TaskId) {
    let resources = &mut p.tasks[id.0].resources;
    for kind in [PoolKind::MbData, PoolKind::Curbe] {
        if let Some(slot) = resources.take(kind) {
            p.pools.release(kind, slot);
        }
    }
}

/// LOOKAHEAD_WAIT: collect the oldest motion-estimation result.
pub(crate) fn wait(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::LookaheadStarted) else {
        return Ok(StageOutcome::Idle);
    };
    let display_order = p.tasks[id.0].display_order;
    let LookaheadPhase::Submitted(submission) = p.tasks[id.0].lookahead else {
        panic!("task {} waits on lookahead it never submitted", id.0);
    };
    let Some(output) = p.poll_gpu(submission, "lookahead", display_order)? else {
        return Ok(StageOutcome::Deferred);
    };
    p.tasks[id.0].lookahead = LookaheadPhase::Queried;
    let stats = match output {
        KernelOutput::Motion(stats) if stats.len() == p.grid.len() => stats,
        KernelOutput::Motion(stats) => {
            return Err(PipelineError::Gpu(format!(
                "motion estimation returned {} blocks, expected {}",
                stats.len(),
                p.grid.len()
            )));
        }
        _ => {
            return Err(PipelineError::Gpu(
                "motion estimation produced a non-motion output".to_string(),
            ));
        }
    };

    release_scratch(p, id);
    let task = &mut p.tasks[id.0];
    // The downscaled picture stays alive through the DPB for later frames.
    if let Some(slot) = task.resources.take(PoolKind::Lookahead) {
        p.pools.release(PoolKind::Lookahead, slot);
    }
    for entry in task.dpb.entries() {
        if let Some(slot) = entry.lookahead {
            p.pools.release(PoolKind::Lookahead, slot);
        }
    }
    let blocks = stats.len();
    task.la_result = Some(LookaheadResult {
        stats,
        propagate_in: vec![0.0; blocks],
        qp_offset: 0,
    });
    task.lookahead = LookaheadPhase::Released;
    p.queues.move_task(id, QueueKind::LookaheadStarted, QueueKind::LookaheadFinished);
    debug!(display_order, blocks, "lookahead done");
    Ok(StageOutcome::Advanced)
}

/// Whether the head of the lookahead window may leave it.
pub(crate) fn window_ready(p: &Pipeline) -> bool {
    let finished = p.queues.len(QueueKind::LookaheadFinished);
    if finished == 0 {
        return false;
    }
    if !p.config.lookahead.enabled || finished > p.config.lookahead.depth || p.starved {
        return true;
    }
    let upstream_empty = [
        QueueKind::Incoming,
        QueueKind::Reordering,
        QueueKind::Scd,
        QueueKind::ScdDone,
        QueueKind::LookaheadStarted,
    ]
    .into_iter()
    .all(|queue| p.queues.is_empty(queue));
    p.eos && upstream_empty
}

/// Distributes `amount` onto the up to four blocks the displaced block
/// overlaps, weighted by overlap area.
fn splat(grid: BlockGrid, target: &mut [f32], block: usize, mv: MotionVector, amount: f32) {
    let col = (block % grid.cols as usize) as i32;
    let row = (block / grid.cols as usize) as i32;
    let x = col * BLOCK_MV + i32::from(mv.x);
    let y = row * BLOCK_MV + i32::from(mv.y);
    let (bx, by) = (x.div_euclid(BLOCK_MV), y.div_euclid(BLOCK_MV));
    let fx = x.rem_euclid(BLOCK_MV) as f32 / BLOCK_MV as f32;
    let fy = y.rem_euclid(BLOCK_MV) as f32 / BLOCK_MV as f32;
    for (dx, dy, weight) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        if weight <= 0.0 {
            continue;
        }
        if let Some(index) = grid.index(bx + dx, by + dy) {
            target[index] += amount * weight;
        }
    }
}

/// Cost of block `stats` that prediction saved, including what later frames
/// already propagated into it.
fn propagate_amount(stats: &BlockStats, propagate_in: f32) -> f32 {
    let intra = stats.intra_cost.max(1) as f32;
    let inter = (stats.inter_cost as f32).min(intra);
    (intra + propagate_in) * (1.0 - inter / intra)
}

/// Backward pass over every frame resident in the lookahead window, then the
/// QP offset of the window head.
pub(crate) fn propagate(p: &mut Pipeline) {
    let window: Vec<TaskId> = p.queues.iter(QueueKind::LookaheadFinished).collect();
    let Some(&head) = window.first() else {
        return;
    };
    for &id in &window {
        if let Some(result) = p.tasks[id.0].la_result.as_mut() {
            result.propagate_in.iter_mut().for_each(|v| *v = 0.0);
        }
    }
    let position = |p: &Pipeline, entry: Option<&DpbEntry>| {
        let order = entry?.encode_order;
        window
            .iter()
            .copied()
            .find(|id| p.tasks[id.0].encode_order == Some(order))
    };

    for &id in window.iter().rev() {
        let task = &p.tasks[id.0];
        if task.frame_type.is_intra() || task.scene_cut {
            continue;
        }
        let forward = position(&*p, task.dpb.forward());
        let backward = position(&*p, task.dpb.backward());
        if forward.is_none() && backward.is_none() {
            continue;
        }
        let Some(source) = p.tasks[id.0].la_result.take() else {
            continue;
        };
        for (block, (stats, &inflow)) in source.stats.iter().zip(&source.propagate_in).enumerate() {
            let amount = propagate_amount(stats, inflow);
            if amount <= 0.0 {
                continue;
            }
            let targets = match stats.prediction {
                Prediction::Intra => continue,
                Prediction::Forward => [(forward, stats.mv_forward, amount), (None, stats.mv_backward, 0.0)],
                Prediction::Backward => [(backward, stats.mv_backward, amount), (None, stats.mv_forward, 0.0)],
                Prediction::Bidirectional => [
                    (forward, stats.mv_forward, amount / 2.0),
                    (backward, stats.mv_backward, amount / 2.0),
                ],
            };
            for (target, mv, share) in targets {
                let Some(target) = target else { continue };
                if let Some(result) = p.tasks[target.0].la_result.as_mut() {
                    splat(p.grid, &mut result.propagate_in, block, mv, share);
                }
            }
        }
        p.tasks[id.0].la_result = Some(source);
    }

    let options = &p.config.lookahead;
    let head_task = &mut p.tasks[head.0];
    let Some(result) = head_task.la_result.as_mut() else {
        return;
    };
    if result.stats.is_empty() {
        return;
    }
    let mean = result
        .stats
        .iter()
        .zip(&result.propagate_in)
        .map(|(stats, &inflow)| {
            let intra = stats.intra_cost.max(1) as f32;
            ((intra + inflow) / intra).log2()
        })
        .sum::<f32>()
        / result.stats.len() as f32;
    let max = f32::from(options.max_qp_offset);
    result.qp_offset = (-options.propagation_strength * mean).round().clamp(-max, 0.0) as i8;
    trace!(
        display_order = head_task.display_order,
        window = window.len(),
        qp_offset = result.qp_offset,
        "cost propagated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Codec, Dimensions};

    fn grid() -> BlockGrid {
        BlockGrid { cols: 4, rows: 3 }
    }

    #[test]
    fn grid_rounds_partial_blocks_up() {
        let cfg = PipelineConfig::new(Codec::H264, Dimensions::new(1920, 1080).unwrap(), 30);
        let grid = BlockGrid::for_config(&cfg);
        assert_eq!((grid.cols, grid.rows), (30, 17));
        assert_eq!(grid.len(), 510);
    }

    #[test]
    fn curbe_lambda_grows_with_qp() {
        let low = build_curbe(22, grid(), false);
        let high = build_curbe(40, grid(), true);
        assert!(high.lambda > low.lambda);
        assert_eq!(low.mode_costs[7], 0);
        assert!(high.bidirectional);
        assert_eq!((low.block_cols, low.block_rows), (4, 3));
    }

    #[test]
    fn zero_motion_splats_onto_one_block() {
        let mut target = vec![0.0; grid().len()];
        splat(grid(), &mut target, 5, MotionVector::default(), 8.0);
        assert_eq!(target[5], 8.0);
        assert_eq!(target.iter().sum::<f32>(), 8.0);
    }

    #[test]
    fn half_block_motion_splits_four_ways() {
        let mut target = vec![0.0; grid().len()];
        let mv = MotionVector {
            x: (BLOCK_MV / 2) as i16,
            y: (BLOCK_MV / 2) as i16,
        };
        splat(grid(), &mut target, 0, mv, 8.0);
        for index in [0, 1, 4, 5] {
            assert_eq!(target[index], 2.0);
        }
    }

    #[test]
    fn motion_off_the_frame_is_dropped() {
        let mut target = vec![0.0; grid().len()];
        let mv = MotionVector {
            x: -(BLOCK_MV as i16) * 2,
            y: 0,
        };
        splat(grid(), &mut target, 0, mv, 8.0);
        assert_eq!(target.iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn amount_scales_with_inter_savings() {
        let block = BlockStats {
            intra_cost: 100,
            inter_cost: 25,
            prediction: Prediction::Forward,
            mv_forward: MotionVector::default(),
            mv_backward: MotionVector::default(),
        };
        assert_eq!(propagate_amount(&block, 0.0), 75.0);
        assert_eq!(propagate_amount(&block, 100.0), 150.0);
        let worse = BlockStats {
            inter_cost: 400,
            ..block
        };
        assert_eq!(propagate_amount(&worse, 10.0), 0.0);
    }
}
