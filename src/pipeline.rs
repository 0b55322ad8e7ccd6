//! The pipeline state: every queue, pool and model one encode instance owns,
//! plus the tick loop that drives the stage handlers.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::analysis::AnalysisHistory;
use crate::brc::RateController;
use crate::device::{Devices, EventStatus, GpuHandle, KernelOutput, SurfaceHandle};
use crate::dpb::{DpbEntry, DpbManager};
use crate::gop::GopStructure;
use crate::lookahead::BlockGrid;
use crate::pool::PoolStats;
use crate::queue::{QueueDepth, QueueKind, QueueManager};
use crate::reorder::{PendingFrame, Reorderer};
use crate::resources::{PoolPlan, PoolSet};
use crate::scheduler::{self, DISPATCH, Stage, StageOutcome};
use crate::task::{LookaheadPhase, Submission, Task, TaskId};
use crate::{
    ControlHints, DriveStatus, EncodedUnit, ErrorKind, PipelineConfig, PipelineError, PoolKind,
    RawFrame, SubmitStatus,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub submitted: u64,
    pub busy_rejections: u64,
    pub emitted: u64,
    pub ticks: u64,
    pub transitions: u64,
    pub scd_submissions: u64,
    pub lookahead_submissions: u64,
    pub histogram_submissions: u64,
    pub encode_executions: u64,
    pub recodes: u64,
    pub dependent_resubmits: u64,
    pub panic_skips: u64,
    pub padded_frames: u64,
    pub scene_cuts: u64,
    pub weighted_frames: u64,
    pub starvation_releases: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub counters: PipelineCounters,
    pub pools: Vec<(PoolKind, PoolStats)>,
    pub queues: Vec<QueueDepth>,
    pub dpb_len: usize,
    pub halted: Option<ErrorKind>,
}

#[derive(Debug)]
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) devices: Devices,
    pub(crate) pools: PoolSet,
    pub(crate) tasks: Vec<Task>,
    pub(crate) queues: QueueManager,
    pub(crate) gop: GopStructure,
    pub(crate) reorderer: Reorderer,
    pub(crate) dpb: DpbManager,
    pub(crate) history: AnalysisHistory,
    pub(crate) brc: RateController,
    pub(crate) grid: BlockGrid,
    pub(crate) counters: PipelineCounters,
    pub(crate) eos: bool,
    /// No upstream stage advanced during the last tick.
    pub(crate) promotion_stalled: bool,
    /// Upstream cannot grow the lookahead window any further.
    pub(crate) starved: bool,
    next_display: u64,
    next_output: u64,
    ready: VecDeque<EncodedUnit>,
    unannounced: usize,
    halted: Option<ErrorKind>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, mut devices: Devices) -> Result<Self, PipelineError> {
        config.validate()?;
        let plan = PoolPlan::for_config(&config)?;
        let pools = PoolSet::create(&config, &plan, &mut devices)?;
        let rc = &config.rate_control;
        let brc = RateController::new(rc, config.fps, config.gop.pic_size, config.gop.ref_dist);
        info!(%config, tasks = plan.tasks, "encode pipeline ready");
        Ok(Self {
            tasks: (0..plan.tasks).map(|i| Task::empty(TaskId(i))).collect(),
            queues: QueueManager::new(plan.tasks),
            gop: GopStructure::new(config.gop.clone()),
            reorderer: Reorderer::new(config.gop.b_pyramid),
            dpb: DpbManager::new(config.gop.num_ref_l0),
            history: AnalysisHistory::default(),
            grid: BlockGrid::for_config(&config),
            brc,
            pools,
            devices,
            config,
            counters: PipelineCounters::default(),
            eos: false,
            promotion_stalled: false,
            starved: false,
            next_display: 0,
            next_output: 0,
            ready: VecDeque::new(),
            unannounced: 0,
            halted: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Frames accepted before the first output can be expected.
    fn fill_window(&self) -> u64 {
        let la_depth = if self.config.lookahead.enabled {
            self.config.lookahead.depth as u64
        } else {
            0
        };
        u64::from(self.config.gop.ref_dist) - 1 + la_depth
    }

    pub fn submit_frame(
        &mut self,
        frame: &RawFrame,
        hints: ControlHints,
    ) -> Result<SubmitStatus, PipelineError> {
        if let Some(kind) = self.halted {
            return Err(PipelineError::Halted(kind));
        }
        if self.eos {
            return Err(PipelineError::EndOfStream);
        }
        if frame.dims != self.config.dims {
            return Err(PipelineError::InvalidInput(format!(
                "frame is {}, session expects {}",
                frame.dims, self.config.dims
            )));
        }
        let expected = self.config.dims.nv12_len();
        if frame.data.len() != expected {
            return Err(PipelineError::InvalidInput(format!(
                "nv12 frame needs {expected} bytes, got {}",
                frame.data.len()
            )));
        }
        if hints.qp.is_some_and(|qp| qp > 51) {
            return Err(PipelineError::InvalidInput("forced qp above 51".to_string()));
        }

        let Some(id) = self.queues.front(QueueKind::Free) else {
            self.counters.busy_rejections += 1;
            debug!("no free task record");
            return Ok(SubmitStatus::Busy);
        };
        let task = &mut self.tasks[id.0];
        if !self.pools.acquire_all(id, &[PoolKind::Raw], &mut task.resources) {
            self.counters.busy_rejections += 1;
            return Ok(SubmitStatus::Busy);
        }
        let raw = self.raw_surface(id);
        let data = &frame.data;
        let upload = self.devices.allocator.lock(raw, &mut |buf: &mut [u8]| {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
        });
        if let Err(err) = upload {
            self.pools.release_all(&mut self.tasks[id.0].resources);
            return Err(self.halt(err));
        }

        let display_order = self.next_display;
        self.next_display += 1;
        let task = &mut self.tasks[id.0];
        task.display_order = display_order;
        task.pts_90k = frame.pts_90k;
        task.hints = hints;
        self.queues.move_task(id, QueueKind::Free, QueueKind::Incoming);
        self.counters.submitted += 1;
        debug!(display_order, task = id.0, "frame submitted");

        if display_order < self.fill_window() {
            Ok(SubmitStatus::MoreDataNeeded)
        } else {
            Ok(SubmitStatus::Accepted)
        }
    }

    /// Marks end of stream; trailing mini-GOPs are closed and drained.
    pub fn flush(&mut self) {
        if !self.eos {
            info!(frames = self.next_display, "end of stream");
        }
        self.eos = true;
    }

    pub fn drive(&mut self) -> Result<DriveStatus, PipelineError> {
        if let Some(kind) = self.halted {
            if self.unannounced > 0 {
                self.unannounced -= 1;
                return Ok(DriveStatus::OutputReady);
            }
            return Err(PipelineError::Halted(kind));
        }

        let was_starved = self.starved;
        let transitions = match self.tick() {
            Ok(transitions) => transitions,
            Err(err) => {
                // Frames accepted earlier in the failing tick are still returned.
                self.emit_in_order();
                return Err(self.halt(err));
            }
        };
        self.emit_in_order();

        if self.unannounced > 0 {
            self.unannounced -= 1;
            return Ok(DriveStatus::OutputReady);
        }
        if transitions > 0 || self.in_flight() || (self.starved && !was_starved) {
            return Ok(DriveStatus::Progress);
        }
        if self.eos && self.queues.len(QueueKind::Free) == self.tasks.len() {
            self.release_dpb();
            return Ok(DriveStatus::Drained);
        }
        Ok(DriveStatus::NeedMoreInput)
    }

    /// Runs every enabled stage handler once, downstream first.
    fn tick(&mut self) -> Result<usize, PipelineError> {
        let mask = scheduler::compute_mask(self);
        self.counters.ticks += 1;
        let mut transitions = 0;
        let mut upstream_advanced = false;
        for entry in DISPATCH {
            if !mask.contains(entry.stage) {
                continue;
            }
            if (entry.handler)(self)? == StageOutcome::Advanced {
                transitions += 1;
                upstream_advanced |= matches!(entry.stage, Stage::Accept | Stage::ScdStart);
            }
        }
        self.counters.transitions += transitions as u64;
        self.promotion_stalled = !upstream_advanced;
        let starved = scheduler::starved(self);
        if starved && !self.starved && !self.queues.is_empty(QueueKind::LookaheadFinished) {
            warn!(
                window = self.queues.len(QueueKind::LookaheadFinished),
                "lookahead window starved, releasing early"
            );
            self.counters.starvation_releases += 1;
        }
        self.starved = starved;
        debug_assert!(self.queues.is_partition(), "task queues are no longer a partition");
        Ok(transitions)
    }

    fn halt(&mut self, err: PipelineError) -> PipelineError {
        let kind = err.kind();
        error!(%err, kind = %kind, "pipeline halted");
        self.halted = Some(kind);
        err
    }

    pub fn halted(&self) -> Option<ErrorKind> {
        self.halted
    }

    /// Work submitted to a device and not yet collected.
    fn in_flight(&self) -> bool {
        [
            QueueKind::Scd,
            QueueKind::LookaheadStarted,
            QueueKind::Histogram,
            QueueKind::Encoding,
        ]
        .into_iter()
        .any(|queue| !self.queues.is_empty(queue))
    }

    /// Moves encoded tasks out in display order and recycles their records.
    fn emit_in_order(&mut self) {
        loop {
            let next = self.next_output;
            let Some(id) = self
                .queues
                .iter(QueueKind::Encoded)
                .find(|id| self.tasks[id.0].display_order == next)
            else {
                break;
            };
            let task = &mut self.tasks[id.0];
            if let Some(unit) = task.output.take() {
                debug!(display_order = next, encode_order = unit.encode_order, "output ready");
                self.ready.push_back(unit);
                self.unannounced += 1;
            }
            task.reset();
            self.queues.move_task(id, QueueKind::Encoded, QueueKind::Free);
            self.next_output += 1;
            self.counters.emitted += 1;
        }
    }

    pub fn retrieve_output(&mut self) -> Option<EncodedUnit> {
        self.ready.pop_front()
    }

    /// Selects the next frame for encode order and attaches its references.
    /// Returns `None` when nothing is promotable or a pool is busy.
    pub(crate) fn promote(&mut self) -> Option<TaskId> {
        let pending: Vec<PendingFrame> = self
            .queues
            .iter(QueueKind::Reordering)
            .map(|id| {
                let task = &self.tasks[id.0];
                PendingFrame {
                    id,
                    display_order: task.display_order,
                    frame_type: task.frame_type,
                    layer: task.pyramid_layer,
                }
            })
            .collect();
        let input_done = self.eos && self.queues.is_empty(QueueKind::Incoming);
        let promotion = self.reorderer.select(&pending, input_done)?;
        for retype in &promotion.retypes {
            let task = &mut self.tasks[retype.id.0];
            if task.frame_type != retype.frame_type {
                debug!(
                    display_order = task.display_order,
                    from = %task.frame_type,
                    to = %retype.frame_type,
                    "mini-gop closed early"
                );
            }
            task.frame_type = retype.frame_type;
            task.pyramid_layer = retype.layer;
        }

        let id = promotion.id;
        let task = &mut self.tasks[id.0];
        let mut kinds = Vec::with_capacity(2);
        if self.config.lookahead.enabled {
            kinds.push(PoolKind::Lookahead);
        }
        if task.frame_type.reference {
            kinds.push(PoolKind::Recon);
        }
        if !self.pools.acquire_all(id, &kinds, &mut task.resources) {
            return None;
        }

        let encode_order = self.reorderer.commit(task.display_order, task.frame_type);
        let view = self.dpb.build_view(task.display_order, task.frame_type);
        for entry in view.entries() {
            retain_entry(&mut self.pools, entry);
        }
        task.encode_order = Some(encode_order);
        task.dpb = view;
        let frame_type = task.frame_type;
        debug!(
            display_order = task.display_order,
            encode_order,
            frame_type = %frame_type,
            refs = task.dpb.entries().count(),
            "promoted to encode order"
        );

        if frame_type.reference {
            let entry = DpbEntry {
                display_order: task.display_order,
                encode_order,
                recon: task.resources.recon,
                lookahead: task.resources.lookahead,
                layer: task.pyramid_layer,
                anchor: frame_type.is_anchor(),
            };
            retain_entry(&mut self.pools, &entry);
            for evicted in self.dpb.insert(entry, frame_type.idr) {
                release_entry(&mut self.pools, &evicted);
            }
        }
        Some(id)
    }

    fn release_dpb(&mut self) {
        for entry in self.dpb.clear() {
            release_entry(&mut self.pools, &entry);
        }
    }

    /// Polls a GPU event without blocking. `Ok(None)` means still running.
    pub(crate) fn poll_gpu(
        &mut self,
        submission: Submission,
        stage: &'static str,
        display_order: u64,
    ) -> Result<Option<KernelOutput>, PipelineError> {
        let gpu = &mut self.devices.gpu;
        match gpu.wait_event(submission.event, Duration::ZERO)? {
            EventStatus::Busy if submission.submitted_at.elapsed() <= self.config.gpu_timeout => {
                Ok(None)
            }
            EventStatus::Busy | EventStatus::Timeout => Err(PipelineError::GpuHang {
                stage,
                display_order,
            }),
            EventStatus::Done => {
                let output = gpu.read_output(submission.event);
                gpu.destroy_event(submission.event);
                output.map(Some)
            }
        }
    }

    pub(crate) fn raw_gpu(&self, id: TaskId) -> GpuHandle {
        match self.tasks[id.0].resources.raw {
            Some(slot) => self.pools.gpu_handle(PoolKind::Raw, slot),
            None => panic!("task {} has no raw surface", id.0),
        }
    }

    fn raw_surface(&self, id: TaskId) -> SurfaceHandle {
        match self.tasks[id.0].resources.raw {
            Some(slot) => self.pools.surface(PoolKind::Raw, slot),
            None => panic!("task {} has no raw surface", id.0),
        }
    }

    /// Whether every task is in exactly one queue.
    pub fn queues_consistent(&self) -> bool {
        self.queues.is_partition()
    }

    /// Checks that every slot's recorded owner is the task that records it.
    pub fn ownership_consistent(&self) -> bool {
        self.tasks.iter().all(|task| {
            PoolKind::ALL.into_iter().all(|kind| match task.resources.get(kind) {
                Some(slot) => self.pools.owner(kind, slot) == Some(task.id),
                None => true,
            })
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            counters: self.counters,
            pools: self.pools.stats(),
            queues: self.queues.depths(),
            dpb_len: self.dpb.len(),
            halted: self.halted,
        }
    }

    /// Destroys live events, then every pooled device object.
    fn teardown(&mut self) {
        for task in &mut self.tasks {
            if let Some(submission) = task.analysis.take() {
                self.devices.gpu.destroy_event(submission.event);
            }
            if let LookaheadPhase::Submitted(submission) = task.lookahead {
                self.devices.gpu.destroy_event(submission.event);
                task.lookahead = LookaheadPhase::Released;
            }
        }
        self.pools.teardown(&mut self.devices);
    }
}

/// The DPB and every task listing an entry each hold one ref on its slots.
fn retain_entry(pools: &mut PoolSet, entry: &DpbEntry) {
    if let Some(slot) = entry.recon {
        pools.add_ref(PoolKind::Recon, slot);
    }
    if let Some(slot) = entry.lookahead {
        pools.add_ref(PoolKind::Lookahead, slot);
    }
}

fn release_entry(pools: &mut PoolSet, entry: &DpbEntry) {
    if let Some(slot) = entry.recon {
        pools.release(PoolKind::Recon, slot);
    }
    if let Some(slot) = entry.lookahead {
        pools.release(PoolKind::Lookahead, slot);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// ACCEPT: classify the oldest submitted frame and hand it to reordering.
pub(crate) fn accept(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::Incoming) else {
        return Ok(StageOutcome::Idle);
    };
    let task = &mut p.tasks[id.0];
    let position = p.gop.next_position(task.hints.force_idr);
    debug_assert_eq!(position.display_order, task.display_order);
    task.frame_type = position.frame_type;
    task.gop_position = position.gop_position;
    task.pyramid_layer = position.pyramid_layer;
    debug!(
        display_order = task.display_order,
        frame_type = %task.frame_type,
        layer = task.pyramid_layer,
        "frame classified"
    );
    p.queues.move_task(id, QueueKind::Incoming, QueueKind::Reordering);
    Ok(StageOutcome::Advanced)
}
