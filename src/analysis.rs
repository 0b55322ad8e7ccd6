//! GPU analysis stages around the lookahead: scene-change detection before it
//! and the luma histogram after it.
//!
//! Both kernels run on the task's raw surface. The CPU side compares each
//! result with the one recorded for the forward reference, so the reference's
//! raw surface never has to stay alive for the comparison.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::device::{Kernel, KernelArgs, KernelOutput};
use crate::pipeline::Pipeline;
use crate::queue::QueueKind;
use crate::scheduler::StageOutcome;
use crate::task::Submission;
use crate::{FrameType, PictureKind, PipelineError, lookahead};

const HISTORY_LEN: usize = 64;
pub const HISTOGRAM_BINS: usize = 256;

/// Per-frame analysis results keyed by display order.
#[derive(Debug, Default)]
pub struct AnalysisHistory {
    thumbnails: BTreeMap<u64, Vec<u8>>,
    luma_means: BTreeMap<u64, f32>,
}

impl AnalysisHistory {
    pub fn record_thumbnail(&mut self, display_order: u64, thumbnail: Vec<u8>) {
        self.thumbnails.insert(display_order, thumbnail);
        while self.thumbnails.len() > HISTORY_LEN {
            self.thumbnails.pop_first();
        }
    }

    pub fn thumbnail(&self, display_order: u64) -> Option<&[u8]> {
        self.thumbnails.get(&display_order).map(Vec::as_slice)
    }

    pub fn record_luma(&mut self, display_order: u64, mean: f32) {
        self.luma_means.insert(display_order, mean);
        while self.luma_means.len() > HISTORY_LEN {
            self.luma_means.pop_first();
        }
    }

    pub fn luma(&self, display_order: u64) -> Option<f32> {
        self.luma_means.get(&display_order).copied()
    }
}

/// Mean absolute thumbnail difference scaled to `0.0..=1.0`.
pub fn scene_change_score(previous: &[u8], current: &[u8]) -> f32 {
    if previous.len() != current.len() || current.is_empty() {
        return 1.0;
    }
    let sad: u64 = previous
        .iter()
        .zip(current)
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    (sad as f32 / current.len() as f32 / 128.0).min(1.0)
}

pub fn luma_mean(bins: &[u32]) -> f32 {
    let (weighted, total) = bins
        .iter()
        .enumerate()
        .fold((0u64, 0u64), |(weighted, total), (value, &count)| {
            (weighted + value as u64 * u64::from(count), total + u64::from(count))
        });
    if total == 0 {
        0.0
    } else {
        weighted as f32 / total as f32
    }
}

fn unexpected(kernel: Kernel, output: &KernelOutput) -> PipelineError {
    let got = match output {
        KernelOutput::Thumbnail(_) => "thumbnail",
        KernelOutput::Motion(_) => "motion",
        KernelOutput::Histogram(_) => "histogram",
    };
    PipelineError::Gpu(format!("{kernel:?} kernel produced {got} output"))
}

/// SCD_START: promote the next frame into encode order and start scene-change
/// analysis on it.
pub(crate) fn scd_start(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.promote() else {
        return Ok(StageOutcome::Deferred);
    };
    if !p.config.scene_change.enabled {
        p.queues.move_task(id, QueueKind::Reordering, QueueKind::ScdDone);
        return Ok(StageOutcome::Advanced);
    }
    let display_order = p.tasks[id.0].display_order;
    let args = KernelArgs::new(display_order, p.raw_gpu(id));
    let event = p.devices.gpu.submit_kernel(Kernel::SceneChange, &args)?;
    p.tasks[id.0].analysis = Some(Submission::new(event));
    p.counters.scd_submissions += 1;
    p.queues.move_task(id, QueueKind::Reordering, QueueKind::Scd);
    debug!(display_order, "scene change submitted");
    Ok(StageOutcome::Advanced)
}

pub(crate) fn scd_wait(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::Scd) else {
        return Ok(StageOutcome::Idle);
    };
    let display_order = p.tasks[id.0].display_order;
    let Some(submission) = p.tasks[id.0].analysis else {
        panic!("task {} waits on scene change without an event", id.0);
    };
    let Some(output) = p.poll_gpu(submission, "scene_change", display_order)? else {
        return Ok(StageOutcome::Deferred);
    };
    let KernelOutput::Thumbnail(thumbnail) = output else {
        return Err(unexpected(Kernel::SceneChange, &output));
    };

    let options = &p.config.scene_change;
    let task = &mut p.tasks[id.0];
    task.analysis = None;
    if !task.frame_type.is_intra() {
        let previous = task
            .dpb
            .forward()
            .and_then(|reference| p.history.thumbnail(reference.display_order));
        if let Some(previous) = previous {
            let score = scene_change_score(previous, &thumbnail);
            if score >= options.threshold {
                task.scene_cut = true;
                if options.insert_intra && task.frame_type.kind == PictureKind::P {
                    task.frame_type = FrameType::I;
                }
                p.counters.scene_cuts += 1;
                info!(display_order, score, frame_type = %task.frame_type, "scene cut");
            }
        }
    }
    p.history.record_thumbnail(display_order, thumbnail);
    p.queues.move_task(id, QueueKind::Scd, QueueKind::ScdDone);
    Ok(StageOutcome::Advanced)
}

/// HIST_START: the head of the lookahead window leaves it. Cost propagation
/// runs over the window first so the head carries its final QP offset.
pub(crate) fn hist_start(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::LookaheadFinished) else {
        return Ok(StageOutcome::Idle);
    };
    if p.config.lookahead.enabled {
        lookahead::propagate(p);
    }
    if !p.config.histogram.enabled {
        p.queues.move_task(id, QueueKind::LookaheadFinished, QueueKind::HistogramDone);
        return Ok(StageOutcome::Advanced);
    }
    let display_order = p.tasks[id.0].display_order;
    let args = KernelArgs::new(display_order, p.raw_gpu(id));
    let event = p.devices.gpu.submit_kernel(Kernel::Histogram, &args)?;
    p.tasks[id.0].analysis = Some(Submission::new(event));
    p.counters.histogram_submissions += 1;
    p.queues.move_task(id, QueueKind::LookaheadFinished, QueueKind::Histogram);
    debug!(display_order, "histogram submitted");
    Ok(StageOutcome::Advanced)
}

pub(crate) fn hist_wait(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::Histogram) else {
        return Ok(StageOutcome::Idle);
    };
    let display_order = p.tasks[id.0].display_order;
    let Some(submission) = p.tasks[id.0].analysis else {
        panic!("task {} waits on histogram without an event", id.0);
    };
    let Some(output) = p.poll_gpu(submission, "histogram", display_order)? else {
        return Ok(StageOutcome::Deferred);
    };
    let KernelOutput::Histogram(bins) = output else {
        return Err(unexpected(Kernel::Histogram, &output));
    };
    if bins.len() != HISTOGRAM_BINS {
        return Err(PipelineError::Gpu(format!(
            "histogram has {} bins, expected {HISTOGRAM_BINS}",
            bins.len()
        )));
    }

    let mean = luma_mean(&bins);
    let threshold = p.config.histogram.fade_threshold;
    let task = &mut p.tasks[id.0];
    task.analysis = None;
    task.luma_mean = Some(mean);
    if !task.frame_type.is_intra() {
        let previous = task
            .dpb
            .forward()
            .and_then(|reference| p.history.luma(reference.display_order));
        if previous.is_some_and(|previous| (mean - previous).abs() > threshold) {
            task.weighted_prediction = true;
            p.counters.weighted_frames += 1;
            debug!(display_order, mean, "brightness change, weighted prediction on");
        }
    }
    p.history.record_luma(display_order, mean);
    p.queues.move_task(id, QueueKind::Histogram, QueueKind::HistogramDone);
    Ok(StageOutcome::Advanced)
}
