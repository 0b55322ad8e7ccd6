//! Hardware encode stages and the recode loop around them.
//!
//! ENCODE_START submits frames in encode order, one DDI execute per field.
//! ENCODE_WAIT only ever queries the head of the Encoding queue, so at most
//! one recode is in progress and it finishes inside a single handler call:
//! the head's verdict is applied, dependents that already went to hardware
//! are drained and everything is resubmitted before the handler returns.

use std::time::Instant;

use tracing::{debug, warn};

use crate::bitstream;
use crate::brc::{BrcVerdict, FrameContext};
use crate::device::{EncodeStatus, EncodeTask, FieldId};
use crate::pipeline::Pipeline;
use crate::queue::QueueKind;
use crate::scheduler::StageOutcome;
use crate::task::{BrcPhase, TaskId};
use crate::{EncodedUnit, PipelineError, PoolKind};

/// Builds the DDI parameters for `id` from its current state.
fn encode_task(p: &Pipeline, id: TaskId) -> EncodeTask {
    let task = &p.tasks[id.0];
    let surface = |kind| match task.resources.get(kind) {
        Some(slot) => p.pools.surface(kind, slot),
        None => panic!("task {} reached encode without a {kind} slot", id.0),
    };
    let Some(encode_order) = task.encode_order else {
        panic!("task {} reached encode without an encode order", id.0);
    };
    let refs = |entries: &[crate::dpb::DpbEntry]| {
        if task.frame_type.is_intra() {
            return Vec::new();
        }
        entries
            .iter()
            .filter_map(|entry| entry.recon)
            .map(|slot| p.pools.surface(PoolKind::Recon, slot))
            .collect()
    };
    EncodeTask {
        display_order: task.display_order,
        encode_order,
        frame_type: task.frame_type,
        pyramid_layer: task.pyramid_layer,
        qp: task.brc.qp,
        skip: task.brc.panic,
        weighted_prediction: task.weighted_prediction,
        scene_cut: task.scene_cut,
        raw: surface(PoolKind::Raw),
        recon: task.resources.recon.map(|slot| p.pools.surface(PoolKind::Recon, slot)),
        bitstream: surface(PoolKind::Bitstream),
        bitstream_capacity: p.pools.bitstream_capacity,
        field_count: p.config.picture_structure.field_count(),
        refs_l0: refs(&task.dpb.l0),
        refs_l1: refs(&task.dpb.l1),
    }
}

/// Executes every field of `id` and restarts its completion tracking.
fn execute(p: &mut Pipeline, id: TaskId) -> Result<(), PipelineError> {
    let job = encode_task(p, id);
    for field in 0..job.field_count {
        p.devices.hardware.execute(job.raw, &job, FieldId(field))?;
        p.counters.encode_executions += 1;
    }
    let progress = &mut p.tasks[id.0].encode;
    progress.submitted_at = Some(Instant::now());
    progress.fields_done = 0;
    progress.bytes = [0; 2];
    debug!(
        display_order = job.display_order,
        encode_order = job.encode_order,
        qp = job.qp,
        skip = job.skip,
        "encode submitted"
    );
    Ok(())
}

/// ENCODE_START: pick a QP and hand the oldest analysed frame to hardware.
pub(crate) fn encode_start(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::HistogramDone) else {
        return Ok(StageOutcome::Idle);
    };
    let task = &mut p.tasks[id.0];
    if !p.pools.acquire_all(id, &[PoolKind::Bitstream], &mut task.resources) {
        return Ok(StageOutcome::Deferred);
    }
    let intra = task.frame_type.is_intra();
    let ctx = FrameContext {
        frame_type: task.frame_type,
        complexity: task.la_result.as_ref().map(|r| r.complexity(intra)),
        lookahead_offset: task.la_result.as_ref().map_or(0, |r| r.qp_offset),
        forced_qp: task.hints.qp,
    };
    let qp = p.brc.frame_qp(&ctx);
    task.brc.qp = qp;
    task.brc.qp_history.push(qp);

    if let Err(err) = execute(p, id) {
        if let Some(slot) = p.tasks[id.0].resources.take(PoolKind::Bitstream) {
            p.pools.release(PoolKind::Bitstream, slot);
        }
        return Err(err);
    }
    p.queues.move_task(id, QueueKind::HistogramDone, QueueKind::Encoding);
    Ok(StageOutcome::Advanced)
}

/// ENCODE_WAIT: query the head of the Encoding queue and apply the rate
/// control verdict once every field is back.
pub(crate) fn encode_wait(p: &mut Pipeline) -> Result<StageOutcome, PipelineError> {
    let Some(id) = p.queues.front(QueueKind::Encoding) else {
        return Ok(StageOutcome::Idle);
    };
    let job = encode_task(p, id);
    let per_field = job.bitstream_capacity / usize::from(job.field_count);
    while p.tasks[id.0].encode.fields_done < job.field_count {
        let field = FieldId(p.tasks[id.0].encode.fields_done);
        match p.devices.hardware.query_status(&job, field)? {
            EncodeStatus::Busy => {
                let started = p.tasks[id.0].encode.submitted_at;
                if started.is_some_and(|at| at.elapsed() > p.config.hw_timeout) {
                    return Err(PipelineError::DeviceFailed(format!(
                        "frame {} did not finish encoding within {:?}",
                        job.display_order, p.config.hw_timeout
                    )));
                }
                return Ok(StageOutcome::Deferred);
            }
            EncodeStatus::Done(report) => {
                if report.bytes_written > per_field {
                    return Err(PipelineError::DeviceFailed(format!(
                        "frame {} field {} wrote {} bytes into a {per_field} byte buffer",
                        job.display_order, field.0, report.bytes_written
                    )));
                }
                let progress = &mut p.tasks[id.0].encode;
                progress.bytes[usize::from(field.0)] = report.bytes_written;
                progress.fields_done += 1;
            }
        }
    }

    let limits = p.brc.limits();
    let task = &mut p.tasks[id.0];
    let bits = task.encode.total_bytes() as u64 * 8;
    task.brc.min_bits = limits.min_bits;
    task.brc.max_bits = limits.max_bits;
    task.brc.phase = match task.brc.phase {
        BrcPhase::NotEncoded => BrcPhase::EncodedOnce,
        BrcPhase::RecodeRequested => BrcPhase::Reencoded,
        phase => phase,
    };
    // A skip-coded frame is final whatever its size.
    let verdict = if task.brc.panic {
        BrcVerdict::Accept
    } else {
        p.brc.check(bits, task.brc.qp)
    };
    debug!(display_order = job.display_order, bits, qp = job.qp, ?verdict, "encode done");

    match verdict {
        BrcVerdict::Accept => accept(p, id, 0)?,
        BrcVerdict::Pad { min_bits } => {
            let pad = usize::try_from((min_bits - bits).div_ceil(8)).unwrap_or(usize::MAX);
            accept(p, id, pad)?;
        }
        BrcVerdict::Recode { qp } => recode(p, id, bits, qp)?,
        BrcVerdict::Panic => panic_skip(p, id, bits)?,
    }
    Ok(StageOutcome::Advanced)
}

/// Copies the fields out of the bitstream surface, commits the frame to the
/// rate model and releases everything the task held.
fn accept(p: &mut Pipeline, id: TaskId, pad: usize) -> Result<(), PipelineError> {
    let job = encode_task(p, id);
    let per_field = job.bitstream_capacity / usize::from(job.field_count);
    let written = p.tasks[id.0].encode.bytes;
    let mut data = Vec::with_capacity(p.tasks[id.0].encode.total_bytes() + pad);
    p.devices.allocator.lock(job.bitstream, &mut |buf: &mut [u8]| {
        for (field, &len) in written.iter().enumerate().take(usize::from(job.field_count)) {
            let start = (field * per_field).min(buf.len());
            let end = (start + len).min(buf.len());
            data.extend_from_slice(&buf[start..end]);
        }
    })?;
    let codec = p.config.codec;
    let slices = bitstream::nal_units(&data)
        .into_iter()
        .filter(|nal| bitstream::is_vcl(codec, nal))
        .count();
    if slices < usize::from(job.field_count) {
        return Err(PipelineError::DeviceFailed(format!(
            "frame {} came back with {slices} slice NALs for {} fields",
            job.display_order, job.field_count
        )));
    }
    let mut padded_bytes = 0;
    if pad > 0 {
        let filler = bitstream::filler_nal(codec, pad);
        padded_bytes = filler.len();
        data.extend_from_slice(&filler);
        p.counters.padded_frames += 1;
        warn!(display_order = job.display_order, padded_bytes, "frame padded to buffer minimum");
    }

    let task = &mut p.tasks[id.0];
    let intra = task.frame_type.is_intra();
    let complexity = task.la_result.as_ref().map(|r| r.complexity(intra));
    p.brc
        .commit(data.len() as u64 * 8, task.brc.qp, task.frame_type, complexity);
    if !task.brc.panic {
        task.brc.phase = BrcPhase::Accepted;
    }
    task.output = Some(EncodedUnit {
        codec,
        data,
        pts_90k: task.pts_90k,
        display_order: task.display_order,
        encode_order: job.encode_order,
        frame_type: task.frame_type,
        qp: task.brc.qp,
        recode_count: task.brc.recode_count,
        skipped: task.brc.panic,
        padded_bytes,
        scene_cut: task.scene_cut,
    });

    p.pools.release_all(&mut task.resources);
    for entry in task.dpb.entries() {
        if let Some(slot) = entry.recon {
            p.pools.release(PoolKind::Recon, slot);
        }
    }
    p.queues.move_task(id, QueueKind::Encoding, QueueKind::Encoded);
    debug!(
        display_order = job.display_order,
        encode_order = job.encode_order,
        qp = job.qp,
        "frame accepted"
    );
    Ok(())
}

fn recode(p: &mut Pipeline, id: TaskId, bits: u64, qp: u8) -> Result<(), PipelineError> {
    let task = &mut p.tasks[id.0];
    warn!(
        display_order = task.display_order,
        bits,
        max_bits = task.brc.max_bits,
        from = task.brc.qp,
        to = qp,
        "frame too large, recoding"
    );
    debug_assert!(qp > task.brc.qp, "recode must raise qp");
    task.brc.qp = qp;
    task.brc.qp_history.push(qp);
    task.brc.recode_count += 1;
    task.brc.phase = BrcPhase::RecodeRequested;
    p.counters.recodes += 1;
    resubmit_with_dependents(p, id)
}

fn panic_skip(p: &mut Pipeline, id: TaskId, bits: u64) -> Result<(), PipelineError> {
    let task = &mut p.tasks[id.0];
    warn!(
        display_order = task.display_order,
        bits,
        max_bits = task.brc.max_bits,
        qp = task.brc.qp,
        "frame exceeds buffer at max qp, skip coding"
    );
    task.brc.panic = true;
    task.brc.phase = BrcPhase::PanicSkip;
    p.counters.panic_skips += 1;
    resubmit_with_dependents(p, id)
}

/// Resubmits `head` and every frame behind it in the Encoding queue whose
/// references, directly or through another resubmitted frame, include it.
fn resubmit_with_dependents(p: &mut Pipeline, head: TaskId) -> Result<(), PipelineError> {
    let Some(head_order) = p.tasks[head.0].encode_order else {
        panic!("task {} is encoding without an encode order", head.0);
    };
    let mut changed = vec![head_order];
    let mut dependents = Vec::new();
    for id in p.queues.iter(QueueKind::Encoding).skip(1) {
        let task = &p.tasks[id.0];
        if task.frame_type.is_intra() || !changed.iter().any(|&order| task.references(order)) {
            continue;
        }
        dependents.push(id);
        if let (true, Some(order)) = (task.frame_type.reference, task.encode_order) {
            changed.push(order);
        }
    }

    // The dependents were encoded against the old reconstruction; let the
    // hardware finish with them before they are resubmitted.
    let started = Instant::now();
    for &id in &dependents {
        let job = encode_task(p, id);
        for field in 0..job.field_count {
            while p.devices.hardware.query_status(&job, FieldId(field))? == EncodeStatus::Busy {
                if started.elapsed() > p.config.hw_timeout {
                    return Err(PipelineError::DeviceFailed(format!(
                        "frame {} did not finish before resubmission",
                        job.display_order
                    )));
                }
                std::thread::yield_now();
            }
        }
    }

    execute(p, head)?;
    for &id in &dependents {
        execute(p, id)?;
        p.tasks[id.0].encode.resubmits += 1;
        p.counters.dependent_resubmits += 1;
    }
    if !dependents.is_empty() {
        debug!(
            display_order = p.tasks[head.0].display_order,
            dependents = dependents.len(),
            "dependents resubmitted"
        );
    }
    Ok(())
}
