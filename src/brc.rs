//! Frame-level bit rate control.
//!
//! A leaky-bucket model of the decoder buffer bounds every frame's size: a
//! frame may not be larger than what the buffer holds at its removal time, and
//! under CBR it may not be so small that the buffer overflows before the next
//! removal. QP selection uses a per-subtype rate model,
//! `bits = scale * complexity / qstep`, fed by accepted frames.

use tracing::trace;

use crate::{FrameType, PictureKind, RateControl, RateControlMethod};

pub const FRAME_NSUBTYPES: usize = 4;
pub const FRAME_SUBTYPE_I: usize = 0;
pub const FRAME_SUBTYPE_P: usize = 1;
/// Reference B picture.
pub const FRAME_SUBTYPE_B0: usize = 2;
/// Non-reference B picture.
pub const FRAME_SUBTYPE_B1: usize = 3;

const TYPE_WEIGHT: [f64; FRAME_NSUBTYPES] = [2.5, 1.0, 0.8, 0.6];
const TYPE_QP_OFFSET: [i32; FRAME_NSUBTYPES] = [-2, 0, 1, 2];
/// Smoothing factor for the scale and QP trackers.
const MODEL_ALPHA: f64 = 0.25;

pub fn frame_subtype(frame_type: FrameType) -> usize {
    match frame_type.kind {
        PictureKind::I => FRAME_SUBTYPE_I,
        PictureKind::P => FRAME_SUBTYPE_P,
        PictureKind::B if frame_type.reference => FRAME_SUBTYPE_B0,
        PictureKind::B => FRAME_SUBTYPE_B1,
    }
}

/// Quantizer step size for an H.264/HEVC QP.
pub fn qstep(qp: u8) -> f64 {
    2f64.powf((f64::from(qp) - 4.0) / 6.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrcVerdict {
    Accept,
    Recode { qp: u8 },
    /// Append filler until the frame reaches `min_bits`.
    Pad { min_bits: u64 },
    /// Size cannot be met at any QP; the frame must be skip-coded.
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub min_bits: u64,
    pub max_bits: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub frame_type: FrameType,
    /// Lookahead cost estimate; `None` when lookahead is off.
    pub complexity: Option<u64>,
    pub lookahead_offset: i8,
    pub forced_qp: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct RateController {
    method: RateControlMethod,
    qp_min: u8,
    qp_max: u8,
    // Average bits per frame at the target rate.
    bits_per_frame: f64,
    // Bits entering the decoder buffer per frame interval.
    input_per_frame: f64,
    buffer_size: f64,
    fullness: f64,
    target_fullness: f64,
    max_frame_size: Option<u64>,
    // Normalizes TYPE_WEIGHT over one GOP's frame mix.
    weight_norm: f64,
    scale: [Option<f64>; FRAME_NSUBTYPES],
    avg_qp: [f64; FRAME_NSUBTYPES],
    nframes: [u64; FRAME_NSUBTYPES],
}

impl RateController {
    pub fn new(rc: &RateControl, fps: i32, gop_size: u32, ref_dist: u32) -> Self {
        let fps = f64::from(fps.max(1));
        let bits_per_frame = f64::from(rc.target_kbps) * 1000.0 / fps;
        let input_rate = match rc.method {
            RateControlMethod::Vbr => rc.max_kbps,
            _ => rc.target_kbps,
        };
        let buffer_size = f64::from(rc.buffer_size_kbits) * 1000.0;
        let fullness = buffer_size * rc.initial_fullness;

        let gop = f64::from(gop_size.max(1));
        let anchors = (gop - 1.0) / f64::from(ref_dist.max(1));
        let bs = (gop - 1.0 - anchors).max(0.0);
        let weight_norm = (TYPE_WEIGHT[FRAME_SUBTYPE_I]
            + anchors * TYPE_WEIGHT[FRAME_SUBTYPE_P]
            + bs * TYPE_WEIGHT[FRAME_SUBTYPE_B1])
            / gop;

        let base = f64::from(rc.initial_qp);
        Self {
            method: rc.method,
            qp_min: rc.qp_min,
            qp_max: rc.qp_max,
            bits_per_frame,
            input_per_frame: f64::from(input_rate) * 1000.0 / fps,
            buffer_size,
            fullness,
            target_fullness: fullness,
            max_frame_size: rc.max_frame_size_bits,
            weight_norm,
            scale: [None; FRAME_NSUBTYPES],
            avg_qp: std::array::from_fn(|st| base + f64::from(TYPE_QP_OFFSET[st])),
            nframes: [0; FRAME_NSUBTYPES],
        }
    }

    fn clamp(&self, qp: i32) -> u8 {
        qp.clamp(i32::from(self.qp_min), i32::from(self.qp_max)) as u8
    }

    /// QP used to parameterize lookahead motion search before the frame's
    /// own complexity is known.
    pub fn preview_qp(&self, frame_type: FrameType) -> u8 {
        match self.method {
            RateControlMethod::Cqp { .. } => self.cqp(frame_type),
            _ => self.clamp(self.avg_qp[frame_subtype(frame_type)].round() as i32),
        }
    }

    fn cqp(&self, frame_type: FrameType) -> u8 {
        let RateControlMethod::Cqp { qp_i, qp_p, qp_b } = self.method else {
            return self.qp_max;
        };
        let qp = match frame_type.kind {
            PictureKind::I => qp_i,
            PictureKind::P => qp_p,
            PictureKind::B => qp_b,
        };
        self.clamp(i32::from(qp))
    }

    pub fn frame_qp(&self, ctx: &FrameContext) -> u8 {
        if let Some(qp) = ctx.forced_qp {
            return self.clamp(i32::from(qp));
        }
        if matches!(self.method, RateControlMethod::Cqp { .. }) {
            return self.cqp(ctx.frame_type);
        }
        let st = frame_subtype(ctx.frame_type);
        let deviation = ((self.fullness - self.target_fullness) / self.buffer_size).clamp(-0.5, 0.5);
        let target = self.bits_per_frame * TYPE_WEIGHT[st] / self.weight_norm * (1.0 + deviation);

        let model_qp = match (ctx.complexity, self.scale[st]) {
            (Some(complexity), Some(scale)) if complexity > 0 => {
                let step = scale * complexity as f64 / target.max(1.0);
                4.0 + 6.0 * step.max(f64::MIN_POSITIVE).log2()
            }
            _ => self.avg_qp[st] - 6.0 * (1.0 + deviation).log2(),
        };
        let qp = model_qp.round() as i32 + i32::from(ctx.lookahead_offset);
        trace!(subtype = st, target, model_qp, qp, "frame qp");
        self.clamp(qp)
    }

    /// Size bounds for the next frame leaving the decoder buffer.
    pub fn limits(&self) -> FrameLimits {
        let mut max_bits = self.fullness.max(0.0) as u64;
        if let Some(cap) = self.max_frame_size {
            max_bits = max_bits.min(cap);
        }
        let min_bits = match self.method {
            RateControlMethod::Cbr => {
                (self.fullness + self.input_per_frame - self.buffer_size).max(0.0).ceil() as u64
            }
            _ => 0,
        };
        FrameLimits { min_bits, max_bits }
    }

    pub fn check(&self, bits: u64, qp: u8) -> BrcVerdict {
        if matches!(self.method, RateControlMethod::Cqp { .. }) {
            return BrcVerdict::Accept;
        }
        let FrameLimits { min_bits, max_bits } = self.limits();
        if bits > max_bits {
            if qp >= self.qp_max {
                return BrcVerdict::Panic;
            }
            let over = if max_bits == 0 {
                f64::from(self.qp_max)
            } else {
                (6.0 * (bits as f64 / max_bits as f64).log2()).ceil()
            };
            let step = (over as i32).max(1);
            return BrcVerdict::Recode {
                qp: self.clamp(i32::from(qp) + step).max(qp),
            };
        }
        if bits < min_bits {
            return BrcVerdict::Pad { min_bits };
        }
        BrcVerdict::Accept
    }

    /// Folds an accepted frame into the buffer and rate model.
    pub fn commit(&mut self, bits: u64, qp: u8, frame_type: FrameType, complexity: Option<u64>) {
        let st = frame_subtype(frame_type);
        self.fullness = self.fullness - bits as f64 + self.input_per_frame;
        if self.method == RateControlMethod::Vbr {
            self.fullness = self.fullness.min(self.buffer_size);
        }
        self.fullness = self.fullness.max(0.0);

        if let Some(complexity) = complexity.filter(|&c| c > 0 && bits > 0) {
            let sample = bits as f64 * qstep(qp) / complexity as f64;
            self.scale[st] = Some(match self.scale[st] {
                Some(scale) => scale + MODEL_ALPHA * (sample - scale),
                None => sample,
            });
        }
        self.avg_qp[st] += MODEL_ALPHA * (f64::from(qp) - self.avg_qp[st]);
        self.nframes[st] += 1;
    }

    pub fn fullness(&self) -> f64 {
        self.fullness
    }

    pub fn frames_committed(&self) -> u64 {
        self.nframes.iter().sum()
    }
}
