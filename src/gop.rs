//! GOP structure: picture types, GOP positions and B-pyramid layers in
//! display order.
//!
//! Every GOP starts with an I picture (IDR every `idr_interval + 1` GOPs).
//! Anchors follow every `ref_dist` pictures and the last picture of a GOP is
//! always an anchor, so B runs never straddle a GOP boundary.

use crate::{FrameType, GopConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopPosition {
    pub display_order: u64,
    pub gop_position: u32,
    pub frame_type: FrameType,
    pub pyramid_layer: u8,
}

#[derive(Debug)]
pub struct GopStructure {
    config: GopConfig,
    next_display: u64,
    gop_start: u64,
    gop_count: u64,
}

impl GopStructure {
    pub fn new(config: GopConfig) -> Self {
        Self {
            config,
            next_display: 0,
            gop_start: 0,
            gop_count: 0,
        }
    }

    /// Classifies the next picture in display order.
    pub fn next_position(&mut self, force_idr: bool) -> GopPosition {
        let display_order = self.next_display;
        self.next_display += 1;

        let pic_size = u64::from(self.config.pic_size);
        let starts_gop =
            display_order == 0 || force_idr || display_order - self.gop_start >= pic_size;
        if starts_gop {
            let idr_period = u64::from(self.config.idr_interval) + 1;
            let idr = display_order == 0 || force_idr || self.gop_count % idr_period == 0;
            self.gop_start = display_order;
            self.gop_count = if idr { 1 } else { self.gop_count + 1 };
            return GopPosition {
                display_order,
                gop_position: 0,
                frame_type: if idr { FrameType::IDR } else { FrameType::I },
                pyramid_layer: 0,
            };
        }

        let pos = display_order - self.gop_start;
        let ref_dist = u64::from(self.config.ref_dist);
        if pos % ref_dist == 0 || pos == pic_size - 1 {
            return GopPosition {
                display_order,
                gop_position: pos as u32,
                frame_type: FrameType::P,
                pyramid_layer: 0,
            };
        }

        let lo = pos - pos % ref_dist;
        let hi = (lo + ref_dist).min(pic_size - 1);
        let (pyramid_layer, reference) =
            b_layer(self.config.b_pyramid, self.gop_start + lo, self.gop_start + hi, display_order);
        GopPosition {
            display_order,
            gop_position: pos as u32,
            frame_type: FrameType {
                reference,
                ..FrameType::B
            },
            pyramid_layer,
        }
    }
}

/// Layer and reference flag of a B picture at display order `d`, strictly
/// between anchors `lo` and `hi`.
pub fn b_layer(pyramid: bool, lo: u64, hi: u64, d: u64) -> (u8, bool) {
    debug_assert!(lo < d && d < hi, "{d} is not inside ({lo}, {hi})");
    if !pyramid {
        return (1, false);
    }
    let (mut lo, mut hi) = (lo, hi);
    let mut layer = 1u8;
    loop {
        let mid = (lo + hi) / 2;
        if d == mid {
            return (layer, mid - lo > 1 || hi - mid > 1);
        }
        if d < mid {
            hi = mid;
        } else {
            lo = mid;
        }
        layer += 1;
    }
}

/// Reference B pictures a single mini-GOP keeps in the DPB at once.
pub fn max_reference_b(config: &GopConfig) -> usize {
    if !config.b_pyramid || config.ref_dist < 2 {
        return 0;
    }
    let hi = u64::from(config.ref_dist);
    (1..hi).filter(|&d| b_layer(true, 0, hi, d).1).count()
}
