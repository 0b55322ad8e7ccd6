//! Display-order to encode-order promotion.
//!
//! Frames wait in the reordering queue until the anchor closing their
//! mini-GOP has been promoted. B pictures then follow in pyramid-layer order
//! so every reference is encoded before the pictures predicting from it.

use crate::gop::b_layer;
use crate::task::TaskId;
use crate::{FrameType, PictureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFrame {
    pub id: TaskId,
    pub display_order: u64,
    pub frame_type: FrameType,
    pub layer: u8,
}

/// Type change forced on a waiting frame when its mini-GOP is cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retype {
    pub id: TaskId,
    pub frame_type: FrameType,
    pub layer: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub id: TaskId,
    pub retypes: Vec<Retype>,
}

#[derive(Debug)]
pub struct Reorderer {
    pyramid: bool,
    last_anchor: Option<u64>,
    next_encode_order: u64,
}

impl Reorderer {
    pub fn new(pyramid: bool) -> Self {
        Self {
            pyramid,
            last_anchor: None,
            next_encode_order: 0,
        }
    }

    /// Picks the next frame to enter encode order. `pending` is the reordering
    /// queue in display order. Nothing is committed until [`Self::commit`].
    pub fn select(&self, pending: &[PendingFrame], eos: bool) -> Option<Promotion> {
        let eligible_b = pending
            .iter()
            .filter(|f| !f.frame_type.is_anchor())
            .filter(|f| self.last_anchor.is_some_and(|a| f.display_order < a))
            .min_by_key(|f| (f.layer, f.display_order));
        if let Some(b) = eligible_b {
            return Some(Promotion {
                id: b.id,
                retypes: Vec::new(),
            });
        }

        let anchor_at = pending.iter().position(|f| f.frame_type.is_anchor());
        match anchor_at {
            Some(0) => Some(Promotion {
                id: pending[0].id,
                retypes: Vec::new(),
            }),
            Some(at) if !pending[at].frame_type.idr => Some(Promotion {
                id: pending[at].id,
                retypes: Vec::new(),
            }),
            // B pictures cannot reference across an IDR.
            Some(at) => Some(self.close_run(&pending[..at])),
            None if eos && !pending.is_empty() => Some(self.close_run(pending)),
            None => None,
        }
    }

    /// Turns the last B of `run` into a P anchor and re-derives the layers of
    /// the B pictures left in front of it.
    fn close_run(&self, run: &[PendingFrame]) -> Promotion {
        let last = run[run.len() - 1];
        let terminal = Retype {
            id: last.id,
            frame_type: FrameType::P,
            layer: 0,
        };
        let lo = self
            .last_anchor
            .unwrap_or_else(|| run[0].display_order.saturating_sub(1));
        let mut retypes: Vec<Retype> = run[..run.len() - 1]
            .iter()
            .map(|f| {
                let (layer, reference) = b_layer(self.pyramid, lo, last.display_order, f.display_order);
                Retype {
                    id: f.id,
                    frame_type: FrameType {
                        reference,
                        ..FrameType::B
                    },
                    layer,
                }
            })
            .collect();
        retypes.push(terminal);
        Promotion {
            id: last.id,
            retypes,
        }
    }

    /// Records the promotion of a frame and returns its encode order.
    pub fn commit(&mut self, display_order: u64, frame_type: FrameType) -> u64 {
        if frame_type.kind != PictureKind::B {
            self.last_anchor = Some(display_order);
        }
        let order = self.next_encode_order;
        self.next_encode_order += 1;
        order
    }

    pub fn promoted(&self) -> u64 {
        self.next_encode_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(display_order: u64, frame_type: FrameType, layer: u8) -> PendingFrame {
        PendingFrame {
            id: TaskId(display_order as usize),
            display_order,
            frame_type,
            layer,
        }
    }

    fn apply(pending: &mut Vec<PendingFrame>, promotion: &Promotion) -> PendingFrame {
        for retype in &promotion.retypes {
            let f = pending.iter_mut().find(|f| f.id == retype.id).unwrap();
            f.frame_type = retype.frame_type;
            f.layer = retype.layer;
        }
        let at = pending.iter().position(|f| f.id == promotion.id).unwrap();
        pending.remove(at)
    }

    fn encode_order(reorderer: &mut Reorderer, mut pending: Vec<PendingFrame>, eos: bool) -> Vec<u64> {
        let mut order = Vec::new();
        while let Some(promotion) = reorderer.select(&pending, eos) {
            let f = apply(&mut pending, &promotion);
            reorderer.commit(f.display_order, f.frame_type);
            order.push(f.display_order);
        }
        order
    }

    #[test]
    fn anchors_precede_their_b_pictures() {
        let mut r = Reorderer::new(false);
        let pending = vec![
            frame(0, FrameType::IDR, 0),
            frame(1, FrameType::B, 1),
            frame(2, FrameType::B, 1),
            frame(3, FrameType::P, 0),
        ];
        assert_eq!(encode_order(&mut r, pending, false), vec![0, 3, 1, 2]);
        assert_eq!(r.promoted(), 4);
    }

    #[test]
    fn pyramid_promotes_lower_layers_first() {
        let mut r = Reorderer::new(true);
        let b_ref = FrameType {
            reference: true,
            ..FrameType::B
        };
        let pending = vec![
            frame(0, FrameType::IDR, 0),
            frame(1, FrameType::B, 2),
            frame(2, b_ref, 1),
            frame(3, FrameType::B, 2),
            frame(4, FrameType::P, 0),
        ];
        assert_eq!(encode_order(&mut r, pending, false), vec![0, 4, 2, 1, 3]);
    }

    #[test]
    fn trailing_bs_wait_for_more_input() {
        let mut r = Reorderer::new(false);
        let pending = vec![frame(0, FrameType::IDR, 0), frame(1, FrameType::B, 1)];
        assert_eq!(encode_order(&mut r, pending, false), vec![0]);
    }

    #[test]
    fn end_of_stream_gives_trailing_run_a_terminal_anchor() {
        let mut r = Reorderer::new(false);
        r.commit(0, FrameType::IDR);
        let pending = vec![frame(1, FrameType::B, 1), frame(2, FrameType::B, 1)];
        let promotion = r.select(&pending, true).unwrap();
        assert_eq!(promotion.id, TaskId(2));
        assert_eq!(promotion.retypes.last().unwrap().frame_type, FrameType::P);
        assert_eq!(encode_order(&mut r, pending, true), vec![2, 1]);
    }

    #[test]
    fn forced_idr_closes_open_run() {
        let mut r = Reorderer::new(false);
        r.commit(0, FrameType::IDR);
        let pending = vec![
            frame(1, FrameType::B, 1),
            frame(2, FrameType::B, 1),
            frame(3, FrameType::IDR, 0),
        ];
        assert_eq!(encode_order(&mut r, pending, false), vec![2, 1, 3]);
    }
}
