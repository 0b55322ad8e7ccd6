//! Sliding-window reference picture set.
//!
//! The manager only tracks which pictures are referenceable and builds the
//! per-task reference lists; slot reference counts are adjusted by the
//! pipeline, which holds one ref on each active entry's slots.

use crate::FrameType;
use crate::pool::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbEntry {
    pub display_order: u64,
    pub encode_order: u64,
    pub recon: Option<SlotId>,
    pub lookahead: Option<SlotId>,
    pub layer: u8,
    /// I or P picture; reference B pictures are not anchors.
    pub anchor: bool,
}

/// Reference lists attached to a task when it enters encode order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpbView {
    /// Past references, closest first.
    pub l0: Vec<DpbEntry>,
    /// Future references, closest first.
    pub l1: Vec<DpbEntry>,
}

impl DpbView {
    pub fn entries(&self) -> impl Iterator<Item = &DpbEntry> + '_ {
        self.l0.iter().chain(self.l1.iter())
    }

    pub fn forward(&self) -> Option<&DpbEntry> {
        self.l0.first()
    }

    pub fn backward(&self) -> Option<&DpbEntry> {
        self.l1.first()
    }

    pub fn is_empty(&self) -> bool {
        self.l0.is_empty() && self.l1.is_empty()
    }
}

#[derive(Debug)]
pub struct DpbManager {
    entries: Vec<DpbEntry>,
    num_ref_l0: usize,
}

impl DpbManager {
    pub fn new(num_ref_l0: u8) -> Self {
        Self {
            entries: Vec::new(),
            num_ref_l0: usize::from(num_ref_l0.max(1)),
        }
    }

    /// P pictures predict from the closest earlier anchors; B pictures from the
    /// closest earlier reference plus the closest later one.
    pub fn build_view(&self, display_order: u64, frame_type: FrameType) -> DpbView {
        if frame_type.is_intra() {
            return DpbView::default();
        }
        let mut past: Vec<DpbEntry> = self
            .entries
            .iter()
            .filter(|e| e.display_order < display_order)
            .filter(|e| e.anchor || !frame_type.is_anchor())
            .copied()
            .collect();
        past.sort_by_key(|e| std::cmp::Reverse(e.display_order));
        past.truncate(self.num_ref_l0);

        let mut future = Vec::new();
        if !frame_type.is_anchor() {
            future.extend(
                self.entries
                    .iter()
                    .filter(|e| e.display_order > display_order)
                    .min_by_key(|e| e.display_order)
                    .copied(),
            );
        }
        DpbView {
            l0: past,
            l1: future,
        }
    }

    /// Adds a reference picture and returns the entries it pushed out.
    pub fn insert(&mut self, entry: DpbEntry, idr: bool) -> Vec<DpbEntry> {
        let mut evicted = Vec::new();
        if idr {
            evicted.append(&mut self.entries);
        } else if entry.anchor {
            // A new anchor closes the previous mini-GOP; its reference Bs are done.
            let (anchors, bs): (Vec<_>, Vec<_>) =
                self.entries.drain(..).partition(|e| e.anchor);
            evicted.extend(bs);
            self.entries = anchors;
            self.entries.sort_by_key(|e| e.display_order);
            while self.entries.len() > self.num_ref_l0 {
                evicted.push(self.entries.remove(0));
            }
        }
        self.entries.push(entry);
        evicted
    }

    pub fn clear(&mut self) -> Vec<DpbEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn entries(&self) -> &[DpbEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(display_order: u64, encode_order: u64, anchor: bool) -> DpbEntry {
        DpbEntry {
            display_order,
            encode_order,
            recon: Some(SlotId(encode_order as usize)),
            lookahead: None,
            layer: if anchor { 0 } else { 1 },
            anchor,
        }
    }

    #[test]
    fn p_references_closest_anchor() {
        let mut dpb = DpbManager::new(1);
        dpb.insert(entry(0, 0, true), true);
        dpb.insert(entry(3, 1, true), false);
        let view = dpb.build_view(6, FrameType::P);
        assert_eq!(view.l0.len(), 1);
        assert_eq!(view.l0[0].display_order, 3);
        assert!(view.l1.is_empty());
    }

    #[test]
    fn b_references_both_sides() {
        let mut dpb = DpbManager::new(1);
        dpb.insert(entry(0, 0, true), true);
        dpb.insert(entry(3, 1, true), false);
        let view = dpb.build_view(2, FrameType::B);
        assert_eq!(view.forward().map(|e| e.display_order), Some(0));
        assert_eq!(view.backward().map(|e| e.display_order), Some(3));
        assert_eq!(view.entries().count(), 2);
    }

    #[test]
    fn anchor_insert_slides_window_and_drops_reference_bs() {
        let mut dpb = DpbManager::new(1);
        dpb.insert(entry(0, 0, true), true);
        dpb.insert(entry(4, 1, true), false);
        dpb.insert(entry(2, 2, false), false);
        assert_eq!(dpb.len(), 3);
        let evicted = dpb.insert(entry(8, 5, true), false);
        let mut gone: Vec<u64> = evicted.iter().map(|e| e.display_order).collect();
        gone.sort_unstable();
        assert_eq!(gone, vec![0, 2]);
        let kept: Vec<u64> = dpb.entries().iter().map(|e| e.display_order).collect();
        assert_eq!(kept, vec![4, 8]);
    }

    #[test]
    fn idr_flushes_everything() {
        let mut dpb = DpbManager::new(2);
        dpb.insert(entry(0, 0, true), true);
        dpb.insert(entry(1, 1, true), false);
        let evicted = dpb.insert(entry(2, 2, true), true);
        assert_eq!(evicted.len(), 2);
        assert_eq!(dpb.len(), 1);
        assert!(dpb.build_view(3, FrameType::I).is_empty());
    }
}
