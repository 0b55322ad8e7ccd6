//! Stage selection and dispatch.
//!
//! Once per drive call the scheduler looks at queue occupancy and decides
//! which stages may run. Handlers then run downstream first, so a task moved
//! forward by one handler is not picked up again in the same tick.

use std::fmt;

use crate::pipeline::Pipeline;
use crate::queue::QueueKind;
use crate::{PipelineError, PoolKind, analysis, encode, lookahead, pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Accept,
    ScdStart,
    ScdWait,
    LookaheadStart,
    LookaheadWait,
    HistStart,
    HistWait,
    EncodeStart,
    EncodeWait,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Accept,
        Stage::ScdStart,
        Stage::ScdWait,
        Stage::LookaheadStart,
        Stage::LookaheadWait,
        Stage::HistStart,
        Stage::HistWait,
        Stage::EncodeStart,
        Stage::EncodeWait,
    ];

    const fn bit(self) -> u16 {
        1 << self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::ScdStart => "scd_start",
            Self::ScdWait => "scd_wait",
            Self::LookaheadStart => "lookahead_start",
            Self::LookaheadWait => "lookahead_wait",
            Self::HistStart => "hist_start",
            Self::HistWait => "hist_wait",
            Self::EncodeStart => "encode_start",
            Self::EncodeWait => "encode_wait",
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct StageMask(u16);

impl StageMask {
    pub const EMPTY: Self = Self(0);

    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |&stage| self.contains(stage))
    }
}

impl fmt::Debug for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Stage::name)).finish()
    }
}

/// Result of one handler call. Backpressure is `Deferred`, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Advanced,
    Deferred,
    Idle,
}

pub type StageHandler = fn(&mut Pipeline) -> Result<StageOutcome, PipelineError>;

#[derive(Clone, Copy)]
pub struct StageEntry {
    pub stage: Stage,
    pub handler: StageHandler,
}

/// Handlers in execution order: downstream first.
pub const DISPATCH: [StageEntry; 9] = [
    StageEntry {
        stage: Stage::EncodeWait,
        handler: encode::encode_wait,
    },
    StageEntry {
        stage: Stage::EncodeStart,
        handler: encode::encode_start,
    },
    StageEntry {
        stage: Stage::HistWait,
        handler: analysis::hist_wait,
    },
    StageEntry {
        stage: Stage::HistStart,
        handler: analysis::hist_start,
    },
    StageEntry {
        stage: Stage::LookaheadWait,
        handler: lookahead::wait,
    },
    StageEntry {
        stage: Stage::LookaheadStart,
        handler: lookahead::submit,
    },
    StageEntry {
        stage: Stage::ScdWait,
        handler: analysis::scd_wait,
    },
    StageEntry {
        stage: Stage::ScdStart,
        handler: analysis::scd_start,
    },
    StageEntry {
        stage: Stage::Accept,
        handler: pipeline::accept,
    },
];

/// A stage runs when its input queue has a candidate and its output queue is
/// below `async_depth`.
pub fn compute_mask(p: &Pipeline) -> StageMask {
    let q = &p.queues;
    let depth = p.config.async_depth;
    let window = p.config.gop.ref_dist as usize + 1;
    let has = |queue| !q.is_empty(queue);
    let room = |queue| q.len(queue) < depth;

    let mut mask = StageMask::EMPTY;
    let mut enable = |stage, on: bool| {
        if on {
            mask.insert(stage);
        }
    };
    enable(
        Stage::Accept,
        has(QueueKind::Incoming) && q.len(QueueKind::Reordering) < window,
    );
    enable(
        Stage::ScdStart,
        has(QueueKind::Reordering) && room(QueueKind::Scd) && room(QueueKind::ScdDone),
    );
    enable(Stage::ScdWait, has(QueueKind::Scd));
    enable(
        Stage::LookaheadStart,
        has(QueueKind::ScdDone) && room(QueueKind::LookaheadStarted),
    );
    enable(Stage::LookaheadWait, has(QueueKind::LookaheadStarted));
    enable(
        Stage::HistStart,
        lookahead::window_ready(p) && room(QueueKind::Histogram) && room(QueueKind::HistogramDone),
    );
    enable(Stage::HistWait, has(QueueKind::Histogram));
    enable(
        Stage::EncodeStart,
        has(QueueKind::HistogramDone) && room(QueueKind::Encoding),
    );
    enable(Stage::EncodeWait, has(QueueKind::Encoding));
    mask
}

/// Nothing upstream of the lookahead window can advance: no analysis is in
/// flight, the last tick promoted nothing, and no more input can arrive.
pub fn starved(p: &Pipeline) -> bool {
    let q = &p.queues;
    let upstream_busy = [
        QueueKind::Scd,
        QueueKind::ScdDone,
        QueueKind::LookaheadStarted,
    ]
    .into_iter()
    .any(|queue| !q.is_empty(queue));
    let input_blocked = q.is_empty(QueueKind::Free) || p.pools.available(PoolKind::Raw) == 0 || p.eos;
    !upstream_busy && p.promotion_stalled && input_blocked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_tracks_inserted_stages() {
        let mut mask = StageMask::EMPTY;
        assert!(mask.is_empty());
        mask.insert(Stage::EncodeWait);
        mask.insert(Stage::Accept);
        assert!(mask.contains(Stage::Accept));
        assert!(!mask.contains(Stage::ScdStart));
        let stages: Vec<Stage> = mask.iter().collect();
        assert_eq!(stages, vec![Stage::Accept, Stage::EncodeWait]);
        assert_eq!(format!("{mask:?}"), r#"{"accept", "encode_wait"}"#);
    }

    #[test]
    fn dispatch_runs_downstream_first() {
        let order: Vec<Stage> = DISPATCH.iter().map(|entry| entry.stage).collect();
        let mut expected = Stage::ALL.to_vec();
        expected.reverse();
        assert_eq!(order, expected);
    }
}
