//! Hardware video encoder front-end.
//!
//! An [`EncodeSession`] accepts NV12 frames, runs scene-change detection,
//! GPU lookahead and a luma histogram on them, hands them to a fixed-function
//! encoder through the [`EncodeDdi`] trait and re-encodes frames whose size
//! breaks the rate-control buffer model. Everything runs on the caller's
//! thread: each [`EncodeSession::drive`] call advances every stage by at most
//! one frame.

mod analysis;
pub mod bitstream;
pub mod brc;
mod channel;
mod contract;
pub mod device;
pub mod dpb;
mod encode;
pub mod gop;
pub mod lookahead;
mod pipeline;
pub mod pool;
pub mod queue;
pub mod reorder;
pub mod resources;
mod scheduler;
pub mod sim;
pub mod task;
pub mod worker;

pub use contract::{
    Codec, ControlHints, Dimensions, DriveStatus, EncodedUnit, ErrorKind, FrameType, GopConfig,
    HistogramOptions, LookaheadOptions, PictureKind, PictureStructure, PipelineConfig,
    PipelineError, PoolKind, PoolSizes, RateControl, RateControlMethod, RawFrame,
    SceneChangeOptions, SubmitStatus, Timestamp90k,
};
pub use device::{Devices, EncodeDdi, GpuExecutor, SurfaceAllocator};
pub use pipeline::{PipelineCounters, PipelineStats};
pub use worker::{EncodeWorker, WorkerError, WorkerEvent};

use pipeline::Pipeline;

/// One encode instance. Owns its devices and every pooled resource; all of
/// them are released when the session is dropped.
#[derive(Debug)]
pub struct EncodeSession {
    pipeline: Pipeline,
}

impl EncodeSession {
    /// Validates `config`, sizes the pools and allocates every surface and
    /// GPU object up front.
    pub fn new(config: PipelineConfig, devices: Devices) -> Result<Self, PipelineError> {
        Ok(Self {
            pipeline: Pipeline::new(config, devices)?,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    /// Uploads `frame` into a free raw surface.
    ///
    /// `Busy` leaves the session untouched; drive it and retry.
    pub fn submit_frame(
        &mut self,
        frame: &RawFrame,
        hints: ControlHints,
    ) -> Result<SubmitStatus, PipelineError> {
        self.pipeline.submit_frame(frame, hints)
    }

    /// Signals end of stream. Frames already submitted are still encoded.
    pub fn flush(&mut self) {
        self.pipeline.flush();
    }

    /// Runs one scheduler tick.
    ///
    /// After a fatal error, already announced units are reported as
    /// `OutputReady` and every later call returns [`PipelineError::Halted`].
    pub fn drive(&mut self) -> Result<DriveStatus, PipelineError> {
        self.pipeline.drive()
    }

    pub fn retrieve_output(&mut self) -> Option<EncodedUnit> {
        self.pipeline.retrieve_output()
    }

    /// Flushes and drives until every submitted frame has come back.
    pub fn drain(&mut self) -> Result<Vec<EncodedUnit>, PipelineError> {
        self.flush();
        let mut out = Vec::new();
        let mut idle_ticks = 0;
        loop {
            match self.drive()? {
                DriveStatus::OutputReady => {
                    idle_ticks = 0;
                    out.extend(self.retrieve_output());
                }
                DriveStatus::Progress => idle_ticks = 0,
                DriveStatus::Drained => break,
                DriveStatus::NeedMoreInput => {
                    idle_ticks += 1;
                    if idle_ticks > 2 {
                        return Err(PipelineError::DeviceFailed(
                            "pipeline stalled while draining".to_string(),
                        ));
                    }
                }
            }
        }
        out.extend(std::iter::from_fn(|| self.retrieve_output()));
        Ok(out)
    }

    pub fn halted(&self) -> Option<ErrorKind> {
        self.pipeline.halted()
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Every task sits in exactly one queue and every held slot names its
    /// holder as owner.
    pub fn is_consistent(&self) -> bool {
        self.pipeline.queues_consistent() && self.pipeline.ownership_consistent()
    }
}
