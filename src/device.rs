//! Collaborator interfaces the pipeline drives: the GPU compute runtime, the
//! fixed-function encode DDI, and the frame-surface allocator.
//!
//! Every call crossing into a device returns `Result<_, PipelineError>`; the
//! pipeline never sees raw pointers, only the opaque handles defined here.

use std::time::Duration;

use crate::{FrameType, PipelineError, PoolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuEvent(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Nv12,
    Luma8,
    /// Linear byte buffer for compressed output.
    Linear,
}

#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub purpose: PoolKind,
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub count: usize,
}

pub trait SurfaceAllocator: Send {
    fn alloc(&mut self, request: &AllocRequest) -> Result<Vec<SurfaceHandle>, PipelineError>;

    /// Maps `handle` for the duration of `access`; the surface is unlocked on return.
    fn lock(
        &mut self,
        handle: SurfaceHandle,
        access: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PipelineError>;

    fn free(&mut self, handles: &[SurfaceHandle]);
}

#[derive(Debug, Clone)]
pub struct SurfaceSpec {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    /// Wrap an allocator surface instead of creating GPU-private storage.
    pub shared: Option<SurfaceHandle>,
}

#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub purpose: PoolKind,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    SceneChange,
    MotionEstimation,
    Histogram,
}

#[derive(Debug, Clone)]
pub struct KernelArgs {
    pub frame_order: u64,
    pub source: GpuHandle,
    /// Downscaled copy written by motion estimation.
    pub target: Option<GpuHandle>,
    pub forward: Option<GpuHandle>,
    pub backward: Option<GpuHandle>,
    pub output: Option<GpuHandle>,
    pub curbe: Option<GpuHandle>,
}

impl KernelArgs {
    pub fn new(frame_order: u64, source: GpuHandle) -> Self {
        Self {
            frame_order,
            source,
            target: None,
            forward: None,
            backward: None,
            output: None,
            curbe: None,
        }
    }
}

/// Motion-estimation parameter block uploaded before each submission.
#[derive(Debug, Clone, PartialEq)]
pub struct CurbeBlock {
    pub qp: u8,
    pub lambda: u32,
    pub search_width: u8,
    pub search_height: u8,
    pub mode_costs: [u8; 8],
    pub mv_costs: [u8; 8],
    pub block_cols: u32,
    pub block_rows: u32,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Done,
    Busy,
    Timeout,
}

/// Quarter-pel motion vector in downscaled lookahead pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    Intra,
    Forward,
    Backward,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStats {
    pub intra_cost: u32,
    pub inter_cost: u32,
    pub prediction: Prediction,
    pub mv_forward: MotionVector,
    pub mv_backward: MotionVector,
}

#[derive(Debug, Clone)]
pub enum KernelOutput {
    /// Coarse luma thumbnail used for scene-change scoring.
    Thumbnail(Vec<u8>),
    Motion(Vec<BlockStats>),
    Histogram(Vec<u32>),
}

pub trait GpuExecutor: Send {
    fn create_surface(&mut self, spec: &SurfaceSpec) -> Result<GpuHandle, PipelineError>;

    fn create_buffer(&mut self, spec: &BufferSpec) -> Result<GpuHandle, PipelineError>;

    fn write_curbe(&mut self, buffer: GpuHandle, curbe: &CurbeBlock) -> Result<(), PipelineError>;

    fn submit_kernel(&mut self, kernel: Kernel, args: &KernelArgs)
    -> Result<GpuEvent, PipelineError>;

    fn wait_event(&mut self, event: GpuEvent, timeout: Duration)
    -> Result<EventStatus, PipelineError>;

    /// Copies the result of a completed event out of device memory.
    fn read_output(&mut self, event: GpuEvent) -> Result<KernelOutput, PipelineError>;

    fn destroy_event(&mut self, event: GpuEvent);

    fn destroy(&mut self, handle: GpuHandle);
}

/// Everything the DDI needs to encode one picture.
#[derive(Debug, Clone)]
pub struct EncodeTask {
    pub display_order: u64,
    pub encode_order: u64,
    pub frame_type: FrameType,
    pub pyramid_layer: u8,
    pub qp: u8,
    pub skip: bool,
    pub weighted_prediction: bool,
    pub scene_cut: bool,
    pub raw: SurfaceHandle,
    pub recon: Option<SurfaceHandle>,
    pub bitstream: SurfaceHandle,
    /// Field `f` writes at `f * bitstream_capacity / field_count`.
    pub bitstream_capacity: usize,
    pub field_count: u8,
    pub refs_l0: Vec<SurfaceHandle>,
    pub refs_l1: Vec<SurfaceHandle>,
}

impl EncodeTask {
    pub fn field_offset(&self, field: FieldId) -> usize {
        let per_field = self.bitstream_capacity / usize::from(self.field_count.max(1));
        per_field * usize::from(field.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeReport {
    pub bytes_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    Busy,
    Done(EncodeReport),
}

pub trait EncodeDdi: Send {
    fn register_surface_pool(
        &mut self,
        pool: PoolKind,
        surfaces: &[SurfaceHandle],
    ) -> Result<(), PipelineError>;

    fn execute(
        &mut self,
        raw: SurfaceHandle,
        task: &EncodeTask,
        field: FieldId,
    ) -> Result<(), PipelineError>;

    fn query_status(
        &mut self,
        task: &EncodeTask,
        field: FieldId,
    ) -> Result<EncodeStatus, PipelineError>;
}

/// The three collaborators a pipeline instance owns.
pub struct Devices {
    pub gpu: Box<dyn GpuExecutor>,
    pub hardware: Box<dyn EncodeDdi>,
    pub allocator: Box<dyn SurfaceAllocator>,
}

impl std::fmt::Debug for Devices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Devices { .. }")
    }
}
