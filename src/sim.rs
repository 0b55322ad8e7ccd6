//! Deterministic in-memory devices.
//!
//! `SimDevices` implements the GPU executor, the encode DDI and the surface
//! allocator over one shared store, so kernels really read the uploaded
//! frames and the encoder really writes into the bitstream surfaces. Latency
//! is counted in polls, not time, which keeps runs reproducible.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::device::{
    AllocRequest, BlockStats, BufferSpec, CurbeBlock, Devices, EncodeDdi, EncodeReport,
    EncodeStatus, EncodeTask, EventStatus, FieldId, GpuEvent, GpuExecutor, GpuHandle, Kernel,
    KernelArgs, KernelOutput, MotionVector, Prediction, SurfaceAllocator, SurfaceFormat,
    SurfaceHandle, SurfaceSpec,
};
use crate::lookahead::BLOCK_SIZE;
use crate::{Codec, Dimensions, FrameType, PictureKind, PipelineError, PoolKind, RawFrame};

const THUMBNAIL_GRID: u32 = 8;
const MIN_UNIT_BYTES: usize = 8;

/// How many bytes the simulated encoder produces per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeModel {
    Fixed(usize),
    /// `base_bytes` for a P picture at `base_qp`, halving every 6 QP.
    QpScaled { base_bytes: usize, base_qp: u8 },
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub codec: Codec,
    /// Polls a kernel event stays busy.
    pub gpu_latency: u32,
    /// Polls a field encode stays busy.
    pub encode_latency: u32,
    /// Kernel and display order whose event reports a timeout.
    pub gpu_hang: Option<(Kernel, u64)>,
    /// Display order whose encode never completes.
    pub encode_hang: Option<u64>,
    pub size: SizeModel,
    /// Per display order sizes that override `size`.
    pub scripted: BTreeMap<u64, usize>,
    /// Size of a skip-coded picture.
    pub skip_bytes: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            gpu_latency: 1,
            encode_latency: 1,
            gpu_hang: None,
            encode_hang: None,
            size: SizeModel::QpScaled {
                base_bytes: 600,
                base_qp: 30,
            },
            scripted: BTreeMap::new(),
            skip_bytes: 12,
        }
    }
}

/// One DDI execute call as the hardware saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimExecution {
    pub display_order: u64,
    pub encode_order: u64,
    pub frame_type: FrameType,
    pub qp: u8,
    pub skip: bool,
    pub field: u8,
    /// Display orders of the pictures whose reconstructions were referenced.
    pub refs: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SimLog {
    pub executions: Vec<SimExecution>,
    pub kernels: Vec<(Kernel, u64)>,
    pub curbes: Vec<CurbeBlock>,
    pub registered_pools: Vec<(PoolKind, usize)>,
}

#[derive(Debug)]
struct Plane {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Plane {
    fn new(format: SurfaceFormat, width: u32, height: u32) -> Self {
        let luma = width as usize * height as usize;
        let len = match format {
            SurfaceFormat::Nv12 => luma + luma / 2,
            SurfaceFormat::Luma8 | SurfaceFormat::Linear => luma,
        };
        Self {
            width,
            height,
            data: vec![0; len],
        }
    }

    fn luma(&self, x: u32, y: u32) -> u8 {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        self.data[y as usize * self.width as usize + x as usize]
    }
}

#[derive(Debug)]
enum GpuObject {
    Shared(SurfaceHandle),
    Private(Plane),
    Buffer(Vec<u8>),
}

#[derive(Debug)]
struct PendingEvent {
    polls_left: u32,
    hang: bool,
    output: Option<KernelOutput>,
}

#[derive(Debug)]
struct PendingEncode {
    polls_left: u32,
    hang: bool,
    bytes: usize,
}

#[derive(Debug)]
struct SimStore {
    config: SimConfig,
    next_handle: u64,
    surfaces: HashMap<u64, Plane>,
    gpu_objects: HashMap<u64, GpuObject>,
    events: HashMap<u64, PendingEvent>,
    encodes: HashMap<(u64, u8), PendingEncode>,
    recon_owner: HashMap<SurfaceHandle, u64>,
    log: SimLog,
}

impl SimStore {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn plane(&self, handle: GpuHandle) -> Result<&Plane, PipelineError> {
        match self.gpu_objects.get(&handle.0) {
            Some(GpuObject::Shared(surface)) => self
                .surfaces
                .get(&surface.0)
                .ok_or_else(|| PipelineError::Gpu(format!("surface {} was freed", surface.0))),
            Some(GpuObject::Private(plane)) => Ok(plane),
            Some(GpuObject::Buffer(_)) => Err(PipelineError::Gpu(format!(
                "gpu object {} is a buffer, not a surface",
                handle.0
            ))),
            None => Err(PipelineError::Gpu(format!("unknown gpu object {}", handle.0))),
        }
    }

    fn run_kernel(&mut self, kernel: Kernel, args: &KernelArgs) -> Result<KernelOutput, PipelineError> {
        match kernel {
            Kernel::SceneChange => Ok(KernelOutput::Thumbnail(thumbnail(self.plane(args.source)?))),
            Kernel::Histogram => Ok(KernelOutput::Histogram(histogram(self.plane(args.source)?))),
            Kernel::MotionEstimation => self.motion_estimation(args),
        }
    }

    fn motion_estimation(&mut self, args: &KernelArgs) -> Result<KernelOutput, PipelineError> {
        let Some(target) = args.target else {
            return Err(PipelineError::Gpu("motion estimation without a target surface".into()));
        };
        let (width, height) = {
            let plane = self.plane(target)?;
            (plane.width, plane.height)
        };
        let scaled = downscale(self.plane(args.source)?, width, height);
        match self.gpu_objects.get_mut(&target.0) {
            Some(GpuObject::Private(plane)) => plane.data.copy_from_slice(&scaled.data),
            _ => return Err(PipelineError::Gpu("lookahead target must be gpu private".into())),
        }
        let forward = args.forward.map(|h| self.plane(h)).transpose()?;
        let backward = args.backward.map(|h| self.plane(h)).transpose()?;

        let cols = width.div_ceil(BLOCK_SIZE);
        let rows = height.div_ceil(BLOCK_SIZE);
        let mut stats = Vec::with_capacity(cols as usize * rows as usize);
        for row in 0..rows {
            for col in 0..cols {
                stats.push(block_stats(&scaled, forward, backward, col, row));
            }
        }
        Ok(KernelOutput::Motion(stats))
    }

    fn frame_bytes(&self, task: &EncodeTask) -> usize {
        if task.skip {
            return self.config.skip_bytes;
        }
        if let Some(&bytes) = self.config.scripted.get(&task.display_order) {
            return bytes;
        }
        match self.config.size {
            SizeModel::Fixed(bytes) => bytes,
            SizeModel::QpScaled {
                base_bytes,
                base_qp,
            } => {
                let weight = match task.frame_type.kind {
                    PictureKind::I => 3.0,
                    PictureKind::P => 1.0,
                    PictureKind::B => 0.6,
                };
                let scale = 2f64.powf((f64::from(base_qp) - f64::from(task.qp)) / 6.0);
                (base_bytes as f64 * weight * scale).round() as usize
            }
        }
    }
}

fn thumbnail(plane: &Plane) -> Vec<u8> {
    let mut out = Vec::with_capacity((THUMBNAIL_GRID * THUMBNAIL_GRID) as usize);
    for ty in 0..THUMBNAIL_GRID {
        for tx in 0..THUMBNAIL_GRID {
            let x0 = tx * plane.width / THUMBNAIL_GRID;
            let x1 = ((tx + 1) * plane.width / THUMBNAIL_GRID).max(x0 + 1);
            let y0 = ty * plane.height / THUMBNAIL_GRID;
            let y1 = ((ty + 1) * plane.height / THUMBNAIL_GRID).max(y0 + 1);
            let mut sum = 0u64;
            let mut n = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += u64::from(plane.luma(x, y));
                    n += 1;
                }
            }
            out.push((sum / n) as u8);
        }
    }
    out
}

fn histogram(plane: &Plane) -> Vec<u32> {
    let mut bins = vec![0u32; 256];
    let luma = plane.width as usize * plane.height as usize;
    for &value in &plane.data[..luma] {
        bins[usize::from(value)] += 1;
    }
    bins
}

fn downscale(source: &Plane, width: u32, height: u32) -> Plane {
    let fx = source.width.div_ceil(width).max(1);
    let fy = source.height.div_ceil(height).max(1);
    let mut out = Plane::new(SurfaceFormat::Luma8, width, height);
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0u32;
            for dy in 0..fy {
                for dx in 0..fx {
                    sum += u32::from(source.luma(x * fx + dx, y * fy + dy));
                }
            }
            out.data[(y * width + x) as usize] = (sum / (fx * fy)) as u8;
        }
    }
    out
}

fn block_pixels(width: u32, height: u32, col: u32, row: u32) -> impl Iterator<Item = (u32, u32)> {
    let x0 = col * BLOCK_SIZE;
    let y0 = row * BLOCK_SIZE;
    (y0..(y0 + BLOCK_SIZE).min(height))
        .flat_map(move |y| (x0..(x0 + BLOCK_SIZE).min(width)).map(move |x| (x, y)))
}

fn block_stats(
    current: &Plane,
    forward: Option<&Plane>,
    backward: Option<&Plane>,
    col: u32,
    row: u32,
) -> BlockStats {
    let pixels: Vec<(u32, u32)> = block_pixels(current.width, current.height, col, row).collect();
    let n = pixels.len().max(1) as u32;
    let mean = pixels
        .iter()
        .map(|&(x, y)| u32::from(current.luma(x, y)))
        .sum::<u32>()
        / n;
    // A flat block still costs its mode signalling.
    let intra_cost = 16 + pixels
        .iter()
        .map(|&(x, y)| u32::from(current.luma(x, y)).abs_diff(mean))
        .sum::<u32>();
    let sad = |reference: &Plane| {
        pixels
            .iter()
            .map(|&(x, y)| current.luma(x, y).abs_diff(reference.luma(x, y)) as u32)
            .sum::<u32>()
    };
    let candidates = [
        forward.map(|f| (sad(f), Prediction::Forward)),
        backward.map(|b| (sad(b), Prediction::Backward)),
        forward.zip(backward).map(|(f, b)| {
            let cost = pixels
                .iter()
                .map(|&(x, y)| {
                    let avg = (u32::from(f.luma(x, y)) + u32::from(b.luma(x, y)) + 1) / 2;
                    u32::from(current.luma(x, y)).abs_diff(avg)
                })
                .sum::<u32>();
            (cost, Prediction::Bidirectional)
        }),
    ];
    let best = candidates.into_iter().flatten().min_by_key(|&(cost, _)| cost);
    let (inter_cost, prediction) = match best {
        Some((cost, prediction)) if cost < intra_cost => (cost, prediction),
        Some((cost, _)) => (cost, Prediction::Intra),
        None => (intra_cost, Prediction::Intra),
    };
    BlockStats {
        intra_cost,
        inter_cost,
        prediction,
        mv_forward: MotionVector::default(),
        mv_backward: MotionVector::default(),
    }
}

fn slice_header(codec: Codec, frame_type: FrameType) -> &'static [u8] {
    match (codec, frame_type.idr, frame_type.reference) {
        (Codec::H264, true, _) => &[0x65],
        (Codec::H264, false, true) => &[0x41],
        (Codec::H264, false, false) => &[0x01],
        (Codec::Hevc, true, _) => &[19 << 1, 0x01],
        (Codec::Hevc, false, true) => &[1 << 1, 0x01],
        (Codec::Hevc, false, false) => &[0x00, 0x01],
    }
}

/// Shared handle to the simulated devices; clones see the same state.
#[derive(Debug, Clone)]
pub struct SimDevices {
    store: Arc<Mutex<SimStore>>,
}

impl SimDevices {
    pub fn new(config: SimConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(SimStore {
                config,
                next_handle: 0,
                surfaces: HashMap::new(),
                gpu_objects: HashMap::new(),
                events: HashMap::new(),
                encodes: HashMap::new(),
                recon_owner: HashMap::new(),
                log: SimLog::default(),
            })),
        }
    }

    fn store(&self) -> MutexGuard<'_, SimStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boxed collaborators for one pipeline instance.
    pub fn devices(&self) -> Devices {
        Devices {
            gpu: Box::new(self.clone()),
            hardware: Box::new(self.clone()),
            allocator: Box::new(self.clone()),
        }
    }

    pub fn log(&self) -> SimLog {
        self.store().log.clone()
    }

    pub fn live_surfaces(&self) -> usize {
        self.store().surfaces.len()
    }

    pub fn live_gpu_objects(&self) -> usize {
        self.store().gpu_objects.len()
    }

    pub fn live_events(&self) -> usize {
        self.store().events.len()
    }

    pub fn configure(&self, update: impl FnOnce(&mut SimConfig)) {
        update(&mut self.store().config);
    }
}

impl SurfaceAllocator for SimDevices {
    fn alloc(&mut self, request: &AllocRequest) -> Result<Vec<SurfaceHandle>, PipelineError> {
        let mut store = self.store();
        let handles = (0..request.count)
            .map(|_| {
                let id = store.next();
                let plane = Plane::new(request.format, request.width, request.height);
                store.surfaces.insert(id, plane);
                SurfaceHandle(id)
            })
            .collect();
        Ok(handles)
    }

    fn lock(
        &mut self,
        handle: SurfaceHandle,
        access: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PipelineError> {
        let mut store = self.store();
        let plane = store
            .surfaces
            .get_mut(&handle.0)
            .ok_or_else(|| PipelineError::Allocator(format!("lock of unknown surface {}", handle.0)))?;
        access(&mut plane.data);
        Ok(())
    }

    fn free(&mut self, handles: &[SurfaceHandle]) {
        let mut store = self.store();
        for handle in handles {
            store.surfaces.remove(&handle.0);
        }
    }
}

impl GpuExecutor for SimDevices {
    fn create_surface(&mut self, spec: &SurfaceSpec) -> Result<GpuHandle, PipelineError> {
        let mut store = self.store();
        let object = match spec.shared {
            Some(surface) if store.surfaces.contains_key(&surface.0) => GpuObject::Shared(surface),
            Some(surface) => {
                return Err(PipelineError::Gpu(format!("cannot share unknown surface {}", surface.0)));
            }
            None => GpuObject::Private(Plane::new(spec.format, spec.width, spec.height)),
        };
        let id = store.next();
        store.gpu_objects.insert(id, object);
        Ok(GpuHandle(id))
    }

    fn create_buffer(&mut self, spec: &BufferSpec) -> Result<GpuHandle, PipelineError> {
        let mut store = self.store();
        let id = store.next();
        store.gpu_objects.insert(id, GpuObject::Buffer(vec![0; spec.size]));
        Ok(GpuHandle(id))
    }

    fn write_curbe(&mut self, buffer: GpuHandle, curbe: &CurbeBlock) -> Result<(), PipelineError> {
        let mut store = self.store();
        if !matches!(store.gpu_objects.get(&buffer.0), Some(GpuObject::Buffer(_))) {
            return Err(PipelineError::Gpu(format!("curbe target {} is not a buffer", buffer.0)));
        }
        store.log.curbes.push(curbe.clone());
        Ok(())
    }

    fn submit_kernel(&mut self, kernel: Kernel, args: &KernelArgs) -> Result<GpuEvent, PipelineError> {
        let mut store = self.store();
        let output = store.run_kernel(kernel, args)?;
        let hang = store.config.gpu_hang == Some((kernel, args.frame_order));
        let polls_left = store.config.gpu_latency;
        store.log.kernels.push((kernel, args.frame_order));
        let id = store.next();
        store.events.insert(
            id,
            PendingEvent {
                polls_left,
                hang,
                output: Some(output),
            },
        );
        Ok(GpuEvent(id))
    }

    fn wait_event(&mut self, event: GpuEvent, _timeout: Duration) -> Result<EventStatus, PipelineError> {
        let mut store = self.store();
        let Some(pending) = store.events.get_mut(&event.0) else {
            return Err(PipelineError::Gpu(format!("wait on unknown event {}", event.0)));
        };
        if pending.hang {
            return Ok(EventStatus::Timeout);
        }
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(EventStatus::Busy);
        }
        Ok(EventStatus::Done)
    }

    fn read_output(&mut self, event: GpuEvent) -> Result<KernelOutput, PipelineError> {
        let mut store = self.store();
        store
            .events
            .get_mut(&event.0)
            .and_then(|pending| pending.output.take())
            .ok_or_else(|| PipelineError::Gpu(format!("event {} has no output", event.0)))
    }

    fn destroy_event(&mut self, event: GpuEvent) {
        self.store().events.remove(&event.0);
    }

    fn destroy(&mut self, handle: GpuHandle) {
        self.store().gpu_objects.remove(&handle.0);
    }
}

impl EncodeDdi for SimDevices {
    fn register_surface_pool(
        &mut self,
        pool: PoolKind,
        surfaces: &[SurfaceHandle],
    ) -> Result<(), PipelineError> {
        self.store().log.registered_pools.push((pool, surfaces.len()));
        Ok(())
    }

    fn execute(
        &mut self,
        raw: SurfaceHandle,
        task: &EncodeTask,
        field: FieldId,
    ) -> Result<(), PipelineError> {
        let mut store = self.store();
        if !store.surfaces.contains_key(&raw.0) {
            return Err(PipelineError::DeviceFailed(format!("unknown raw surface {}", raw.0)));
        }
        let fields = usize::from(task.field_count.max(1));
        let per_field_capacity = task.bitstream_capacity / fields;
        let total = store.frame_bytes(task).max(MIN_UNIT_BYTES * fields);
        let share = total / fields + if field.0 == 0 { total % fields } else { 0 };
        let bytes = share.min(per_field_capacity);

        let header = slice_header(store.config.codec, task.frame_type);
        let fill = 0x80 | (task.display_order as u8 & 0x7f);
        let offset = task.field_offset(field);
        let Some(bitstream) = store.surfaces.get_mut(&task.bitstream.0) else {
            return Err(PipelineError::DeviceFailed(format!(
                "unknown bitstream surface {}",
                task.bitstream.0
            )));
        };
        let out = &mut bitstream.data[offset..offset + bytes];
        out[..4].copy_from_slice(&[0, 0, 0, 1]);
        out[4..4 + header.len()].copy_from_slice(header);
        out[4 + header.len()..].fill(fill);

        if let Some(recon) = task.recon {
            store.recon_owner.insert(recon, task.display_order);
        }
        let refs = task
            .refs_l0
            .iter()
            .chain(&task.refs_l1)
            .filter_map(|surface| store.recon_owner.get(surface).copied())
            .collect();
        let hang = store.config.encode_hang == Some(task.display_order);
        let polls_left = store.config.encode_latency;
        store.encodes.insert(
            (task.encode_order, field.0),
            PendingEncode {
                polls_left,
                hang,
                bytes,
            },
        );
        store.log.executions.push(SimExecution {
            display_order: task.display_order,
            encode_order: task.encode_order,
            frame_type: task.frame_type,
            qp: task.qp,
            skip: task.skip,
            field: field.0,
            refs,
        });
        Ok(())
    }

    fn query_status(&mut self, task: &EncodeTask, field: FieldId) -> Result<EncodeStatus, PipelineError> {
        let mut store = self.store();
        let Some(pending) = store.encodes.get_mut(&(task.encode_order, field.0)) else {
            return Err(PipelineError::DeviceFailed(format!(
                "query for frame {} field {} that was never executed",
                task.display_order, field.0
            )));
        };
        if pending.hang {
            return Ok(EncodeStatus::Busy);
        }
        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(EncodeStatus::Busy);
        }
        Ok(EncodeStatus::Done(EncodeReport {
            bytes_written: pending.bytes,
        }))
    }
}

/// NV12 frame with a diagonal luma ramp shifted by `shift` pixels and offset
/// by `brightness`; chroma is neutral.
pub fn gradient_frame(dims: Dimensions, shift: u32, brightness: u8) -> RawFrame {
    let (width, height) = (dims.width.get(), dims.height.get());
    let mut data = vec![128u8; dims.nv12_len()];
    for y in 0..height {
        for x in 0..width {
            let ramp = ((x + shift + y) % 64) as u8;
            data[(y * width + x) as usize] = brightness.saturating_add(ramp);
        }
    }
    RawFrame {
        dims,
        pts_90k: None,
        data,
    }
}
