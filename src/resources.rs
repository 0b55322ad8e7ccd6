//! Device-backed resource pools: sizing, creation and teardown.
//!
//! Every allocator surface and GPU object created for a pipeline instance is
//! recorded in one ledger, so teardown frees exactly what was created even when
//! construction fails halfway.

use tracing::{debug, info};

use crate::device::{
    AllocRequest, BufferSpec, Devices, GpuHandle, SurfaceFormat, SurfaceHandle, SurfaceSpec,
};
use crate::pool::{PoolStats, ResourcePool, SlotId};
use crate::task::{TaskId, TaskResources};
use crate::{PipelineConfig, PipelineError, PoolKind};

/// Bytes of one motion-estimation result per 16x16 lookahead block.
const MB_RECORD_BYTES: usize = 16;
const CURBE_BYTES: usize = 64;

/// Raw input surface plus its GPU-side wrapper used as a kernel source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSurface {
    pub surface: SurfaceHandle,
    pub gpu: GpuHandle,
}

/// Slot counts chosen for one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub raw: usize,
    pub lookahead: Option<usize>,
    pub mb_data: Option<usize>,
    pub curbe: Option<usize>,
    pub recon: usize,
    pub bitstream: usize,
    pub tasks: usize,
}

impl PoolPlan {
    /// Derives pool sizes from the config, honoring explicit overrides.
    ///
    /// Returns [`PipelineError::PoolTooSmall`] when an override cannot cover
    /// the concurrent need of the configured GOP and lookahead window.
    pub fn for_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let ref_dist = config.gop.ref_dist as usize;
        let depth = config.async_depth;
        let dpb = config.gop.dpb_capacity();
        let la_enabled = config.lookahead.enabled;
        let la_depth = if la_enabled { config.lookahead.depth } else { 0 };

        let sized = |pool: PoolKind, default: usize, minimum: usize| {
            let available = config.pools.get(pool).unwrap_or(default);
            if available < minimum {
                return Err(PipelineError::PoolTooSmall {
                    pool,
                    required: minimum,
                    available,
                });
            }
            Ok(available)
        };
        let when_lookahead = |pool: PoolKind, default: usize, minimum: usize| {
            la_enabled
                .then(|| sized(pool, default, minimum))
                .transpose()
        };

        let raw = sized(PoolKind::Raw, ref_dist + la_depth + 3 * depth + 1, ref_dist)?;
        Ok(Self {
            raw,
            lookahead: when_lookahead(PoolKind::Lookahead, dpb + la_depth + depth + 1, dpb + 1)?,
            mb_data: when_lookahead(PoolKind::MbData, depth, 1)?,
            curbe: when_lookahead(PoolKind::Curbe, depth, 1)?,
            // Every reference picture in the lookahead window keeps its recon slot.
            recon: sized(PoolKind::Recon, dpb + la_depth + depth + 1, dpb + 1)?,
            bitstream: sized(PoolKind::Bitstream, depth, 1)?,
            tasks: raw + ref_dist,
        })
    }
}

/// Object-safe view over pools with different handle types.
trait Slots {
    fn acquire(&mut self, owner: TaskId) -> Option<SlotId>;
    fn add_ref(&mut self, slot: SlotId);
    fn release(&mut self, slot: SlotId) -> bool;
    fn owner(&self, slot: SlotId) -> Option<TaskId>;
    fn available(&self) -> usize;
    fn stats(&self) -> PoolStats;
}

impl<H: Copy> Slots for ResourcePool<H> {
    fn acquire(&mut self, owner: TaskId) -> Option<SlotId> {
        ResourcePool::acquire(self, owner)
    }

    fn add_ref(&mut self, slot: SlotId) {
        ResourcePool::add_ref(self, slot);
    }

    fn release(&mut self, slot: SlotId) -> bool {
        ResourcePool::release(self, slot)
    }

    fn owner(&self, slot: SlotId) -> Option<TaskId> {
        ResourcePool::owner(self, slot)
    }

    fn available(&self) -> usize {
        ResourcePool::available(self)
    }

    fn stats(&self) -> PoolStats {
        ResourcePool::stats(self)
    }
}

#[derive(Debug)]
pub struct PoolSet {
    pub raw: ResourcePool<RawSurface>,
    pub lookahead: Option<ResourcePool<GpuHandle>>,
    pub mb_data: Option<ResourcePool<GpuHandle>>,
    pub curbe: Option<ResourcePool<GpuHandle>>,
    pub recon: ResourcePool<SurfaceHandle>,
    pub bitstream: ResourcePool<SurfaceHandle>,
    /// Bytes available in each bitstream surface, shared by all fields.
    pub bitstream_capacity: usize,
    surfaces: Vec<SurfaceHandle>,
    gpu_objects: Vec<GpuHandle>,
}

impl PoolSet {
    pub fn create(
        config: &PipelineConfig,
        plan: &PoolPlan,
        devices: &mut Devices,
    ) -> Result<Self, PipelineError> {
        let mut set = Self {
            raw: ResourcePool::new(PoolKind::Raw, Vec::new()),
            lookahead: None,
            mb_data: None,
            curbe: None,
            recon: ResourcePool::new(PoolKind::Recon, Vec::new()),
            bitstream: ResourcePool::new(PoolKind::Bitstream, Vec::new()),
            bitstream_capacity: config.dims.nv12_len().max(4096),
            surfaces: Vec::new(),
            gpu_objects: Vec::new(),
        };
        if let Err(err) = set.populate(config, plan, devices) {
            set.teardown(devices);
            return Err(err);
        }
        info!(
            raw = plan.raw,
            recon = plan.recon,
            lookahead = plan.lookahead.unwrap_or(0),
            bitstream = plan.bitstream,
            tasks = plan.tasks,
            "resource pools created"
        );
        Ok(set)
    }

    fn populate(
        &mut self,
        config: &PipelineConfig,
        plan: &PoolPlan,
        devices: &mut Devices,
    ) -> Result<(), PipelineError> {
        let (width, height) = (config.dims.width.get(), config.dims.height.get());

        let raw = self.alloc_surfaces(devices, PoolKind::Raw, SurfaceFormat::Nv12, width, height, plan.raw)?;
        let mut raws = Vec::with_capacity(raw.len());
        for &surface in &raw {
            let gpu = devices.gpu.create_surface(&SurfaceSpec {
                format: SurfaceFormat::Nv12,
                width,
                height,
                shared: Some(surface),
            })?;
            self.gpu_objects.push(gpu);
            raws.push(RawSurface { surface, gpu });
        }
        devices.hardware.register_surface_pool(PoolKind::Raw, &raw)?;
        self.raw = ResourcePool::new(PoolKind::Raw, raws);

        let recon = self.alloc_surfaces(devices, PoolKind::Recon, SurfaceFormat::Nv12, width, height, plan.recon)?;
        devices.hardware.register_surface_pool(PoolKind::Recon, &recon)?;
        self.recon = ResourcePool::new(PoolKind::Recon, recon);

        let capacity = self.bitstream_capacity as u32;
        let bitstream = self.alloc_surfaces(devices, PoolKind::Bitstream, SurfaceFormat::Linear, capacity, 1, plan.bitstream)?;
        devices.hardware.register_surface_pool(PoolKind::Bitstream, &bitstream)?;
        self.bitstream = ResourcePool::new(PoolKind::Bitstream, bitstream);

        if let Some(count) = plan.lookahead {
            let ds = config.lookahead.downscale.max(1);
            let spec = SurfaceSpec {
                format: SurfaceFormat::Luma8,
                width: width.div_ceil(ds),
                height: height.div_ceil(ds),
                shared: None,
            };
            let handles = (0..count)
                .map(|_| self.track(devices.gpu.create_surface(&spec)))
                .collect::<Result<Vec<_>, _>>()?;
            self.lookahead = Some(ResourcePool::new(PoolKind::Lookahead, handles));
        }

        let blocks = crate::lookahead::BlockGrid::for_config(config).len();
        for (kind, count, size) in [
            (PoolKind::MbData, plan.mb_data, blocks * MB_RECORD_BYTES),
            (PoolKind::Curbe, plan.curbe, CURBE_BYTES),
        ] {
            let Some(count) = count else { continue };
            let spec = BufferSpec { purpose: kind, size };
            let handles = (0..count)
                .map(|_| self.track(devices.gpu.create_buffer(&spec)))
                .collect::<Result<Vec<_>, _>>()?;
            let pool = Some(ResourcePool::new(kind, handles));
            match kind {
                PoolKind::MbData => self.mb_data = pool,
                _ => self.curbe = pool,
            }
        }
        Ok(())
    }

    fn alloc_surfaces(
        &mut self,
        devices: &mut Devices,
        purpose: PoolKind,
        format: SurfaceFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Result<Vec<SurfaceHandle>, PipelineError> {
        let handles = devices.allocator.alloc(&AllocRequest {
            purpose,
            format,
            width,
            height,
            count,
        })?;
        self.surfaces.extend_from_slice(&handles);
        if handles.len() != count {
            return Err(PipelineError::Allocator(format!(
                "{purpose} allocation returned {} of {count} surfaces",
                handles.len()
            )));
        }
        Ok(handles)
    }

    fn track(&mut self, handle: Result<GpuHandle, PipelineError>) -> Result<GpuHandle, PipelineError> {
        let handle = handle?;
        self.gpu_objects.push(handle);
        Ok(handle)
    }

    fn slots(&self, kind: PoolKind) -> Option<&dyn Slots> {
        match kind {
            PoolKind::Raw => Some(&self.raw),
            PoolKind::Lookahead => self.lookahead.as_ref().map(|p| p as &dyn Slots),
            PoolKind::MbData => self.mb_data.as_ref().map(|p| p as &dyn Slots),
            PoolKind::Curbe => self.curbe.as_ref().map(|p| p as &dyn Slots),
            PoolKind::Recon => Some(&self.recon),
            PoolKind::Bitstream => Some(&self.bitstream),
        }
    }

    fn slots_mut(&mut self, kind: PoolKind) -> Option<&mut dyn Slots> {
        match kind {
            PoolKind::Raw => Some(&mut self.raw),
            PoolKind::Lookahead => self.lookahead.as_mut().map(|p| p as &mut dyn Slots),
            PoolKind::MbData => self.mb_data.as_mut().map(|p| p as &mut dyn Slots),
            PoolKind::Curbe => self.curbe.as_mut().map(|p| p as &mut dyn Slots),
            PoolKind::Recon => Some(&mut self.recon),
            PoolKind::Bitstream => Some(&mut self.bitstream),
        }
    }

    fn enabled(&mut self, kind: PoolKind) -> &mut dyn Slots {
        match self.slots_mut(kind) {
            Some(pool) => pool,
            None => panic!("{kind} pool is disabled"),
        }
    }

    /// Acquires one slot from each of `kinds` for `owner`, or none at all.
    ///
    /// On success the slots are recorded in `resources`; on BUSY everything
    /// taken so far is returned and `resources` is left untouched.
    pub fn acquire_all(
        &mut self,
        owner: TaskId,
        kinds: &[PoolKind],
        resources: &mut TaskResources,
    ) -> bool {
        let mut taken: Vec<(PoolKind, SlotId)> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            match self.enabled(kind).acquire(owner) {
                Some(slot) => taken.push((kind, slot)),
                None => {
                    for (kind, slot) in taken {
                        self.enabled(kind).release(slot);
                    }
                    debug!(task = owner.0, pool = %kind, "pool busy");
                    return false;
                }
            }
        }
        for (kind, slot) in taken {
            resources.set(kind, Some(slot));
        }
        true
    }

    pub fn add_ref(&mut self, kind: PoolKind, slot: SlotId) {
        self.enabled(kind).add_ref(slot);
    }

    pub fn release(&mut self, kind: PoolKind, slot: SlotId) -> bool {
        self.enabled(kind).release(slot)
    }

    /// Drops the owner reference on every slot recorded in `resources`.
    pub fn release_all(&mut self, resources: &mut TaskResources) {
        for kind in PoolKind::ALL {
            if let Some(slot) = resources.take(kind) {
                self.release(kind, slot);
            }
        }
    }

    pub fn owner(&self, kind: PoolKind, slot: SlotId) -> Option<TaskId> {
        self.slots(kind).and_then(|pool| pool.owner(slot))
    }

    /// GPU object behind a lookahead, mb-data or curbe slot.
    pub fn gpu_handle(&self, kind: PoolKind, slot: SlotId) -> GpuHandle {
        let pool = match kind {
            PoolKind::Lookahead => self.lookahead.as_ref(),
            PoolKind::MbData => self.mb_data.as_ref(),
            PoolKind::Curbe => self.curbe.as_ref(),
            PoolKind::Raw => return self.raw.handle(slot).gpu,
            PoolKind::Recon | PoolKind::Bitstream => {
                panic!("{kind} slots have no gpu object")
            }
        };
        match pool {
            Some(pool) => pool.handle(slot),
            None => panic!("{kind} pool is disabled"),
        }
    }

    /// Allocator surface behind a raw, recon or bitstream slot.
    pub fn surface(&self, kind: PoolKind, slot: SlotId) -> SurfaceHandle {
        match kind {
            PoolKind::Raw => self.raw.handle(slot).surface,
            PoolKind::Recon => self.recon.handle(slot),
            PoolKind::Bitstream => self.bitstream.handle(slot),
            PoolKind::Lookahead | PoolKind::MbData | PoolKind::Curbe => {
                panic!("{kind} slots have no allocator surface")
            }
        }
    }

    /// Free slots in `kind`; zero for a disabled pool.
    pub fn available(&self, kind: PoolKind) -> usize {
        self.slots(kind).map_or(0, |pool| pool.available())
    }

    pub fn stats(&self) -> Vec<(PoolKind, PoolStats)> {
        PoolKind::ALL
            .into_iter()
            .filter_map(|kind| self.slots(kind).map(|pool| (kind, pool.stats())))
            .collect()
    }

    /// Destroys every GPU object and frees every allocator surface this set
    /// created. Safe to call more than once.
    pub fn teardown(&mut self, devices: &mut Devices) {
        if self.surfaces.is_empty() && self.gpu_objects.is_empty() {
            return;
        }
        for handle in self.gpu_objects.drain(..) {
            devices.gpu.destroy(handle);
        }
        let surfaces = std::mem::take(&mut self.surfaces);
        devices.allocator.free(&surfaces);
        info!(surfaces = surfaces.len(), "resource pools released");
    }
}
