use std::num::NonZeroU32;
use std::time::Duration;
use std::{fmt, fmt::Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

impl std::str::FromStr for Codec {
    type Err = PipelineError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        match v.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "hevc" | "h265" => Ok(Self::Hevc),
            _ => Err(PipelineError::InvalidConfig(format!("unsupported codec {v}"))),
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    /// Returns `None` when either side is zero.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Byte size of one NV12 picture of these dimensions.
    pub fn nv12_len(&self) -> usize {
        let luma = self.width.get() as usize * self.height.get() as usize;
        luma + luma / 2
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp90k(pub i64);

impl Display for Timestamp90k {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@90k", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureStructure {
    #[default]
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
}

impl PictureStructure {
    pub fn field_count(self) -> u8 {
        match self {
            Self::Progressive => 1,
            Self::TopFieldFirst | Self::BottomFieldFirst => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureKind {
    I,
    P,
    B,
}

impl Display for PictureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I => f.write_str("I"),
            Self::P => f.write_str("P"),
            Self::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType {
    pub kind: PictureKind,
    pub idr: bool,
    pub reference: bool,
}

impl FrameType {
    pub const IDR: Self = Self {
        kind: PictureKind::I,
        idr: true,
        reference: true,
    };
    pub const I: Self = Self {
        kind: PictureKind::I,
        idr: false,
        reference: true,
    };
    pub const P: Self = Self {
        kind: PictureKind::P,
        idr: false,
        reference: true,
    };
    pub const B: Self = Self {
        kind: PictureKind::B,
        idr: false,
        reference: false,
    };

    /// I or P: closes a mini-GOP.
    pub fn is_anchor(&self) -> bool {
        !matches!(self.kind, PictureKind::B)
    }

    pub fn is_intra(&self) -> bool {
        matches!(self.kind, PictureKind::I)
    }
}

impl Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.idr {
            return f.write_str("IDR");
        }
        write!(f, "{}", self.kind)?;
        if self.kind == PictureKind::B && self.reference {
            f.write_str("ref")?;
        }
        Ok(())
    }
}

/// Uncompressed NV12 picture handed to [`crate::EncodeSession::submit_frame`].
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub dims: Dimensions,
    pub pts_90k: Option<Timestamp90k>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlHints {
    pub force_idr: bool,
    /// Fixed QP for this frame; bypasses the rate-control model.
    pub qp: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub codec: Codec,
    pub data: Vec<u8>,
    pub pts_90k: Option<Timestamp90k>,
    pub display_order: u64,
    pub encode_order: u64,
    pub frame_type: FrameType,
    pub qp: u8,
    pub recode_count: u32,
    pub skipped: bool,
    pub padded_bytes: usize,
    pub scene_cut: bool,
}

impl EncodedUnit {
    pub fn is_keyframe(&self) -> bool {
        self.frame_type.idr
    }
}

impl Display for EncodedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodedUnit(display={}, encode={}, type={}, qp={}, bytes={}, recodes={}, skipped={})",
            self.display_order,
            self.encode_order,
            self.frame_type,
            self.qp,
            self.data.len(),
            self.recode_count,
            self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted,
    /// No free task or raw surface; retry after driving the pipeline.
    Busy,
    /// Accepted, but the reorder/lookahead window is still filling.
    MoreDataNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Progress,
    NeedMoreInput,
    OutputReady,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Raw,
    Lookahead,
    MbData,
    Curbe,
    Recon,
    Bitstream,
}

impl PoolKind {
    pub const ALL: [PoolKind; 6] = [
        PoolKind::Raw,
        PoolKind::Lookahead,
        PoolKind::MbData,
        PoolKind::Curbe,
        PoolKind::Recon,
        PoolKind::Bitstream,
    ];
}

impl Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Lookahead => f.write_str("lookahead"),
            Self::MbData => f.write_str("mb_data"),
            Self::Curbe => f.write_str("curbe"),
            Self::Recon => f.write_str("recon"),
            Self::Bitstream => f.write_str("bitstream"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GopConfig {
    pub pic_size: u32,
    /// Distance between anchors; 1 disables B-frames.
    pub ref_dist: u32,
    /// Number of non-IDR I pictures between IDRs; 0 makes every GOP start an IDR.
    pub idr_interval: u32,
    pub b_pyramid: bool,
    pub num_ref_l0: u8,
}

impl Default for GopConfig {
    fn default() -> Self {
        Self {
            pic_size: 30,
            ref_dist: 3,
            idr_interval: 0,
            b_pyramid: false,
            num_ref_l0: 1,
        }
    }
}

impl GopConfig {
    /// Reference pictures the DPB keeps alive at once.
    pub fn dpb_capacity(&self) -> usize {
        let anchors = usize::from(self.num_ref_l0.max(1)) + 1;
        anchors + crate::gop::max_reference_b(self)
    }
}

#[derive(Debug, Clone)]
pub struct LookaheadOptions {
    pub enabled: bool,
    /// Later results required before a frame leaves the propagation window.
    pub depth: usize,
    pub downscale: u32,
    /// QP delta per doubling of propagated cost.
    pub propagation_strength: f32,
    pub max_qp_offset: u8,
}

impl Default for LookaheadOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            depth: 4,
            downscale: 4,
            propagation_strength: 2.0,
            max_qp_offset: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SceneChangeOptions {
    pub enabled: bool,
    pub threshold: f32,
    /// Re-type a P picture at a cut as a non-IDR I picture.
    pub insert_intra: bool,
}

impl Default for SceneChangeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.5,
            insert_intra: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistogramOptions {
    pub enabled: bool,
    /// Mean luma delta against the forward reference that turns on weighted prediction.
    pub fade_threshold: f32,
}

impl Default for HistogramOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            fade_threshold: 12.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlMethod {
    Cqp { qp_i: u8, qp_p: u8, qp_b: u8 },
    Cbr,
    Vbr,
}

impl Display for RateControlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cqp { qp_i, qp_p, qp_b } => write!(f, "cqp({qp_i}/{qp_p}/{qp_b})"),
            Self::Cbr => f.write_str("cbr"),
            Self::Vbr => f.write_str("vbr"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateControl {
    pub method: RateControlMethod,
    pub target_kbps: u32,
    pub max_kbps: u32,
    pub buffer_size_kbits: u32,
    /// Initial decoder buffer fullness as a fraction of its size.
    pub initial_fullness: f64,
    pub initial_qp: u8,
    pub qp_min: u8,
    pub qp_max: u8,
    pub max_frame_size_bits: Option<u64>,
}

impl Default for RateControl {
    fn default() -> Self {
        Self {
            method: RateControlMethod::Vbr,
            target_kbps: 4_000,
            max_kbps: 6_000,
            buffer_size_kbits: 8_000,
            initial_fullness: 0.5,
            initial_qp: 30,
            qp_min: 10,
            qp_max: 51,
            max_frame_size_bits: None,
        }
    }
}

/// Slot counts per pool; `None` picks a size derived from the rest of the config.
#[derive(Debug, Clone, Default)]
pub struct PoolSizes {
    pub raw: Option<usize>,
    pub lookahead: Option<usize>,
    pub mb_data: Option<usize>,
    pub curbe: Option<usize>,
    pub recon: Option<usize>,
    pub bitstream: Option<usize>,
}

impl PoolSizes {
    pub fn get(&self, pool: PoolKind) -> Option<usize> {
        match pool {
            PoolKind::Raw => self.raw,
            PoolKind::Lookahead => self.lookahead,
            PoolKind::MbData => self.mb_data,
            PoolKind::Curbe => self.curbe,
            PoolKind::Recon => self.recon,
            PoolKind::Bitstream => self.bitstream,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub codec: Codec,
    pub dims: Dimensions,
    pub fps: i32,
    pub picture_structure: PictureStructure,
    pub gop: GopConfig,
    /// Frames allowed in each device-side stage at once.
    pub async_depth: usize,
    pub lookahead: LookaheadOptions,
    pub scene_change: SceneChangeOptions,
    pub histogram: HistogramOptions,
    pub rate_control: RateControl,
    pub pools: PoolSizes,
    pub gpu_timeout: Duration,
    pub hw_timeout: Duration,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(codec: Codec, dims: Dimensions, fps: i32) -> Self {
        Self {
            codec,
            dims,
            fps,
            picture_structure: PictureStructure::default(),
            gop: GopConfig::default(),
            async_depth: 2,
            lookahead: LookaheadOptions::default(),
            scene_change: SceneChangeOptions::default(),
            histogram: HistogramOptions::default(),
            rate_control: RateControl::default(),
            pools: PoolSizes::default(),
            gpu_timeout: Duration::from_secs(2),
            hw_timeout: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.fps <= 0 {
            return invalid("fps must be positive");
        }
        if self.gop.pic_size == 0 {
            return invalid("gop.pic_size must be at least 1");
        }
        if self.gop.ref_dist == 0 {
            return invalid("gop.ref_dist must be at least 1");
        }
        if self.gop.ref_dist > self.gop.pic_size {
            return invalid("gop.ref_dist must not exceed gop.pic_size");
        }
        if self.async_depth == 0 {
            return invalid("async_depth must be at least 1");
        }
        if self.lookahead.enabled && !(1..=8).contains(&self.lookahead.downscale) {
            return invalid("lookahead.downscale must be within 1..=8");
        }
        let rc = &self.rate_control;
        if rc.qp_min > rc.qp_max || rc.qp_max > 51 {
            return invalid("rate_control qp range must satisfy qp_min <= qp_max <= 51");
        }
        match rc.method {
            RateControlMethod::Cqp { qp_i, qp_p, qp_b } => {
                if qp_i.max(qp_p).max(qp_b) > 51 {
                    return invalid("cqp values must not exceed 51");
                }
            }
            RateControlMethod::Cbr | RateControlMethod::Vbr => {
                if rc.target_kbps == 0 || rc.buffer_size_kbits == 0 {
                    return invalid("rate_control target_kbps and buffer_size_kbits must be positive");
                }
                if rc.method == RateControlMethod::Vbr && rc.max_kbps < rc.target_kbps {
                    return invalid("rate_control max_kbps must be >= target_kbps for vbr");
                }
                if !(0.0..=1.0).contains(&rc.initial_fullness) {
                    return invalid("rate_control initial_fullness must be within 0..=1");
                }
            }
        }
        Ok(())
    }
}

impl Display for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipelineConfig(codec={}, dims={}, fps={}, gop={}/{}, pyramid={}, async_depth={}, lookahead={}, rc={})",
            self.codec,
            self.dims,
            self.fps,
            self.gop.pic_size,
            self.gop.ref_dist,
            self.gop.b_pyramid,
            self.async_depth,
            self.lookahead.enabled,
            self.rate_control.method
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Input,
    GpuHang,
    DeviceFailed,
    Allocator,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => f.write_str("config"),
            Self::Input => f.write_str("input"),
            Self::GpuHang => f.write_str("gpu_hang"),
            Self::DeviceFailed => f.write_str("device_failed"),
            Self::Allocator => f.write_str("allocator"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("{pool} pool too small: {available} slots, {required} required")]
    PoolTooSmall {
        pool: PoolKind,
        required: usize,
        available: usize,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("stream already flushed")]
    EndOfStream,
    #[error("gpu hang in {stage} for frame {display_order}")]
    GpuHang {
        stage: &'static str,
        display_order: u64,
    },
    #[error("device failed: {0}")]
    DeviceFailed(String),
    #[error("gpu error: {0}")]
    Gpu(String),
    #[error("allocator error: {0}")]
    Allocator(String),
    #[error("pipeline halted after {0} failure")]
    Halted(ErrorKind),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::PoolTooSmall { .. } => ErrorKind::Config,
            Self::InvalidInput(_) | Self::EndOfStream => ErrorKind::Input,
            Self::GpuHang { .. } => ErrorKind::GpuHang,
            Self::DeviceFailed(_) | Self::Gpu(_) => ErrorKind::DeviceFailed,
            Self::Allocator(_) => ErrorKind::Allocator,
            Self::Halted(kind) => *kind,
        }
    }

    /// Whether the pipeline instance must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Input | ErrorKind::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::new(Codec::H264, Dimensions::new(64, 32).unwrap(), 30)
    }

    #[test]
    fn default_config_validates() {
        config().validate().unwrap();
    }

    #[test]
    fn ref_dist_longer_than_gop_is_rejected() {
        let mut cfg = config();
        cfg.gop.pic_size = 2;
        cfg.gop.ref_dist = 3;
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn vbr_requires_max_above_target() {
        let mut cfg = config();
        cfg.rate_control.max_kbps = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn error_kinds_classify_fatality() {
        let hang = PipelineError::GpuHang {
            stage: "lookahead",
            display_order: 3,
        };
        assert_eq!(hang.kind(), ErrorKind::GpuHang);
        assert!(hang.is_fatal());
        assert!(!PipelineError::InvalidInput("x".into()).is_fatal());
        assert!(PipelineError::Halted(ErrorKind::DeviceFailed).is_fatal());
    }

    #[test]
    fn codec_names_parse() {
        assert_eq!("H265".parse::<Codec>().unwrap(), Codec::Hevc);
        assert_eq!("avc".parse::<Codec>().unwrap(), Codec::H264);
        assert!("vp9".parse::<Codec>().is_err());
    }

    #[test]
    fn frame_type_display() {
        assert_eq!(FrameType::IDR.to_string(), "IDR");
        assert_eq!(FrameType::P.to_string(), "P");
        let b_ref = FrameType {
            reference: true,
            ..FrameType::B
        };
        assert_eq!(b_ref.to_string(), "Bref");
    }
}
