use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use video_hw_enc::sim::{SimConfig, SimDevices, gradient_frame};
use video_hw_enc::{
    Codec, ControlHints, Dimensions, EncodeSession, EncodeWorker, PictureStructure,
    PipelineConfig, RateControlMethod, WorkerError, WorkerEvent,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RcMode {
    Cqp,
    Cbr,
    Vbr,
}

#[derive(Parser, Debug)]
#[command(about = "Run the encode pipeline against simulated devices")]
struct Args {
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
    #[arg(long, default_value_t = 60)]
    frames: u32,
    #[arg(long, default_value_t = 30)]
    fps: i32,
    #[arg(long, default_value_t = 3)]
    ref_dist: u32,
    #[arg(long, default_value_t = false)]
    pyramid: bool,
    #[arg(long, value_enum, default_value_t = RcMode::Vbr)]
    rc: RcMode,
    #[arg(long, default_value_t = 2000)]
    kbps: u32,
    #[arg(long, default_value_t = false)]
    interlaced: bool,
    #[arg(long, default_value_t = false)]
    no_lookahead: bool,
    /// Frame index where the picture brightness jumps.
    #[arg(long)]
    cut_at: Option<u32>,
    /// Run the session on a worker thread instead of the calling thread.
    #[arg(long, default_value_t = false)]
    threaded: bool,
}

fn build_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let codec: Codec = args.codec.parse()?;
    let Some(dims) = Dimensions::new(args.width, args.height) else {
        bail!("width and height must be non-zero");
    };
    let mut config = PipelineConfig::new(codec, dims, args.fps);
    config.gop.ref_dist = args.ref_dist;
    config.gop.b_pyramid = args.pyramid;
    config.lookahead.enabled = !args.no_lookahead;
    if args.interlaced {
        config.picture_structure = PictureStructure::TopFieldFirst;
    }
    config.rate_control.method = match args.rc {
        RcMode::Cqp => RateControlMethod::Cqp {
            qp_i: 24,
            qp_p: 27,
            qp_b: 29,
        },
        RcMode::Cbr => RateControlMethod::Cbr,
        RcMode::Vbr => RateControlMethod::Vbr,
    };
    config.rate_control.target_kbps = args.kbps;
    config.rate_control.max_kbps = args.kbps.saturating_mul(3) / 2;
    config.rate_control.buffer_size_kbits = args.kbps.saturating_mul(2);
    config.validate()?;
    Ok(config)
}

fn brightness(args: &Args, index: u32) -> u8 {
    match args.cut_at {
        Some(cut) if index >= cut => 180,
        _ => 40,
    }
}

fn run_inline(args: &Args, config: PipelineConfig, sim: &SimDevices) -> anyhow::Result<()> {
    let dims = config.dims;
    let mut session = EncodeSession::new(config, sim.devices())?;
    let mut units = Vec::new();
    for i in 0..args.frames {
        let frame = gradient_frame(dims, i, brightness(args, i));
        while session.submit_frame(&frame, ControlHints::default())?
            == video_hw_enc::SubmitStatus::Busy
        {
            session.drive()?;
            units.extend(std::iter::from_fn(|| session.retrieve_output()));
        }
        session.drive()?;
        units.extend(std::iter::from_fn(|| session.retrieve_output()));
    }
    units.extend(session.drain().context("drain failed")?);

    for unit in &units {
        println!("{unit}");
    }
    let stats = session.stats();
    println!(
        "units={}, bytes={}, recodes={}, panic_skips={}, padded={}, scene_cuts={}",
        units.len(),
        units.iter().map(|u| u.data.len()).sum::<usize>(),
        stats.counters.recodes,
        stats.counters.panic_skips,
        stats.counters.padded_frames,
        stats.counters.scene_cuts
    );
    for (pool, pool_stats) in &stats.pools {
        println!(
            "pool {pool}: capacity={}, peak={}, busy_misses={}",
            pool_stats.capacity, pool_stats.peak_in_use, pool_stats.busy_misses
        );
    }
    Ok(())
}

fn run_threaded(args: &Args, config: PipelineConfig, sim: &SimDevices) -> anyhow::Result<()> {
    let dims = config.dims;
    let worker = EncodeWorker::spawn(config, sim.devices(), 16)?;
    let mut units = 0usize;
    let mut next = 0u32;
    let mut flushed = false;
    loop {
        while next < args.frames {
            let frame = gradient_frame(dims, next, brightness(args, next));
            match worker.submit(frame, ControlHints::default()) {
                Ok(()) => next += 1,
                Err(WorkerError::Backpressure) => break,
                Err(err) => return Err(err.into()),
            }
        }
        if next == args.frames && !flushed {
            worker.flush()?;
            flushed = true;
        }
        match worker.recv_timeout(Duration::from_secs(5))? {
            Some(WorkerEvent::Unit(unit)) => {
                units += 1;
                println!("{unit}");
            }
            Some(WorkerEvent::Drained(stats)) => {
                println!("units={units}, recodes={}", stats.counters.recodes);
                return Ok(());
            }
            Some(WorkerEvent::Failed(err)) => return Err(err.into()),
            None => bail!("worker stopped responding"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let sim = SimDevices::new(SimConfig {
        codec: config.codec,
        ..SimConfig::default()
    });
    println!("{config}");
    if args.threaded {
        run_threaded(&args, config, &sim)
    } else {
        run_inline(&args, config, &sim)
    }
}
