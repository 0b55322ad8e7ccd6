use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use video_hw_enc::sim::{SimConfig, SimDevices, gradient_frame};
use video_hw_enc::{
    Codec, ControlHints, Dimensions, DriveStatus, EncodeSession, PipelineConfig, PipelineError,
    RawFrame, SubmitStatus,
};

fn run_encode(config: &PipelineConfig, frames: &[RawFrame]) -> Result<usize, PipelineError> {
    let sim = SimDevices::new(SimConfig::default());
    let mut session = EncodeSession::new(config.clone(), sim.devices())?;
    let mut bytes = 0usize;
    for frame in frames {
        while session.submit_frame(frame, ControlHints::default())? == SubmitStatus::Busy {
            if session.drive()? == DriveStatus::OutputReady {
                bytes += session.retrieve_output().map_or(0, |unit| unit.data.len());
            }
        }
        while let DriveStatus::OutputReady | DriveStatus::Progress = session.drive()? {
            while let Some(unit) = session.retrieve_output() {
                bytes += unit.data.len();
            }
        }
    }
    bytes += session.drain()?.iter().map(|unit| unit.data.len()).sum::<usize>();
    Ok(bytes)
}

fn pipeline_benchmark(c: &mut Criterion) {
    let dims = Dimensions::new(128, 128).expect("non-zero dimensions");
    let frames: Vec<RawFrame> = (0..60).map(|i| gradient_frame(dims, i, 40)).collect();

    let mut group = c.benchmark_group("simulated_encode");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));
    group.throughput(Throughput::Elements(frames.len() as u64));

    for (label, lookahead, ref_dist, pyramid) in [
        ("la_off/p_only", false, 1, false),
        ("la_on/p_only", true, 1, false),
        ("la_on/b3", true, 3, false),
        ("la_on/pyramid4", true, 4, true),
    ] {
        let mut config = PipelineConfig::new(Codec::H264, dims, 30);
        config.lookahead.enabled = lookahead;
        config.gop.ref_dist = ref_dist;
        config.gop.b_pyramid = pyramid;
        group.bench_with_input(BenchmarkId::new("h264", label), &config, |b, config| {
            b.iter(|| run_encode(config, &frames).expect("encode should succeed in benchmark"));
        });
    }

    group.finish();
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
