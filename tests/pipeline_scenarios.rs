use std::collections::HashMap;

use rstest::rstest;
use video_hw_enc::bitstream;
use video_hw_enc::device::Kernel;
use video_hw_enc::sim::{SimConfig, SimDevices, SizeModel, gradient_frame};
use video_hw_enc::{
    Codec, ControlHints, Dimensions, DriveStatus, EncodeSession, EncodedUnit, ErrorKind,
    PictureKind, PictureStructure, PipelineConfig, PipelineError, RateControlMethod, RawFrame,
    SubmitStatus,
};

const MAX_DRIVES: usize = 10_000;

fn dims() -> Dimensions {
    Dimensions::new(64, 64).expect("non-zero dimensions")
}

fn base_config() -> PipelineConfig {
    PipelineConfig::new(Codec::H264, dims(), 30)
}

fn frames(count: u32) -> Vec<RawFrame> {
    (0..count).map(|i| gradient_frame(dims(), i, 40)).collect()
}

/// Drives until the session waits for input, checking the queue and
/// ownership bookkeeping after every tick.
fn settle(session: &mut EncodeSession, out: &mut Vec<EncodedUnit>) -> Result<(), PipelineError> {
    for _ in 0..MAX_DRIVES {
        let status = session.drive()?;
        assert!(session.is_consistent(), "inconsistent after {status:?}");
        match status {
            DriveStatus::OutputReady => out.extend(session.retrieve_output()),
            DriveStatus::Progress => {}
            DriveStatus::NeedMoreInput | DriveStatus::Drained => return Ok(()),
        }
    }
    panic!("session did not settle within {MAX_DRIVES} drives");
}

/// Submits every frame, retrying on `Busy`, collecting output as it appears.
fn feed(
    session: &mut EncodeSession,
    input: &[RawFrame],
    out: &mut Vec<EncodedUnit>,
) -> Result<(), PipelineError> {
    for frame in input {
        let mut attempts = 0;
        while session.submit_frame(frame, ControlHints::default())? == SubmitStatus::Busy {
            attempts += 1;
            assert!(attempts < MAX_DRIVES, "submission never accepted");
            settle(session, out)?;
        }
        settle(session, out)?;
    }
    Ok(())
}

fn encode(config: PipelineConfig, sim: &SimDevices, input: &[RawFrame]) -> (Vec<EncodedUnit>, EncodeSession) {
    let mut session = EncodeSession::new(config, sim.devices()).expect("session should build");
    let mut out = Vec::new();
    feed(&mut session, input, &mut out).expect("frames should encode");
    out.extend(session.drain().expect("drain should succeed"));
    assert!(session.is_consistent());
    (out, session)
}

fn display_orders(units: &[EncodedUnit]) -> Vec<u64> {
    units.iter().map(|unit| unit.display_order).collect()
}

#[test]
fn single_intra_frame_round_trips() {
    let sim = SimDevices::new(SimConfig::default());
    let (units, session) = encode(base_config(), &sim, &frames(1));

    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert!(unit.is_keyframe());
    assert_eq!(unit.recode_count, 0);
    let counters = session.stats().counters;
    assert_eq!(counters.lookahead_submissions, 1);
    assert_eq!(counters.encode_executions, 1);
    assert_eq!(counters.recodes, 0);
    assert_eq!(sim.log().executions.len(), 1);

    let nals = bitstream::nal_units(&unit.data);
    assert!(bitstream::is_key_vcl(Codec::H264, nals[0]));
}

#[test]
fn b_frames_are_encoded_after_their_anchors() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.gop.ref_dist = 3;
    config.gop.b_pyramid = false;
    let (units, _) = encode(config, &sim, &frames(8));

    assert_eq!(display_orders(&units), (0..8).collect::<Vec<_>>());
    let mut by_encode: Vec<&EncodedUnit> = units.iter().collect();
    by_encode.sort_by_key(|unit| unit.encode_order);
    let encode_sequence: Vec<u64> = by_encode.iter().map(|unit| unit.display_order).collect();
    assert_eq!(encode_sequence, vec![0, 3, 1, 2, 6, 4, 5, 7]);

    let kinds: Vec<PictureKind> = units.iter().map(|unit| unit.frame_type.kind).collect();
    use PictureKind::{B, I, P};
    // The trailing B run is closed into a P at end of stream.
    assert_eq!(kinds, vec![I, B, B, P, B, B, P, P]);
}

#[test]
fn oversized_frame_at_max_qp_is_skip_coded() {
    let mut scripted = std::collections::BTreeMap::new();
    scripted.insert(1, 6_000);
    let sim = SimDevices::new(SimConfig {
        scripted,
        ..SimConfig::default()
    });
    let mut config = base_config();
    config.gop.ref_dist = 1;
    config.rate_control.method = RateControlMethod::Vbr;
    config.rate_control.target_kbps = 300;
    config.rate_control.max_kbps = 600;
    config.rate_control.buffer_size_kbits = 40;
    config.rate_control.qp_min = 51;
    config.rate_control.qp_max = 51;
    let (units, session) = encode(config, &sim, &frames(4));

    assert_eq!(units.len(), 4);
    let skipped = &units[1];
    assert!(skipped.skipped);
    assert_eq!(skipped.recode_count, 0);
    assert!(units.iter().filter(|unit| unit.display_order != 1).all(|unit| !unit.skipped));
    let counters = session.stats().counters;
    assert_eq!(counters.panic_skips, 1);
    assert_eq!(counters.recodes, 0);
    assert!(sim.log().executions.iter().any(|e| e.display_order == 1 && e.skip));
}

#[test]
fn exhausted_raw_pool_reports_busy() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.pools.raw = Some(3);
    let mut session = EncodeSession::new(config, sim.devices()).expect("session should build");
    let input = frames(4);

    for frame in &input[..3] {
        let status = session
            .submit_frame(frame, ControlHints::default())
            .expect("submit should succeed");
        assert_ne!(status, SubmitStatus::Busy);
    }
    let status = session
        .submit_frame(&input[3], ControlHints::default())
        .expect("busy is not an error");
    assert_eq!(status, SubmitStatus::Busy);
    assert!(session.is_consistent());
    assert_eq!(session.stats().counters.busy_rejections, 1);

    let mut out = Vec::new();
    feed(&mut session, &input[3..], &mut out).expect("frame should go through once drained");
    out.extend(session.drain().expect("drain should succeed"));
    assert_eq!(display_orders(&out), vec![0, 1, 2, 3]);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(8)]
#[case(17)]
fn drain_returns_every_frame(#[case] count: u32) {
    let sim = SimDevices::new(SimConfig::default());
    let (units, session) = encode(base_config(), &sim, &frames(count));

    assert_eq!(display_orders(&units), (0..u64::from(count)).collect::<Vec<_>>());
    let stats = session.stats();
    assert_eq!(stats.counters.submitted, u64::from(count));
    assert_eq!(stats.counters.emitted, u64::from(count));
    assert_eq!(stats.dpb_len, 0);
    assert!(stats.pools.iter().all(|(_, pool)| pool.in_use == 0));
    assert_eq!(sim.live_events(), 0);
}

#[rstest]
#[case::flat(3, false)]
#[case::pyramid(4, true)]
#[case::low_delay(1, false)]
fn references_are_encoded_before_dependents(#[case] ref_dist: u32, #[case] pyramid: bool) {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.gop.ref_dist = ref_dist;
    config.gop.b_pyramid = pyramid;
    config.gop.pic_size = 12;
    let (units, _) = encode(config, &sim, &frames(17));
    assert_eq!(units.len(), 17);

    let log = sim.log();
    for (at, execution) in log.executions.iter().enumerate() {
        for &reference in &execution.refs {
            assert_ne!(reference, execution.display_order);
            assert!(
                log.executions[..at].iter().any(|e| e.display_order == reference),
                "frame {} referenced {} before it was encoded",
                execution.display_order,
                reference
            );
        }
        if execution.frame_type.is_intra() {
            assert!(execution.refs.is_empty());
        }
    }
}

#[test]
fn recode_raises_qp_until_the_frame_fits() {
    let sim = SimDevices::new(SimConfig {
        size: SizeModel::QpScaled {
            base_bytes: 5_000,
            base_qp: 30,
        },
        ..SimConfig::default()
    });
    let mut config = base_config();
    config.rate_control.target_kbps = 300;
    config.rate_control.max_kbps = 600;
    config.rate_control.buffer_size_kbits = 40;
    let (units, session) = encode(config, &sim, &frames(6));

    assert_eq!(units.len(), 6);
    assert!(session.stats().counters.recodes > 0);
    assert!(units.iter().any(|unit| unit.recode_count > 0));

    let mut qps: HashMap<u64, Vec<u8>> = HashMap::new();
    for execution in sim.log().executions {
        qps.entry(execution.display_order).or_default().push(execution.qp);
    }
    for unit in &units {
        let history = &qps[&unit.display_order];
        assert!(history.windows(2).all(|w| w[0] <= w[1]), "qp went down: {history:?}");
        assert_eq!(history.last(), Some(&unit.qp));
        assert!(unit.recode_count <= 51);
    }
}

#[test]
fn gpu_hang_halts_after_announced_output() {
    let sim = SimDevices::new(SimConfig {
        gpu_hang: Some((Kernel::Histogram, 3)),
        ..SimConfig::default()
    });
    let mut session = EncodeSession::new(base_config(), sim.devices()).expect("session should build");
    let mut out = Vec::new();
    let input = frames(8);

    let err = feed(&mut session, &input, &mut out)
        .and_then(|()| session.drain().map(|units| out.extend(units)))
        .expect_err("the hang should surface");
    assert_eq!(err.kind(), ErrorKind::GpuHang);
    assert_eq!(session.halted(), Some(ErrorKind::GpuHang));

    loop {
        match session.drive() {
            Ok(DriveStatus::OutputReady) => out.extend(session.retrieve_output()),
            Ok(other) => panic!("unexpected status after halt: {other:?}"),
            Err(PipelineError::Halted(kind)) => {
                assert_eq!(kind, ErrorKind::GpuHang);
                break;
            }
            Err(other) => panic!("unexpected error after halt: {other}"),
        }
    }
    out.extend(std::iter::from_fn(|| session.retrieve_output()));
    assert!(display_orders(&out).iter().all(|&order| order < 3));
    assert!(matches!(
        session.submit_frame(&input[0], ControlHints::default()),
        Err(PipelineError::Halted(ErrorKind::GpuHang))
    ));
}

/// Submits every frame without waiting for the pipeline to settle, so
/// several frames are on the devices at once.
fn submit_back_to_back(
    session: &mut EncodeSession,
    input: &[RawFrame],
    out: &mut Vec<EncodedUnit>,
) -> Result<(), PipelineError> {
    for frame in input {
        let mut attempts = 0;
        while session.submit_frame(frame, ControlHints::default())? == SubmitStatus::Busy {
            attempts += 1;
            assert!(attempts < MAX_DRIVES, "submission never accepted");
            if session.drive()? == DriveStatus::OutputReady {
                out.extend(session.retrieve_output());
            }
        }
    }
    Ok(())
}

#[test]
fn frame_finished_in_the_failing_tick_is_still_returned() {
    // Frame 2 completes its encode on the same tick frame 4's histogram
    // event times out.
    let sim = SimDevices::new(SimConfig {
        gpu_hang: Some((Kernel::Histogram, 4)),
        ..SimConfig::default()
    });
    let mut config = base_config();
    config.gop.ref_dist = 1;
    config.lookahead.enabled = false;
    let mut session = EncodeSession::new(config, sim.devices()).expect("session should build");
    let mut out = Vec::new();
    submit_back_to_back(&mut session, &frames(8), &mut out).expect("frames fit the raw pool");

    let err = loop {
        match session.drive() {
            Ok(DriveStatus::OutputReady) => out.extend(session.retrieve_output()),
            Ok(_) => {}
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), ErrorKind::GpuHang);
    while let Ok(DriveStatus::OutputReady) = session.drive() {
        out.extend(session.retrieve_output());
    }
    out.extend(std::iter::from_fn(|| session.retrieve_output()));
    assert_eq!(display_orders(&out), vec![0, 1, 2]);
}

#[test]
fn recode_resubmits_dependents_after_their_reference() {
    let sim = SimDevices::new(SimConfig {
        encode_latency: 4,
        scripted: [(1, 6_000)].into_iter().collect(),
        ..SimConfig::default()
    });
    let mut config = base_config();
    config.gop.ref_dist = 1;
    config.async_depth = 3;
    config.rate_control.target_kbps = 300;
    config.rate_control.max_kbps = 600;
    config.rate_control.buffer_size_kbits = 40;
    let mut session = EncodeSession::new(config, sim.devices()).expect("session should build");
    let mut out = Vec::new();
    submit_back_to_back(&mut session, &frames(8), &mut out).expect("frames should submit");
    out.extend(session.drain().expect("drain should succeed"));
    assert!(session.is_consistent());

    assert_eq!(display_orders(&out), (0..8).collect::<Vec<_>>());
    let counters = session.stats().counters;
    assert!(counters.recodes > 0);
    assert!(counters.dependent_resubmits > 0);

    let executions = sim.log().executions;
    let last_of = |order: u64| {
        executions
            .iter()
            .rposition(|execution| execution.display_order == order)
            .expect("every frame was executed")
    };
    let head = last_of(1);
    assert!(executions[head].skip, "frame 1 never fits and ends skip-coded");
    for order in 2..8 {
        assert!(
            last_of(order) > head,
            "frame {order} last ran before its reference settled"
        );
    }
    let reruns = executions
        .iter()
        .filter(|execution| execution.display_order > 1)
        .count();
    assert!(reruns > 6, "no dependent was executed twice");
}

#[test]
fn brightness_jump_inserts_intra() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.gop.ref_dist = 1;
    let input: Vec<RawFrame> = (0..8)
        .map(|i| gradient_frame(dims(), 0, if i < 4 { 40 } else { 200 }))
        .collect();
    let (units, session) = encode(config, &sim, &input);

    let cut = &units[4];
    assert!(cut.scene_cut);
    assert_eq!(cut.frame_type.kind, PictureKind::I);
    assert!(!cut.is_keyframe());
    assert!(units.iter().filter(|unit| unit.display_order != 4).all(|unit| !unit.scene_cut));
    assert_eq!(session.stats().counters.scene_cuts, 1);
    let execution = sim
        .log()
        .executions
        .into_iter()
        .find(|e| e.display_order == 4)
        .expect("frame 4 was encoded");
    assert!(execution.refs.is_empty());
}

#[test]
fn full_cbr_buffer_pads_with_filler() {
    let sim = SimDevices::new(SimConfig {
        size: SizeModel::Fixed(100),
        ..SimConfig::default()
    });
    let mut config = base_config();
    config.rate_control.method = RateControlMethod::Cbr;
    config.rate_control.target_kbps = 300;
    config.rate_control.buffer_size_kbits = 40;
    config.rate_control.initial_fullness = 1.0;
    let (units, session) = encode(config, &sim, &frames(4));

    assert_eq!(units.len(), 4);
    for unit in &units {
        assert!(unit.padded_bytes > 0);
        // One frame interval of input at 300 kbps and 30 fps.
        assert!(unit.data.len() * 8 >= 10_000);
        let nals = bitstream::nal_units(&unit.data);
        let last = nals.last().expect("unit has nal units");
        assert!(bitstream::is_filler(Codec::H264, last));
        assert!(bitstream::is_vcl(Codec::H264, nals[0]));
    }
    assert_eq!(session.stats().counters.padded_frames, 4);
}

#[test]
fn interlaced_frames_execute_once_per_field() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.picture_structure = PictureStructure::TopFieldFirst;
    let (units, _) = encode(config, &sim, &frames(4));

    assert_eq!(units.len(), 4);
    let log = sim.log();
    assert_eq!(log.executions.len(), 8);
    for unit in &units {
        let fields: Vec<u8> = log
            .executions
            .iter()
            .filter(|e| e.display_order == unit.display_order)
            .map(|e| e.field)
            .collect();
        assert_eq!(fields, vec![0, 1]);
        let slices = bitstream::nal_units(&unit.data)
            .into_iter()
            .filter(|nal| bitstream::is_vcl(Codec::H264, nal))
            .count();
        assert_eq!(slices, 2);
    }
}

#[test]
fn hevc_output_marks_idr_keyframes() {
    let sim = SimDevices::new(SimConfig {
        codec: Codec::Hevc,
        ..SimConfig::default()
    });
    let mut config = PipelineConfig::new(Codec::Hevc, dims(), 30);
    config.gop.pic_size = 4;
    config.gop.ref_dist = 1;
    config.gop.idr_interval = 1;
    let (units, _) = encode(config, &sim, &frames(9));

    let keyframes: Vec<u64> = units
        .iter()
        .filter(|unit| unit.is_keyframe())
        .map(|unit| unit.display_order)
        .collect();
    assert_eq!(keyframes, vec![0, 8]);
    for unit in &units {
        assert_eq!(unit.codec, Codec::Hevc);
        let nals = bitstream::nal_units(&unit.data);
        assert_eq!(bitstream::is_key_vcl(Codec::Hevc, nals[0]), unit.is_keyframe());
    }
}

#[test]
fn forced_qp_and_idr_hints_are_honored() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.gop.ref_dist = 1;
    let mut session = EncodeSession::new(config, sim.devices()).expect("session should build");
    let mut out = Vec::new();
    for (i, frame) in frames(5).iter().enumerate() {
        let hints = ControlHints {
            force_idr: i == 3,
            qp: (i == 2).then_some(20),
        };
        assert_ne!(
            session.submit_frame(frame, hints).expect("submit"),
            SubmitStatus::Busy
        );
        settle(&mut session, &mut out).expect("settle");
    }
    out.extend(session.drain().expect("drain"));

    assert_eq!(out[2].qp, 20);
    assert!(out[3].is_keyframe());
    assert!(!out[4].is_keyframe());
}

#[test]
fn invalid_input_is_rejected_without_halting() {
    let sim = SimDevices::new(SimConfig::default());
    let mut session = EncodeSession::new(base_config(), sim.devices()).expect("session should build");
    let mut frame = gradient_frame(dims(), 0, 40);
    frame.data.truncate(10);
    let err = session
        .submit_frame(&frame, ControlHints::default())
        .expect_err("short frame must be rejected");
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(!err.is_fatal());
    assert_eq!(session.halted(), None);

    session.flush();
    let err = session
        .submit_frame(&gradient_frame(dims(), 0, 40), ControlHints::default())
        .expect_err("no input after flush");
    assert!(matches!(err, PipelineError::EndOfStream));
}

#[test]
fn dropping_the_session_frees_every_device_object() {
    let sim = SimDevices::new(SimConfig::default());
    {
        let mut session =
            EncodeSession::new(base_config(), sim.devices()).expect("session should build");
        let mut out = Vec::new();
        feed(&mut session, &frames(5), &mut out).expect("frames should encode");
        assert!(sim.live_surfaces() > 0);
    }
    assert_eq!(sim.live_surfaces(), 0);
    assert_eq!(sim.live_gpu_objects(), 0);
    assert_eq!(sim.live_events(), 0);
}

#[test]
fn undersized_pool_override_is_a_config_error() {
    let sim = SimDevices::new(SimConfig::default());
    let mut config = base_config();
    config.pools.recon = Some(1);
    let err = EncodeSession::new(config, sim.devices()).expect_err("recon pool too small");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(sim.live_surfaces(), 0);
}
