use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::channel::{Controller, Credit, CreditPool, Endpoint, LinkError, link};
use crate::device::Devices;
use crate::pipeline::PipelineStats;
use crate::{
    ControlHints, DriveStatus, EncodeSession, EncodedUnit, PipelineConfig, PipelineError, RawFrame,
    SubmitStatus,
};

const IDLE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker input queue is full")]
    Backpressure,
    #[error("worker thread is gone")]
    Disconnected,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl From<LinkError> for WorkerError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Full => Self::Backpressure,
            LinkError::Closed => Self::Disconnected,
        }
    }
}

#[derive(Debug)]
enum Command {
    Frame {
        frame: RawFrame,
        hints: ControlHints,
        credit: Credit,
    },
    Flush,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Unit(EncodedUnit),
    /// Every submitted frame has been returned.
    Drained(PipelineStats),
    /// The session halted; no further units follow.
    Failed(PipelineError),
}

/// An event on its way to the handle. A unit carries the credit of one
/// submitted frame, returned when the delivery is unpacked.
#[derive(Debug)]
struct Delivery {
    event: WorkerEvent,
    credit: Option<Credit>,
}

impl Delivery {
    fn into_event(self) -> WorkerEvent {
        self.event
    }
}

/// Runs an [`EncodeSession`] on its own thread behind bounded queues.
///
/// The session is owned by the worker thread for its whole life, so the
/// single-threaded pipeline needs no locking.
#[derive(Debug)]
pub struct EncodeWorker {
    link: Controller<Command, Delivery>,
    credits: CreditPool,
    worker: Option<JoinHandle<()>>,
}

impl EncodeWorker {
    /// Builds the session on the calling thread so configuration errors are
    /// reported here, then moves it to the worker.
    pub fn spawn(
        config: PipelineConfig,
        devices: Devices,
        queue_capacity: usize,
    ) -> Result<Self, PipelineError> {
        let session = EncodeSession::new(config, devices)?;
        let (link, endpoint) = link(queue_capacity);
        let worker = thread::spawn(move || run_worker(session, endpoint));
        Ok(Self {
            link,
            credits: CreditPool::new(queue_capacity),
            worker: Some(worker),
        })
    }

    /// Queues a frame; fails with `Backpressure` while `queue_capacity`
    /// frames are still in flight.
    pub fn submit(&self, frame: RawFrame, hints: ControlHints) -> Result<(), WorkerError> {
        let Some(credit) = self.credits.try_take() else {
            return Err(WorkerError::Backpressure);
        };
        self.link.post(Command::Frame {
            frame,
            hints,
            credit,
        })?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), WorkerError> {
        self.link.post_blocking(Command::Flush)?;
        Ok(())
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerEvent>, WorkerError> {
        Ok(self.link.next_event(timeout)?.map(Delivery::into_event))
    }

    /// Frames submitted whose units have not been received yet.
    pub fn in_flight(&self) -> usize {
        self.credits.in_flight()
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        // The worker stops once it has taken every queued command.
        self.link.close();
        if let Some(worker) = self.worker.take() {
            // Unblocks a worker stuck emitting into a full event queue.
            while !worker.is_finished() {
                self.link.discard_events();
                thread::yield_now();
            }
            let _ = worker.join();
        }
    }
}

struct WorkerState {
    session: EncodeSession,
    pending: VecDeque<(RawFrame, ControlHints, Credit)>,
    /// Credits of frames the session has taken, oldest first.
    accepted: VecDeque<Credit>,
    flushing: bool,
    drained: bool,
}

impl WorkerState {
    fn deliver_unit(&mut self, unit: EncodedUnit, endpoint: &Endpoint<Command, Delivery>) -> bool {
        debug!(display_order = unit.display_order, "unit ready");
        let delivery = Delivery {
            event: WorkerEvent::Unit(unit),
            credit: self.accepted.pop_front(),
        };
        endpoint.emit(delivery).is_ok()
    }
}

fn run_worker(session: EncodeSession, endpoint: Endpoint<Command, Delivery>) {
    let mut state = WorkerState {
        session,
        pending: VecDeque::new(),
        accepted: VecDeque::new(),
        flushing: false,
        drained: false,
    };
    info!("encode worker started");
    loop {
        let idle = state.pending.is_empty() && (!state.flushing || state.drained);
        match endpoint.next_command(idle.then_some(IDLE_WAIT)) {
            Ok(Some(Command::Frame {
                frame,
                hints,
                credit,
            })) => state.pending.push_back((frame, hints, credit)),
            Ok(Some(Command::Flush)) => state.flushing = true,
            Ok(None) => {}
            Err(_) => break,
        }
        if state.drained {
            continue;
        }
        if let Err(err) = pump(&mut state, &endpoint) {
            error!(%err, "encode worker stopping");
            // Units announced before the failure stay valid.
            while let Ok(DriveStatus::OutputReady) = state.session.drive() {}
            while let Some(unit) = state.session.retrieve_output() {
                state.deliver_unit(unit, &endpoint);
            }
            let _ = endpoint.emit(Delivery {
                event: WorkerEvent::Failed(err),
                credit: None,
            });
            break;
        }
    }
    info!(
        in_flight = state.pending.len() + state.accepted.len(),
        "encode worker stopped"
    );
}

/// Feeds queued frames and drives the session until it needs more input.
fn pump(state: &mut WorkerState, endpoint: &Endpoint<Command, Delivery>) -> Result<(), PipelineError> {
    loop {
        let mut blocked = false;
        if let Some((frame, hints, _)) = state.pending.front() {
            match state.session.submit_frame(frame, *hints)? {
                SubmitStatus::Busy => blocked = true,
                SubmitStatus::Accepted | SubmitStatus::MoreDataNeeded => {
                    if let Some((_, _, credit)) = state.pending.pop_front() {
                        state.accepted.push_back(credit);
                    }
                }
            }
        } else if state.flushing {
            state.session.flush();
        }

        match state.session.drive()? {
            DriveStatus::OutputReady => {
                if let Some(unit) = state.session.retrieve_output() {
                    if !state.deliver_unit(unit, endpoint) {
                        return Ok(());
                    }
                }
            }
            DriveStatus::Progress => {}
            DriveStatus::Drained => {
                state.drained = true;
                let _ = endpoint.emit(Delivery {
                    event: WorkerEvent::Drained(state.session.stats()),
                    credit: None,
                });
                return Ok(());
            }
            DriveStatus::NeedMoreInput if state.pending.is_empty() || blocked => return Ok(()),
            DriveStatus::NeedMoreInput => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimDevices, gradient_frame};
    use crate::{Codec, Dimensions};

    fn config() -> PipelineConfig {
        PipelineConfig::new(Codec::H264, Dimensions::new(64, 64).unwrap(), 30)
    }

    fn collect(worker: &EncodeWorker) -> (Vec<EncodedUnit>, Option<WorkerEvent>) {
        let mut units = Vec::new();
        loop {
            match worker.recv_timeout(Duration::from_secs(5)).unwrap() {
                Some(WorkerEvent::Unit(unit)) => units.push(unit),
                Some(other) => return (units, Some(other)),
                None => return (units, None),
            }
        }
    }

    #[test]
    fn worker_returns_every_frame_in_display_order() {
        let sim = SimDevices::new(SimConfig::default());
        let worker = EncodeWorker::spawn(config(), sim.devices(), 16).unwrap();
        let dims = config().dims;
        for i in 0..10 {
            worker
                .submit(gradient_frame(dims, i, 40), ControlHints::default())
                .unwrap();
        }
        worker.flush().unwrap();

        let (units, last) = collect(&worker);
        let orders: Vec<u64> = units.iter().map(|u| u.display_order).collect();
        assert_eq!(orders, (0..10).collect::<Vec<_>>());
        assert!(matches!(last, Some(WorkerEvent::Drained(_))));
        assert_eq!(worker.in_flight(), 0);
    }

    #[test]
    fn credits_push_back_on_the_caller() {
        let sim = SimDevices::new(SimConfig::default());
        let worker = EncodeWorker::spawn(config(), sim.devices(), 2).unwrap();
        let dims = config().dims;
        worker
            .submit(gradient_frame(dims, 0, 40), ControlHints::default())
            .unwrap();
        worker
            .submit(gradient_frame(dims, 1, 40), ControlHints::default())
            .unwrap();
        let err = worker
            .submit(gradient_frame(dims, 2, 40), ControlHints::default())
            .unwrap_err();
        assert!(matches!(err, WorkerError::Backpressure));
    }

    #[test]
    fn drop_returns_with_a_full_command_queue() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            for _ in 0..50 {
                let sim = SimDevices::new(SimConfig::default());
                let worker = EncodeWorker::spawn(config(), sim.devices(), 1).unwrap();
                worker
                    .submit(gradient_frame(config().dims, 0, 40), ControlHints::default())
                    .unwrap();
                drop(worker);
                assert_eq!(sim.live_surfaces(), 0);
            }
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(Duration::from_secs(60))
            .expect("dropping the worker should not hang");
    }

    #[test]
    fn credits_follow_units_back_to_the_caller() {
        let sim = SimDevices::new(SimConfig::default());
        let worker = EncodeWorker::spawn(config(), sim.devices(), 4).unwrap();
        let dims = config().dims;
        for i in 0..4 {
            worker
                .submit(gradient_frame(dims, i, 40), ControlHints::default())
                .unwrap();
        }
        worker.flush().unwrap();
        let Some(WorkerEvent::Unit(first)) = worker.recv_timeout(Duration::from_secs(5)).unwrap()
        else {
            panic!("expected a unit");
        };
        assert_eq!(first.display_order, 0);
        assert_eq!(worker.in_flight(), 3);
        let (rest, last) = collect(&worker);
        assert_eq!(rest.len(), 3);
        assert!(matches!(last, Some(WorkerEvent::Drained(_))));
        assert_eq!(worker.in_flight(), 0);
    }

    #[test]
    fn gpu_hang_is_reported_as_failure() {
        let sim = SimDevices::new(SimConfig {
            gpu_hang: Some((crate::device::Kernel::SceneChange, 1)),
            ..SimConfig::default()
        });
        let worker = EncodeWorker::spawn(config(), sim.devices(), 8).unwrap();
        let dims = config().dims;
        for i in 0..3 {
            worker
                .submit(gradient_frame(dims, i, 40), ControlHints::default())
                .unwrap();
        }
        worker.flush().unwrap();
        let (_, last) = collect(&worker);
        let Some(WorkerEvent::Failed(err)) = last else {
            panic!("expected a failure event, got {last:?}");
        };
        assert_eq!(err.kind(), crate::ErrorKind::GpuHang);
    }
}
