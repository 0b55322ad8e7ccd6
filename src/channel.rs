//! The link between an [`EncodeWorker`](crate::EncodeWorker) handle and its
//! thread: a bounded command queue one way, a bounded event queue the other,
//! and one credit per frame between submission and delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkError {
    Full,
    Closed,
}

/// Caps the number of frames between `submit` and the delivery of their
/// unit.
#[derive(Debug, Clone)]
pub(crate) struct CreditPool {
    capacity: usize,
    used: Arc<AtomicUsize>,
}

/// One frame's share of a [`CreditPool`]; returned when dropped.
#[derive(Debug)]
pub(crate) struct Credit {
    used: Arc<AtomicUsize>,
}

impl Drop for Credit {
    fn drop(&mut self) {
        self.used.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CreditPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn try_take(&self) -> Option<Credit> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .ok()
            .map(|_| Credit {
                used: Arc::clone(&self.used),
            })
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// Handle side: posts commands, receives events.
#[derive(Debug)]
pub(crate) struct Controller<C, E> {
    commands: Option<SyncSender<C>>,
    events: Receiver<E>,
}

/// Thread side: takes commands, emits events.
#[derive(Debug)]
pub(crate) struct Endpoint<C, E> {
    commands: Receiver<C>,
    events: SyncSender<E>,
}

pub(crate) fn link<C, E>(capacity: usize) -> (Controller<C, E>, Endpoint<C, E>) {
    let (command_tx, command_rx) = mpsc::sync_channel(capacity.max(1));
    let (event_tx, event_rx) = mpsc::sync_channel(capacity.max(1));
    (
        Controller {
            commands: Some(command_tx),
            events: event_rx,
        },
        Endpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}

impl<C, E> Controller<C, E> {
    /// Queues `command` without blocking. A rejected command is dropped.
    pub(crate) fn post(&self, command: C) -> Result<(), LinkError> {
        let commands = self.commands.as_ref().ok_or(LinkError::Closed)?;
        commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => LinkError::Full,
            TrySendError::Disconnected(_) => LinkError::Closed,
        })
    }

    /// Queues `command`, waiting for room.
    pub(crate) fn post_blocking(&self, command: C) -> Result<(), LinkError> {
        let commands = self.commands.as_ref().ok_or(LinkError::Closed)?;
        commands.send(command).map_err(|_| LinkError::Closed)
    }

    /// `Ok(None)` when nothing arrived within `timeout`.
    pub(crate) fn next_event(&self, timeout: Duration) -> Result<Option<E>, LinkError> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
        }
    }

    /// The endpoint sees `Closed` once it has taken every queued command.
    pub(crate) fn close(&mut self) {
        self.commands = None;
    }

    pub(crate) fn discard_events(&self) {
        while self.events.try_recv().is_ok() {}
    }
}

impl<C, E> Endpoint<C, E> {
    /// Takes the next command, waiting up to `wait` when given.
    pub(crate) fn next_command(&self, wait: Option<Duration>) -> Result<Option<C>, LinkError> {
        match wait {
            Some(timeout) => match self.commands.recv_timeout(timeout) {
                Ok(command) => Ok(Some(command)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(LinkError::Closed),
            },
            None => match self.commands.try_recv() {
                Ok(command) => Ok(Some(command)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(LinkError::Closed),
            },
        }
    }

    /// Blocks while the event queue is full.
    pub(crate) fn emit(&self, event: E) -> Result<(), LinkError> {
        self.events.send(event).map_err(|_| LinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_return_when_dropped() {
        let pool = CreditPool::new(2);
        let first = pool.try_take().unwrap();
        let second = pool.try_take().unwrap();
        assert!(pool.try_take().is_none());
        assert_eq!(pool.in_flight(), 2);

        drop(first);
        assert_eq!(pool.in_flight(), 1);
        let third = pool.try_take().unwrap();
        drop((second, third));
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn rejected_command_gives_its_credit_back() {
        let pool = CreditPool::new(4);
        let (controller, _endpoint) = link::<Credit, ()>(1);
        controller.post(pool.try_take().unwrap()).unwrap();
        assert_eq!(controller.post(pool.try_take().unwrap()), Err(LinkError::Full));
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn closing_ends_the_endpoint_after_queued_commands() {
        let (mut controller, endpoint) = link::<u8, ()>(2);
        controller.post(7).unwrap();
        controller.close();
        assert_eq!(controller.post(8), Err(LinkError::Closed));
        assert_eq!(endpoint.next_command(None), Ok(Some(7)));
        assert_eq!(
            endpoint.next_command(Some(Duration::from_millis(1))),
            Err(LinkError::Closed)
        );
    }

    #[test]
    fn events_time_out_and_disconnect() {
        let (controller, endpoint) = link::<(), u32>(1);
        assert_eq!(controller.next_event(Duration::from_millis(1)), Ok(None));
        endpoint.emit(3).unwrap();
        assert_eq!(controller.next_event(Duration::from_millis(1)), Ok(Some(3)));
        drop(endpoint);
        assert_eq!(
            controller.next_event(Duration::from_millis(1)),
            Err(LinkError::Closed)
        );
    }
}
