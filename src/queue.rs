use std::collections::VecDeque;
use std::fmt::{self, Display};

use crate::task::TaskId;

/// Pipeline stages a task can wait in, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Free,
    Incoming,
    Reordering,
    Scd,
    ScdDone,
    LookaheadStarted,
    LookaheadFinished,
    Histogram,
    HistogramDone,
    Encoding,
    Encoded,
}

impl QueueKind {
    pub const ALL: [QueueKind; 11] = [
        QueueKind::Free,
        QueueKind::Incoming,
        QueueKind::Reordering,
        QueueKind::Scd,
        QueueKind::ScdDone,
        QueueKind::LookaheadStarted,
        QueueKind::LookaheadFinished,
        QueueKind::Histogram,
        QueueKind::HistogramDone,
        QueueKind::Encoding,
        QueueKind::Encoded,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Incoming => "incoming",
            Self::Reordering => "reordering",
            Self::Scd => "scd",
            Self::ScdDone => "scd_done",
            Self::LookaheadStarted => "lookahead_started",
            Self::LookaheadFinished => "lookahead_finished",
            Self::Histogram => "histogram",
            Self::HistogramDone => "histogram_done",
            Self::Encoding => "encoding",
            Self::Encoded => "encoded",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub queue: QueueKind,
    pub len: usize,
    pub peak: usize,
}

/// Owns queue membership for every task id. Each id sits in exactly one queue
/// and only [`QueueManager::move_task`] changes that.
#[derive(Debug)]
pub struct QueueManager {
    queues: [VecDeque<TaskId>; 11],
    peaks: [usize; 11],
    task_count: usize,
}

impl QueueManager {
    /// Every task starts out free.
    pub fn new(task_count: usize) -> Self {
        let mut queues: [VecDeque<TaskId>; 11] = Default::default();
        queues[QueueKind::Free.index()] = (0..task_count).map(TaskId).collect();
        let mut peaks = [0; 11];
        peaks[QueueKind::Free.index()] = task_count;
        Self {
            queues,
            peaks,
            task_count,
        }
    }

    pub fn len(&self, queue: QueueKind) -> usize {
        self.queues[queue.index()].len()
    }

    pub fn is_empty(&self, queue: QueueKind) -> bool {
        self.queues[queue.index()].is_empty()
    }

    pub fn front(&self, queue: QueueKind) -> Option<TaskId> {
        self.queues[queue.index()].front().copied()
    }

    pub fn iter(&self, queue: QueueKind) -> impl DoubleEndedIterator<Item = TaskId> + '_ {
        self.queues[queue.index()].iter().copied()
    }

    pub fn contains(&self, queue: QueueKind, id: TaskId) -> bool {
        self.queues[queue.index()].contains(&id)
    }

    /// # Panics
    /// If `id` is not in `from`; a task can only be moved from where it is.
    pub fn move_task(&mut self, id: TaskId, from: QueueKind, to: QueueKind) {
        let source = &mut self.queues[from.index()];
        let Some(at) = source.iter().position(|&queued| queued == id) else {
            panic!(
                "task {} is not in the {from} queue (found in {:?})",
                id.0,
                self.locate(id)
            );
        };
        source.remove(at);
        let target = &mut self.queues[to.index()];
        target.push_back(id);
        let peak = &mut self.peaks[to.index()];
        *peak = (*peak).max(target.len());
    }

    pub fn move_front(&mut self, from: QueueKind, to: QueueKind) -> Option<TaskId> {
        let id = self.front(from)?;
        self.move_task(id, from, to);
        Some(id)
    }

    /// Queue currently holding `id`.
    pub fn locate(&self, id: TaskId) -> Option<QueueKind> {
        QueueKind::ALL
            .into_iter()
            .find(|&queue| self.contains(queue, id))
    }

    /// Every task id appears in exactly one queue.
    pub fn is_partition(&self) -> bool {
        let mut seen = vec![false; self.task_count];
        for queue in &self.queues {
            for id in queue {
                match seen.get_mut(id.0) {
                    Some(slot) if !*slot => *slot = true,
                    _ => return false,
                }
            }
        }
        seen.into_iter().all(|present| present)
    }

    pub fn depths(&self) -> Vec<QueueDepth> {
        QueueKind::ALL
            .into_iter()
            .map(|queue| QueueDepth {
                queue,
                len: self.len(queue),
                peak: self.peaks[queue.index()],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_start_free_and_move_in_fifo_order() {
        let mut queues = QueueManager::new(3);
        assert_eq!(queues.len(QueueKind::Free), 3);
        assert_eq!(queues.move_front(QueueKind::Free, QueueKind::Incoming), Some(TaskId(0)));
        assert_eq!(queues.move_front(QueueKind::Free, QueueKind::Incoming), Some(TaskId(1)));
        assert_eq!(queues.front(QueueKind::Incoming), Some(TaskId(0)));
        assert!(queues.is_partition());
        assert_eq!(queues.locate(TaskId(1)), Some(QueueKind::Incoming));
    }

    #[test]
    fn move_from_middle_keeps_partition() {
        let mut queues = QueueManager::new(4);
        for _ in 0..4 {
            queues.move_front(QueueKind::Free, QueueKind::Reordering);
        }
        queues.move_task(TaskId(2), QueueKind::Reordering, QueueKind::Scd);
        let left: Vec<TaskId> = queues.iter(QueueKind::Reordering).collect();
        assert_eq!(left, vec![TaskId(0), TaskId(1), TaskId(3)]);
        assert!(queues.is_partition());
        let reordering = queues
            .depths()
            .into_iter()
            .find(|d| d.queue == QueueKind::Reordering)
            .unwrap();
        assert_eq!((reordering.len, reordering.peak), (3, 4));
    }

    #[test]
    #[should_panic(expected = "not in the scd queue")]
    fn moving_from_wrong_queue_is_fatal() {
        let mut queues = QueueManager::new(1);
        queues.move_task(TaskId(0), QueueKind::Scd, QueueKind::Encoding);
    }
}
