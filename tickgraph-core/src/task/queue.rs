//! Per-priority task queues.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::WakeEvent;
use super::node::TaskNode;
use super::thread::TaskPriority;

/// Two FIFO lanes (high first) sharing one wake event.
///
/// Pushes hold the lock only long enough to append; the wake event is
/// triggered after the lock is released.
#[derive(Default)]
pub(crate) struct TaskQueue {
    lanes: Mutex<[VecDeque<Arc<TaskNode>>; 2]>,
    event: WakeEvent,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, node: Arc<TaskNode>, priority: TaskPriority) {
        {
            let mut lanes = self.lanes.lock();
            match priority {
                TaskPriority::High => lanes[0].push_back(node),
                TaskPriority::Normal => lanes[1].push_back(node),
            }
        }
        self.event.trigger();
    }

    pub(crate) fn pop(&self) -> Option<Arc<TaskNode>> {
        let mut lanes = self.lanes.lock();
        lanes[0].pop_front().or_else(|| lanes[1].pop_front())
    }

    pub(crate) fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes[0].len() + lanes[1].len()
    }

    pub(crate) fn event(&self) -> &WakeEvent {
        &self.event
    }

    /// Remove everything still queued.
    pub(crate) fn drain(&self) -> Vec<Arc<TaskNode>> {
        let mut lanes = self.lanes.lock();
        let mut drained: Vec<_> = lanes[0].drain(..).collect();
        drained.extend(lanes[1].drain(..));
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::thread::DesiredThread;
    use std::sync::Weak;
    use std::time::Duration;

    fn held_node() -> Arc<TaskNode> {
        TaskNode::spawn(&Weak::new(), 0, Box::new(|_| {}), &[], DesiredThread::any(), true)
    }

    #[test]
    fn high_priority_lane_drains_first() {
        let queue = TaskQueue::new();
        let normal = held_node();
        let high = held_node();
        queue.push(normal.clone(), TaskPriority::Normal);
        queue.push(high.clone(), TaskPriority::High);
        assert_eq!(queue.len(), 2);

        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &high));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &normal));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn push_triggers_wake_event() {
        let queue = TaskQueue::new();
        queue.push(held_node(), TaskPriority::Normal);
        assert!(queue.event().wait_timeout(Duration::from_millis(1)));
        assert_eq!(queue.drain().len(), 1);
        assert_eq!(queue.len(), 0);
    }
}
