use std::collections::VecDeque;
use std::sync::Arc;

use skyport_core::{CancelledDelivery, DeliveryTask};
use tokio::sync::Mutex;

#[derive(Default)]
struct Queues {
    tasks: VecDeque<DeliveryTask>,
    cancelled: Vec<CancelledDelivery>,
}

/// Work waiting for the drone service to poll it.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<Mutex<Queues>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, task: DeliveryTask) {
        self.inner.lock().await.tasks.push_back(task);
    }

    /// Record a cancellation; a still-queued task for the same delivery is dropped.
    pub async fn cancel(&self, cancelled: CancelledDelivery) {
        let mut queues = self.inner.lock().await;
        let before = queues.tasks.len();
        queues
            .tasks
            .retain(|t| t.delivery_id != cancelled.delivery_id);

        // A task that never left the queue needs no cancellation notice.
        if queues.tasks.len() == before {
            queues.cancelled.push(cancelled);
        }
    }

    /// Take up to `max` tasks plus every pending cancellation.
    pub async fn take(&self, max: usize) -> (Vec<DeliveryTask>, Vec<CancelledDelivery>) {
        let mut queues = self.inner.lock().await;
        let n = max.min(queues.tasks.len());
        let tasks = queues.tasks.drain(..n).collect();
        let cancelled = std::mem::take(&mut queues.cancelled);
        (tasks, cancelled)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyport_core::{
        AutomatId, CellId, DeliveryId, Dimensions, DroneId, GoodId, OrderId,
    };

    fn task() -> DeliveryTask {
        DeliveryTask {
            delivery_id: DeliveryId::new(),
            order_id: OrderId::new(),
            good_id: GoodId::new(),
            drone_id: DroneId::new(),
            parcel_automat_id: AutomatId::new(),
            aruco_id: 7,
            locker_cell_id: CellId::new(),
            internal_locker_cell_id: None,
            dimensions: Dimensions::new(10, 10, 10),
        }
    }

    fn notice(task: &DeliveryTask) -> CancelledDelivery {
        CancelledDelivery {
            delivery_id: task.delivery_id,
            order_id: task.order_id,
            drone_id: task.drone_id,
        }
    }

    #[tokio::test]
    async fn take_is_fifo_and_bounded() {
        let queue = TaskQueue::new();
        let (a, b, c) = (task(), task(), task());
        for t in [&a, &b, &c] {
            queue.push(t.clone()).await;
        }

        let (tasks, cancelled) = queue.take(2).await;
        assert_eq!(tasks, vec![a, b]);
        assert!(cancelled.is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_removes_it_silently() {
        let queue = TaskQueue::new();
        let t = task();
        queue.push(t.clone()).await;

        queue.cancel(notice(&t)).await;

        let (tasks, cancelled) = queue.take(10).await;
        assert!(tasks.is_empty());
        assert!(cancelled.is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_dispatched_task_is_reported_once() {
        let queue = TaskQueue::new();
        let t = task();
        queue.push(t.clone()).await;
        let _ = queue.take(10).await;

        queue.cancel(notice(&t)).await;

        let (_, cancelled) = queue.take(10).await;
        assert_eq!(cancelled, vec![notice(&t)]);
        let (_, cancelled) = queue.take(10).await;
        assert!(cancelled.is_empty());
    }
}
