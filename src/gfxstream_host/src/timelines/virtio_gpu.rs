// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use log::error;

pub type TaskId = u64;
pub type FenceCompletionCallback = Box<dyn FnOnce() + Send>;

/// The ring a fence or task is ordered on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VirtioGpuRing {
    Global,
    ContextSpecific { ctx_id: u32, ring_idx: u8 },
}

impl fmt::Display for VirtioGpuRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioGpuRing::Global => write!(f, "global"),
            VirtioGpuRing::ContextSpecific { ctx_id, ring_idx } => {
                write!(f, "context {} ring {}", ctx_id, ring_idx)
            }
        }
    }
}

enum TimelineItem {
    Task {
        id: TaskId,
        completed: bool,
    },
    Fence {
        fence_id: u64,
        callback: FenceCompletionCallback,
    },
}

#[derive(Default)]
struct State {
    next_task_id: TaskId,
    queues: BTreeMap<VirtioGpuRing, VecDeque<TimelineItem>>,
    task_rings: BTreeMap<TaskId, VirtioGpuRing>,
}

impl State {
    /// Pops finished tasks and the fences behind them off the front of `ring`.
    fn poll_ring(&mut self, ring: VirtioGpuRing, ready: &mut Vec<FenceCompletionCallback>) {
        let queue = match self.queues.get_mut(&ring) {
            Some(q) => q,
            None => return,
        };

        loop {
            match queue.front() {
                Some(TimelineItem::Task {
                    completed: true, ..
                }) => {
                    queue.pop_front();
                }
                Some(TimelineItem::Fence { .. }) => {
                    if let Some(TimelineItem::Fence { callback, .. }) = queue.pop_front() {
                        ready.push(callback);
                    }
                }
                _ => break,
            }
        }

        if queue.is_empty() {
            self.queues.remove(&ring);
        }
    }
}

/// Fences complete once every task enqueued before them on the same ring has completed.
/// Different rings are independent.
pub struct VirtioGpuTimelines {
    state: Mutex<State>,
    with_async_callback: bool,
}

impl VirtioGpuTimelines {
    /// With `with_async_callback`, enqueueing and task completion poll the affected ring
    /// immediately.  Otherwise fences only fire from `poll()`.
    pub fn new(with_async_callback: bool) -> VirtioGpuTimelines {
        VirtioGpuTimelines {
            state: Mutex::new(State {
                next_task_id: 1,
                ..Default::default()
            }),
            with_async_callback,
        }
    }

    pub fn enqueue_task(&self, ring: VirtioGpuRing) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state
            .queues
            .entry(ring)
            .or_default()
            .push_back(TimelineItem::Task {
                id,
                completed: false,
            });
        state.task_rings.insert(id, ring);
        id
    }

    pub fn enqueue_fence(
        &self,
        ring: VirtioGpuRing,
        fence_id: u64,
        callback: FenceCompletionCallback,
    ) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state
                .queues
                .entry(ring)
                .or_default()
                .push_back(TimelineItem::Fence { fence_id, callback });
            if self.with_async_callback {
                state.poll_ring(ring, &mut ready);
            }
        }
        ready.into_iter().for_each(|cb| cb());
    }

    pub fn notify_task_completion(&self, task_id: TaskId) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let ring = match state.task_rings.remove(&task_id) {
                Some(ring) => ring,
                None => {
                    error!("completion for unknown task {}", task_id);
                    return;
                }
            };

            if let Some(queue) = state.queues.get_mut(&ring) {
                for item in queue.iter_mut() {
                    if let TimelineItem::Task { id, completed } = item {
                        if *id == task_id {
                            *completed = true;
                            break;
                        }
                    }
                }
            }

            if self.with_async_callback {
                state.poll_ring(ring, &mut ready);
            }
        }
        ready.into_iter().for_each(|cb| cb());
    }

    /// Fires every fence whose predecessors have completed, on all rings.
    pub fn poll(&self) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let rings: Vec<VirtioGpuRing> = state.queues.keys().copied().collect();
            for ring in rings {
                state.poll_ring(ring, &mut ready);
            }
        }
        ready.into_iter().for_each(|cb| cb());
    }

    /// Fence ids still waiting on `ring`, front first.
    pub fn pending_fences(&self, ring: VirtioGpuRing) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(&ring)
            .map(|q| {
                q.iter()
                    .filter_map(|item| match item {
                        TimelineItem::Fence { fence_id, .. } => Some(*fence_id),
                        TimelineItem::Task { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(fired: &Arc<Mutex<Vec<u64>>>, id: u64) -> FenceCompletionCallback {
        let fired = fired.clone();
        Box::new(move || fired.lock().unwrap().push(id))
    }

    #[test]
    fn fence_waits_for_prior_tasks_on_its_ring() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let timelines = VirtioGpuTimelines::new(true);
        let ring = VirtioGpuRing::ContextSpecific {
            ctx_id: 1,
            ring_idx: 0,
        };

        let t1 = timelines.enqueue_task(ring);
        timelines.enqueue_fence(ring, 10, record(&fired, 10));
        let t2 = timelines.enqueue_task(ring);
        timelines.enqueue_fence(ring, 11, record(&fired, 11));

        // A fence on another ring is not held back.
        timelines.enqueue_fence(VirtioGpuRing::Global, 99, record(&fired, 99));
        assert_eq!(*fired.lock().unwrap(), vec![99]);

        timelines.notify_task_completion(t2);
        assert_eq!(*fired.lock().unwrap(), vec![99]);
        assert_eq!(timelines.pending_fences(ring), vec![10, 11]);

        timelines.notify_task_completion(t1);
        assert_eq!(*fired.lock().unwrap(), vec![99, 10, 11]);
        assert!(timelines.pending_fences(ring).is_empty());
    }

    #[test]
    fn synchronous_mode_fires_from_poll() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let timelines = VirtioGpuTimelines::new(false);
        let ring = VirtioGpuRing::Global;

        let task = timelines.enqueue_task(ring);
        timelines.enqueue_fence(ring, 5, record(&fired, 5));
        timelines.notify_task_completion(task);
        assert!(fired.lock().unwrap().is_empty());

        timelines.poll();
        assert_eq!(*fired.lock().unwrap(), vec![5]);

        // Unknown tasks are logged and ignored.
        timelines.notify_task_completion(1234);
    }
}
