//! Per-topic task queues: pull work queues with round-robin dispatch and
//! ack bookkeeping, and subscribe queues for publish fan-out.
//!
//! Queues hold channel *names*, never channel records; a referenced channel
//! can vanish between two dispatch attempts and the queue must tolerate it.
//! The router owns the queues alongside the registry and resolves names to
//! sockets at send time.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::protocol::{ChannelName, ContentType, MessageId, Payload, TopicName};

/// One work item from a `push`, waiting for or assigned to a worker.
#[derive(Debug, Clone)]
pub struct PushTask {
    pub source: ChannelName,
    pub topic: TopicName,
    pub content_type: ContentType,
    pub payload: Payload,
}

/// Work queue for one pull topic.
///
/// Members are kept in insertion order; the cursor walks them round-robin.
/// Every in-flight item has exactly one assigned worker; when that worker
/// dies before acking, the item returns to the head of the backlog.
#[derive(Debug, Default)]
pub struct PullQueue {
    members: Vec<ChannelName>,
    cursor: usize,
    backlog: VecDeque<PushTask>,
    in_flight: HashMap<MessageId, InFlight>,
}

#[derive(Debug)]
struct InFlight {
    worker: ChannelName,
    task: PushTask,
}

impl PullQueue {
    pub fn add_member(&mut self, name: &str) {
        if !self.members.iter().any(|member| member == name) {
            self.members.push(name.to_string());
        }
    }

    pub fn has_members(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn enqueue(&mut self, task: PushTask) {
        self.backlog.push_back(task);
    }

    /// Put a task back at the queue head, ahead of everything pending.
    pub fn requeue_front(&mut self, task: PushTask) {
        self.backlog.push_front(task);
    }

    /// Pick the next worker round-robin and pop the head task for it.
    ///
    /// Returns `None` when the backlog is empty or no member exists; held
    /// tasks stay queued until a worker registers.
    pub fn next_assignment(&mut self) -> Option<(ChannelName, PushTask)> {
        if self.members.is_empty() || self.backlog.is_empty() {
            return None;
        }
        let index = self.cursor % self.members.len();
        self.cursor = (index + 1) % self.members.len();
        let worker = self.members[index].clone();
        let task = self.backlog.pop_front()?;
        Some((worker, task))
    }

    /// Record a dispatched task as in flight under its broker-assigned id.
    pub fn begin_flight(&mut self, id: MessageId, worker: ChannelName, task: PushTask) {
        self.in_flight.insert(id, InFlight { worker, task });
    }

    /// Complete an in-flight item; false for unknown or already-acked ids.
    pub fn ack(&mut self, id: MessageId) -> bool {
        self.in_flight.remove(&id).is_some()
    }

    /// Drop a member and reclaim its unacked work.
    ///
    /// The reclaimed tasks go back to the head of the backlog in their
    /// original dispatch order, so redelivery sees them first. Returns the
    /// number of reclaimed tasks.
    pub fn remove_member(&mut self, name: &str) -> usize {
        if let Some(index) = self.members.iter().position(|member| member == name) {
            self.members.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            if !self.members.is_empty() {
                self.cursor %= self.members.len();
            } else {
                self.cursor = 0;
            }
        }

        let mut reclaimed: Vec<(MessageId, PushTask)> = Vec::new();
        self.in_flight.retain(|id, flight| {
            if flight.worker == name {
                reclaimed.push((*id, flight.task.clone()));
                false
            } else {
                true
            }
        });
        // Ids are assigned monotonically, so sorting restores dispatch order.
        reclaimed.sort_by_key(|(id, _)| *id);
        let count = reclaimed.len();
        for (_, task) in reclaimed.into_iter().rev() {
            self.backlog.push_front(task);
        }
        count
    }
}

/// Fan-out membership for one subscribe topic.
#[derive(Debug, Default)]
pub struct SubscribeQueue {
    members: Vec<ChannelName>,
}

impl SubscribeQueue {
    pub fn add_member(&mut self, name: &str) {
        if !self.members.iter().any(|member| member == name) {
            self.members.push(name.to_string());
        }
    }

    pub fn remove_member(&mut self, name: &str) {
        self.members.retain(|member| member != name);
    }

    pub fn members(&self) -> &[ChannelName] {
        &self.members
    }
}

/// All task queues, one per `(kind, topic)`.
#[derive(Debug, Default)]
pub struct TaskQueues {
    pull: HashMap<TopicName, PullQueue>,
    sub: HashMap<TopicName, SubscribeQueue>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pull_member(&mut self, topic: &str, name: &str) {
        self.pull
            .entry(topic.to_string())
            .or_default()
            .add_member(name);
    }

    pub fn add_subscribe_member(&mut self, topic: &str, name: &str) {
        self.sub
            .entry(topic.to_string())
            .or_default()
            .add_member(name);
    }

    /// Queue `tasks` on the pull queue for `topic`, creating the queue if
    /// no worker has registered yet (tasks are then held until one does).
    pub fn enqueue_push(&mut self, topic: &str, tasks: Vec<PushTask>) {
        let queue = self.pull.entry(topic.to_string()).or_default();
        for task in tasks {
            queue.enqueue(task);
        }
    }

    pub fn pull_queue_mut(&mut self, topic: &str) -> Option<&mut PullQueue> {
        self.pull.get_mut(topic)
    }

    pub fn subscribers(&self, topic: &str) -> &[ChannelName] {
        self.sub
            .get(topic)
            .map(|queue| queue.members())
            .unwrap_or(&[])
    }

    /// Complete an in-flight pull item.
    pub fn ack(&mut self, topic: &str, id: MessageId) -> bool {
        self.pull
            .get_mut(topic)
            .map(|queue| queue.ack(id))
            .unwrap_or(false)
    }

    /// Scrub a dead channel from every queue; returns the pull topics that
    /// got work reclaimed and need a dispatch pass.
    pub fn remove_channel(&mut self, name: &str) -> Vec<TopicName> {
        let mut requeued = Vec::new();
        for (topic, queue) in self.pull.iter_mut() {
            let reclaimed = queue.remove_member(name);
            if reclaimed > 0 {
                debug!(
                    "reclaimed {} unacked item(s) on '{}' from channel '{}'",
                    reclaimed, topic, name
                );
                requeued.push(topic.clone());
            }
        }
        for queue in self.sub.values_mut() {
            queue.remove_member(name);
        }
        requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(payload: &str) -> PushTask {
        PushTask {
            source: "producer".into(),
            topic: "job".into(),
            content_type: ContentType::String,
            payload: Payload::text(payload),
        }
    }

    fn drain(queue: &mut PullQueue, next_id: &mut MessageId) -> Vec<(ChannelName, String)> {
        let mut out = Vec::new();
        while let Some((worker, task)) = queue.next_assignment() {
            *next_id += 1;
            let label = match &task.payload {
                Payload::Text(text) => text.clone(),
                other => panic!("unexpected payload {:?}", other),
            };
            queue.begin_flight(*next_id, worker.clone(), task);
            out.push((worker, label));
        }
        out
    }

    #[test]
    fn round_robin_alternates_workers() {
        let mut queue = PullQueue::default();
        queue.add_member("w1");
        queue.add_member("w2");
        for item in ["a", "b", "c", "d"] {
            queue.enqueue(task(item));
        }

        let mut id = 0;
        let assigned = drain(&mut queue, &mut id);
        assert_eq!(
            assigned,
            vec![
                ("w1".to_string(), "a".to_string()),
                ("w2".to_string(), "b".to_string()),
                ("w1".to_string(), "c".to_string()),
                ("w2".to_string(), "d".to_string()),
            ]
        );
        assert_eq!(queue.in_flight_len(), 4);
    }

    #[test]
    fn tasks_are_held_until_a_member_registers() {
        let mut queue = PullQueue::default();
        queue.enqueue(task("a"));
        assert!(queue.next_assignment().is_none());
        assert_eq!(queue.backlog_len(), 1);

        queue.add_member("w1");
        let (worker, held) = queue.next_assignment().expect("assignment");
        assert_eq!(worker, "w1");
        assert_eq!(held.payload, Payload::text("a"));
    }

    #[test]
    fn ack_completes_once() {
        let mut queue = PullQueue::default();
        queue.add_member("w1");
        queue.enqueue(task("a"));
        let (worker, t) = queue.next_assignment().expect("assignment");
        queue.begin_flight(1, worker, t);
        assert!(queue.ack(1));
        assert!(!queue.ack(1));
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn dead_worker_reclaims_unacked_work_in_order() {
        let mut queue = PullQueue::default();
        queue.add_member("w1");
        queue.add_member("w2");
        for item in ["a", "b", "c", "d"] {
            queue.enqueue(task(item));
        }
        let mut id = 0;
        drain(&mut queue, &mut id);

        // w1 held "a" and "c"; they return to the head in that order.
        let reclaimed = queue.remove_member("w1");
        assert_eq!(reclaimed, 2);
        assert_eq!(queue.backlog_len(), 2);

        let redelivered = drain(&mut queue, &mut id);
        assert_eq!(
            redelivered,
            vec![
                ("w2".to_string(), "a".to_string()),
                ("w2".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn removing_a_member_keeps_cursor_in_range() {
        let mut queue = PullQueue::default();
        queue.add_member("w1");
        queue.add_member("w2");
        queue.add_member("w3");
        queue.enqueue(task("a"));
        queue.enqueue(task("b"));
        let mut id = 0;
        drain(&mut queue, &mut id); // cursor now past w2

        queue.remove_member("w1");
        queue.remove_member("w2");
        queue.enqueue(task("c"));
        let (worker, _) = queue.next_assignment().expect("assignment");
        assert_eq!(worker, "w3");
    }

    #[test]
    fn subscribe_members_are_deduplicated_and_ordered() {
        let mut queues = TaskQueues::new();
        queues.add_subscribe_member("news", "s1");
        queues.add_subscribe_member("news", "s2");
        queues.add_subscribe_member("news", "s1");
        assert_eq!(queues.subscribers("news"), ["s1", "s2"]);
        assert!(queues.subscribers("other").is_empty());
    }

    #[test]
    fn remove_channel_reports_topics_needing_dispatch() {
        let mut queues = TaskQueues::new();
        queues.add_pull_member("job", "w1");
        queues.add_subscribe_member("news", "w1");
        queues.enqueue_push("job", vec![task("a")]);

        {
            let queue = queues.pull_queue_mut("job").expect("queue");
            let (worker, t) = queue.next_assignment().expect("assignment");
            queue.begin_flight(1, worker, t);
        }

        let requeued = queues.remove_channel("w1");
        assert_eq!(requeued, vec!["job".to_string()]);
        assert!(queues.subscribers("news").is_empty());
        assert_eq!(queues.pull_queue_mut("job").expect("queue").backlog_len(), 1);
    }
}
