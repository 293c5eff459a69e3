//! Admission-controlled task queue
//!
//! Tasks live in exactly one of two collections: `waiting` (FIFO) or
//! `running` (bounded by `max_concurrent`). Promotion happens only through
//! [`TaskQueue::pop_next`], which checks the bound, so the bound cannot be
//! exceeded by construction.

use std::collections::VecDeque;

use cowork_protocol::QueuedTask;

#[derive(Debug)]
pub struct TaskQueue {
    waiting: VecDeque<QueuedTask>,
    running: Vec<QueuedTask>,
    max_concurrent: usize,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            running: Vec::new(),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Lowering the bound never evicts running tasks; it only stops promotion
    /// until enough of them settle.
    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = max_concurrent.max(1);
    }

    pub fn enqueue(&mut self, task: QueuedTask) {
        self.waiting.push_back(task);
    }

    /// Removes the earliest waiting task if a running slot is free.
    ///
    /// The caller must hand the task back through [`insert_running`]
    /// (or drop it on failure) before the next call.
    ///
    /// [`insert_running`]: TaskQueue::insert_running
    pub fn pop_next(&mut self) -> Option<QueuedTask> {
        if self.running.len() >= self.max_concurrent {
            return None;
        }
        self.waiting.pop_front()
    }

    pub fn insert_running(&mut self, task: QueuedTask) {
        self.running.push(task);
    }

    pub fn take_waiting(&mut self, task_id: &str) -> Option<QueuedTask> {
        let idx = self.waiting.iter().position(|t| t.id == task_id)?;
        self.waiting.remove(idx)
    }

    pub fn take_running(&mut self, task_id: &str) -> Option<QueuedTask> {
        let idx = self.running.iter().position(|t| t.id == task_id)?;
        Some(self.running.remove(idx))
    }

    /// The running task whose session is `session_id`, if any.
    pub fn running_for_session(&self, session_id: &str) -> Option<&QueuedTask> {
        self.running
            .iter()
            .find(|t| t.session_id.as_deref() == Some(session_id))
    }

    pub fn running_for_task(&self, task_id: &str) -> Option<&QueuedTask> {
        self.running.iter().find(|t| t.id == task_id)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Waiting ∪ running, ordered by creation time.
    pub fn list(&self) -> Vec<QueuedTask> {
        let mut tasks: Vec<QueuedTask> = self
            .waiting
            .iter()
            .chain(self.running.iter())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowork_protocol::TaskStatus;

    fn task(id: &str, created_at: i64) -> QueuedTask {
        QueuedTask {
            id: id.to_string(),
            prompt: format!("prompt {id}"),
            cwd: "/tmp".to_string(),
            status: TaskStatus::Queued,
            session_id: None,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    fn promote(queue: &mut TaskQueue, session_id: &str) -> Option<String> {
        let mut next = queue.pop_next()?;
        next.status = TaskStatus::Running;
        next.session_id = Some(session_id.to_string());
        let id = next.id.clone();
        queue.insert_running(next);
        Some(id)
    }

    #[test]
    fn promotion_is_fifo_and_bounded() {
        let mut queue = TaskQueue::new(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            queue.enqueue(task(id, i as i64));
        }

        assert_eq!(promote(&mut queue, "s-a").as_deref(), Some("a"));
        assert_eq!(promote(&mut queue, "s-b").as_deref(), Some("b"));
        assert_eq!(promote(&mut queue, "s-c"), None);
        assert_eq!(queue.running_len(), 2);
        assert_eq!(queue.waiting_len(), 1);

        queue.take_running("a").expect("a running");
        assert_eq!(promote(&mut queue, "s-c").as_deref(), Some("c"));
    }

    #[test]
    fn a_task_is_never_in_both_views() {
        let mut queue = TaskQueue::new(1);
        queue.enqueue(task("a", 1));
        queue.enqueue(task("b", 2));
        promote(&mut queue, "s-a");

        let listed: Vec<String> = queue.list().into_iter().map(|t| t.id).collect();
        assert_eq!(listed, vec!["a".to_string(), "b".to_string()]);
        assert!(queue.take_waiting("a").is_none());
        assert!(queue.take_running("b").is_none());
    }

    #[test]
    fn cancelled_waiting_task_is_removed() {
        let mut queue = TaskQueue::new(1);
        queue.enqueue(task("a", 1));
        assert!(queue.take_waiting("a").is_some());
        assert!(queue.take_waiting("a").is_none());
        assert!(queue.list().is_empty());
    }

    #[test]
    fn finds_running_task_by_session() {
        let mut queue = TaskQueue::new(3);
        queue.enqueue(task("a", 1));
        promote(&mut queue, "sess-1");
        assert_eq!(
            queue.running_for_session("sess-1").map(|t| t.id.as_str()),
            Some("a")
        );
        assert!(queue.running_for_session("sess-2").is_none());
    }

    #[test]
    fn bound_is_at_least_one() {
        let mut queue = TaskQueue::new(0);
        assert_eq!(queue.max_concurrent(), 1);
        queue.set_max_concurrent(4);
        assert_eq!(queue.max_concurrent(), 4);
    }

    #[test]
    fn lowering_bound_pauses_promotion() {
        let mut queue = TaskQueue::new(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            queue.enqueue(task(id, i as i64));
        }
        promote(&mut queue, "s-a");
        promote(&mut queue, "s-b");
        queue.set_max_concurrent(1);

        queue.take_running("a");
        assert!(queue.pop_next().is_none());
        queue.take_running("b");
        assert_eq!(queue.pop_next().map(|t| t.id), Some("c".to_string()));
    }
}
