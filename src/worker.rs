// 🧵 Background tasks - one blocking job per slot, polled from the UI loop
// The interactive thread never blocks on a job; it checks the slot each tick.

use crate::error::{LedgerError, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
}

/// Holds at most one running job and its result channel
pub struct TaskSlot<T> {
    name: &'static str,
    pending: Option<Receiver<TaskOutcome<T>>>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

impl<T: Send + 'static> TaskSlot<T> {
    pub fn new(name: &'static str) -> Self {
        TaskSlot { name, pending: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Start `job` on its own thread. Fails with Busy if a job is in flight.
    pub fn spawn<F>(&mut self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.pending.is_some() {
            return Err(LedgerError::Busy(self.name));
        }

        let (tx, rx) = mpsc::channel();
        let name = self.name;
        thread::Builder::new()
            .name(format!("task-{}", name))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                    Err(payload) => {
                        let message = panic_message(payload);
                        error!(task = name, %message, "background task panicked");
                        TaskOutcome::Failed(message)
                    }
                };
                // The receiver is gone only if the slot was dropped
                let _ = tx.send(outcome);
            })?;

        debug!(task = name, "background task started");
        self.pending = Some(rx);
        Ok(())
    }

    /// Non-blocking check. Returns the outcome once, then the slot is free.
    pub fn poll(&mut self) -> Option<TaskOutcome<T>> {
        let rx = self.pending.as_ref()?;
        match rx.try_recv() {
            Ok(outcome) => {
                self.pending = None;
                Some(outcome)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                Some(TaskOutcome::Failed(format!("{} stopped without a result", self.name)))
            }
        }
    }

    /// Block until the current job finishes. Used by the command-line paths.
    pub fn wait(&mut self) -> Option<TaskOutcome<T>> {
        let rx = self.pending.take()?;
        Some(
            rx.recv()
                .unwrap_or_else(|_| TaskOutcome::Failed(format!("{} stopped without a result", self.name))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_completed_job_is_delivered_once() {
        let mut slot = TaskSlot::new("export");
        slot.spawn(|| Ok(21 * 2)).unwrap();

        assert_eq!(slot.wait(), Some(TaskOutcome::Completed(42)));
        assert!(!slot.is_busy());
        assert_eq!(slot.poll(), None);
    }

    #[test]
    fn test_failed_job_carries_message() {
        let mut slot: TaskSlot<()> = TaskSlot::new("import");
        slot.spawn(|| Err(LedgerError::Import("文件缺少必要的列: 日期".to_string())))
            .unwrap();

        match slot.wait() {
            Some(TaskOutcome::Failed(message)) => assert!(message.contains("日期")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_busy_slot_rejects_second_job() {
        let barrier = Arc::new(Barrier::new(2));
        let mut slot = TaskSlot::new("export");
        let gate = barrier.clone();
        slot.spawn(move || {
            gate.wait();
            Ok("done")
        })
        .unwrap();

        let err = slot.spawn(|| Ok("second")).unwrap_err();
        assert!(matches!(err, LedgerError::Busy("export")));
        assert_eq!(slot.poll(), None);

        barrier.wait();
        assert_eq!(slot.wait(), Some(TaskOutcome::Completed("done")));
        assert!(slot.spawn(|| Ok("third")).is_ok());
    }

    #[test]
    fn test_panicking_job_reports_failure() {
        let mut slot: TaskSlot<u8> = TaskSlot::new("export");
        slot.spawn(|| panic!("disk on fire")).unwrap();

        assert_eq!(slot.wait(), Some(TaskOutcome::Failed("disk on fire".to_string())));
    }

    #[test]
    fn test_poll_until_done() {
        let mut slot = TaskSlot::new("import");
        slot.spawn(|| Ok(vec![1, 2, 3])).unwrap();

        let outcome = loop {
            if let Some(outcome) = slot.poll() {
                break outcome;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        };
        assert_eq!(outcome, TaskOutcome::Completed(vec![1, 2, 3]));
    }
}
