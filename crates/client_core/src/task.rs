use std::future::Future;

use tokio::task::JoinHandle;

/// Owned handle to a spawned background task. Cancelling is idempotent and
/// dropping the handle cancels the task, so a timer loop can never outlive its
/// owner.
#[derive(Debug)]
pub struct TaskHandle {
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: Some(tokio::spawn(future)),
        }
    }

    /// Returns `true` only for the call that actually stopped the task.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Lets the task run to completion on its own; used by a task that is
    /// releasing its own handle on the way out.
    pub fn detach(mut self) {
        self.task.take();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
