use std::future::Future;

use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

/// A spawned background job that is cancelled explicitly or when dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    done: watch::Receiver<bool>,
}

/// Resolves once the job has returned or been torn down. Waiting on it
/// leaves cancellation with the task owner.
#[derive(Debug, Clone)]
pub struct TaskDone(watch::Receiver<bool>);

impl TaskDone {
    pub async fn wait(mut self) {
        // A closed channel means the job was aborted or panicked.
        let _ = self.0.wait_for(|done| *done).await;
    }
}

impl ScheduledTask {
    pub fn spawn<F>(name: &'static str, job: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (finished, done) = watch::channel(false);
        let handle = tokio::spawn(async move {
            job.await;
            let _ = finished.send(true);
        });
        Self {
            name,
            handle: Some(handle),
            done,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn done(&self) -> TaskDone {
        TaskDone(self.done.clone())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!(task = self.name, "cancelling scheduled task");
            }
            handle.abort();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
