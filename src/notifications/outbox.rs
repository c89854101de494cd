use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use super::{Dispatcher, StateChange};

enum Job {
    Dispatch(StateChange),
    Flush(oneshot::Sender<()>),
}

/// Ordered hand-off from committed writes to the dispatcher.
///
/// A single worker task drains the queue, so changes are dispatched in commit
/// order and the writer never waits on notification storage or pushes.
pub struct Outbox {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Outbox {
    /// Spawn the worker. Must be called from within a Tokio runtime; the
    /// worker exits once the outbox is dropped and the queue is drained.
    pub fn spawn(dispatcher: Arc<Dispatcher>) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                match job {
                    Job::Dispatch(change) => {
                        let stored = dispatcher.dispatch(change).await;
                        debug!("Dispatched state change, {} notification(s) stored", stored);
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { jobs }
    }

    pub fn send(&self, change: StateChange) {
        if self.jobs.send(Job::Dispatch(change)).is_err() {
            warn!("Notification worker is gone; dropping state change");
        }
    }

    /// Wait until everything sent so far has been dispatched.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::notifications::PushKind;

    #[tokio::test]
    async fn test_flush_waits_for_queued_changes_in_order() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&db), vec!["admin-1".into()]));
        let (_conn, mut rx) = dispatcher.connect("admin-1");
        let outbox = Outbox::spawn(Arc::clone(&dispatcher));

        for (user_id, name) in [("u1", "First"), ("u2", "Second")] {
            outbox.send(StateChange::UserRegistered {
                user_id: user_id.into(),
                display_name: name.into(),
            });
        }
        outbox.flush().await;

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.kind, PushKind::Notification);
        assert!(first.data["message"].as_str().unwrap().starts_with("First"));
        assert!(second.data["message"].as_str().unwrap().starts_with("Second"));
        assert_eq!(dispatcher.unread_count("admin-1").await.unwrap(), 2);
    }
}
