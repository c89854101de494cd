//! Live observer sessions.
//!
//! Each connection owns an unbounded sender. Fan-out clones a snapshot of the
//! matching senders under a short read lock and sends outside of it, so a
//! connection opening or closing mid-broadcast never races the iteration.

use std::collections::HashMap;
use std::sync::RwLock;

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::event::PushEvent;

pub type PushSender = mpsc::UnboundedSender<PushEvent>;
pub type PushReceiver = mpsc::UnboundedReceiver<PushEvent>;

#[derive(Debug)]
struct Session {
    user_id: String,
    sender: PushSender,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user_id`; events arrive on the returned receiver.
    pub fn connect(&self, user_id: &str) -> (String, PushReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4().to_string();

        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(
                    connection_id.clone(),
                    Session {
                        user_id: user_id.to_string(),
                        sender: tx,
                    },
                );
                debug!("Connection {} opened for user {}", connection_id, user_id);
            }
            Err(_) => warn!("Connection registry lock poisoned; {} will receive nothing", connection_id),
        }

        (connection_id, rx)
    }

    pub fn disconnect(&self, connection_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.remove(connection_id).is_some() {
                debug!("Connection {} closed", connection_id);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    fn snapshot(&self, user_id: Option<&str>) -> Vec<(String, PushSender)> {
        match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, s)| user_id.map(|u| s.user_id == u).unwrap_or(true))
                .map(|(id, s)| (id.clone(), s.sender.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn fan_out(&self, targets: Vec<(String, PushSender)>, event: &PushEvent) -> PushReport {
        let mut report = PushReport::default();
        let mut closed = Vec::new();

        for (connection_id, sender) in targets {
            match sender.send(event.clone()) {
                Ok(_) => report.delivered += 1,
                Err(_) => {
                    report.dropped += 1;
                    closed.push(connection_id);
                }
            }
        }

        // Receivers that went away without disconnecting
        for connection_id in closed {
            warn!("Dropping push to closed connection {}", connection_id);
            self.disconnect(&connection_id);
        }

        report
    }

    /// Push to every live session of one user.
    pub fn push_to_user(&self, user_id: &str, event: &PushEvent) -> PushReport {
        self.fan_out(self.snapshot(Some(user_id)), event)
    }

    /// Push to every live session.
    pub fn broadcast(&self, event: &PushEvent) -> PushReport {
        self.fan_out(self.snapshot(None), event)
    }
}
