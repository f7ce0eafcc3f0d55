//! User-visible notifications ("toasts")

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Success => "success",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Lets a renderer dismiss or deduplicate a toast
    pub id: Uuid,
    pub level: Level,
    pub message: String,
}

/// Fan-out of notifications to whatever renders them
///
/// Sending never fails; with no subscriber the notification is only logged.
#[derive(Clone)]
pub struct Notifications {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifications {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn notify(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::Error => log::error!("{}", message),
            Level::Warning => log::warn!("{}", message),
            Level::Success | Level::Info => log::info!("{}", message),
        }
        let _ = self.sender.send(Notification {
            id: Uuid::new_v4(),
            level,
            message,
        });
    }

    pub fn success(&self, message: impl Into<String>) {
        self.notify(Level::Success, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(Level::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(Level::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(Level::Error, message)
    }
}
