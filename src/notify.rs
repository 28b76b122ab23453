use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeAction {
    /// Re-invoke the completion toggle for this habit.
    UndoToggle { habit_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
            description: None,
            action: None,
        }
    }

    pub fn error(message: impl Into<String>, description: Option<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
            description,
            action: None,
        }
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Transient user-facing messages. Every subscriber sees every notice sent
/// after it subscribed.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn push(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Success => info!(message = %notice.message, "notice"),
            NoticeLevel::Error => warn!(
                message = %notice.message,
                description = notice.description.as_deref().unwrap_or_default(),
                "notice"
            ),
        }
        let _ = self.sender.send(notice);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(Notice::success(message));
    }

    pub fn error(&self, message: impl Into<String>, description: Option<String>) {
        self.push(Notice::error(message, description));
    }
}

/// Collects every notice already queued on `receiver` without waiting.
pub fn drain(receiver: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    std::iter::from_fn(|| loop {
        match receiver.try_recv() {
            Ok(notice) => return Some(notice),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return None,
        }
    })
    .collect()
}
