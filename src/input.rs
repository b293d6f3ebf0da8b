//! Input stream bridge
//!
//! Turns discrete `push` calls into the single ordered feed the model-query
//! engine consumes for the whole life of a session. The feed is handed out
//! once; a session that needs a fresh feed needs a fresh bridge.

use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One user message delivered to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub text: String,

    /// Engine-assigned conversation id, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    pub sent_at: DateTime<Utc>,
}

/// Producer side of the bridge, owned by the session
pub struct InputStream {
    session_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<UserMessage>>>,
    feed: Mutex<Option<InputFeed>>,
    conversation_id: OnceLock<String>,
}

impl InputStream {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            tx: Mutex::new(Some(tx)),
            feed: Mutex::new(Some(InputFeed {
                stream: UnboundedReceiverStream::new(rx),
            })),
            conversation_id: OnceLock::new(),
        }
    }

    /// Create a bridge for a resumed session whose conversation id is known
    pub fn resumed(session_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let stream = Self::new(session_id);
        let _ = stream.conversation_id.set(conversation_id.into());
        stream
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<UserMessage>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the consumer feed; only the first call returns it
    pub fn take_feed(&self) -> Option<InputFeed> {
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Queue a user message for the engine
    pub fn push(&self, text: impl Into<String>) -> Result<()> {
        let message = UserMessage {
            text: text.into(),
            conversation_id: self.conversation_id().map(str::to_string),
            sent_at: Utc::now(),
        };

        let guard = self.sender();
        let tx = guard
            .as_ref()
            .ok_or_else(|| SessionError::Closed(format!("input stream for {}", self.session_id)))?;
        tx.send(message)
            .map_err(|_| SessionError::Closed(format!("input feed for {} was dropped", self.session_id)))
    }

    /// Record the engine-assigned conversation id
    ///
    /// Only the first call takes effect; a later call with a different id is
    /// logged and ignored, one repeating the stored id is a no-op.
    pub fn set_conversation_id(&self, conversation_id: impl Into<String>) -> bool {
        let conversation_id = conversation_id.into();
        if self.conversation_id() == Some(conversation_id.as_str()) {
            return false;
        }
        match self.conversation_id.set(conversation_id) {
            Ok(()) => true,
            Err(rejected) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    existing = ?self.conversation_id.get(),
                    rejected = %rejected,
                    "Conversation id already set, ignoring"
                );
                false
            }
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.get().map(String::as_str)
    }

    /// Terminate the feed; safe to call more than once
    pub fn close(&self) {
        if self.sender().take().is_some() {
            tracing::debug!(session_id = %self.session_id, "Input stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

/// Consumer side of the bridge, handed to the engine
pub struct InputFeed {
    stream: UnboundedReceiverStream<UserMessage>,
}

impl Stream for InputFeed {
    type Item = UserMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}
