//! Test infrastructure: a scripted extractor, a recording notification
//! sink, and a harness wiring a real ChatEngine against in-memory SQLite.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::chat::{ChatEngine, ChatPolicy};
use crate::traits::{Extractor, NotificationSink};
use crate::state::SqliteStore;
use crate::types::{
    ChatMessage, ExtractorOutput, Task, TaskData, TaskDraft, TurnRequest, TurnResponse,
};

/// Extractor that replays a FIFO queue of scripted outputs.
pub struct ScriptedExtractor {
    outputs: Mutex<VecDeque<anyhow::Result<ExtractorOutput>>>,
}

impl ScriptedExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(VecDeque::new()),
        })
    }

    pub async fn push(&self, output: ExtractorOutput) {
        self.outputs.lock().await.push_back(Ok(output));
    }

    pub async fn push_error(&self, message: &str) {
        self.outputs
            .lock()
            .await
            .push_back(Err(anyhow::anyhow!("{}", message)));
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        _history: &[ChatMessage],
        _draft: &TaskDraft,
        _reference: Option<&Task>,
    ) -> anyhow::Result<ExtractorOutput> {
        self.outputs
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(ExtractorOutput::default()))
    }
}

/// Sink that records every send and can be told to fail.
pub struct RecordingSink {
    pub sent: Mutex<Vec<(String, String, String)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, account: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("scripted sink failure");
        }
        self.sent.lock().await.push((
            account.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

/// A ChatEngine with scripted extraction over a real in-memory store.
pub struct TestHarness {
    pub store: Arc<SqliteStore>,
    pub extractor: Arc<ScriptedExtractor>,
    pub engine: ChatEngine,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_policy(ChatPolicy::default()).await
    }

    pub async fn with_policy(policy: ChatPolicy) -> Self {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let extractor = ScriptedExtractor::new();
        let engine = ChatEngine::new(
            extractor.clone(),
            store.clone(),
            store.clone(),
            policy,
        );
        Self {
            store,
            extractor,
            engine,
        }
    }

    pub async fn turn(&self, message: &str) -> TurnResponse {
        self.engine
            .handle_turn(&TurnRequest {
                conversation_id: "test-conv".to_string(),
                user_id: "u1".to_string(),
                message: message.to_string(),
            })
            .await
            .unwrap()
    }
}

/// Delta builder: a reminder with a trigger time.
pub fn reminder_delta(title: &str, trigger_time: DateTime<Utc>) -> ExtractorOutput {
    let mut data = TaskData::default();
    data.trigger_time = Some(trigger_time);
    ExtractorOutput {
        kind: Some("reminder".to_string()),
        title: Some(title.to_string()),
        data,
        reply: "Sure.".to_string(),
        ..Default::default()
    }
}

/// Delta builder: a fully specified todo.
pub fn todo_delta(title: &str) -> ExtractorOutput {
    ExtractorOutput {
        kind: Some("todo".to_string()),
        title: Some(title.to_string()),
        reply: "Okay.".to_string(),
        ..Default::default()
    }
}
