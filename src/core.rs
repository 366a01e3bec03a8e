//! Wiring: build the store, extractor, sink, chat engine, and scheduler,
//! then serve a local line-based chat until shutdown.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::chat::{ChatEngine, ChatPolicy};
use crate::config::{AppConfig, NotifierKind};
use crate::extractor::LlmExtractor;
use crate::notify::{LogSink, WebhookSink};
use crate::scheduler::ReminderScheduler;
use crate::state::SqliteStore;
use crate::traits::{Extractor, NotificationSink, SessionStore, TaskStore};
use crate::types::TurnRequest;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(&config.state.db_path).await?);
    let tasks: Arc<dyn TaskStore> = store.clone();
    let sessions: Arc<dyn SessionStore> = store.clone();
    info!(db_path = %config.state.db_path, "State store ready");

    let extractor: Arc<dyn Extractor> = Arc::new(LlmExtractor::new(&config.provider)?);
    let sink: Arc<dyn NotificationSink> = match config.notifier.kind {
        NotifierKind::Webhook => Arc::new(WebhookSink::new(&config.notifier.webhook_url)?),
        NotifierKind::Log => Arc::new(LogSink),
    };

    let engine = ChatEngine::new(
        extractor,
        tasks.clone(),
        sessions.clone(),
        ChatPolicy {
            last_task_retention_turns: config.chat.last_task_retention_turns,
        },
    );

    let shutdown = CancellationToken::new();
    let mut scheduler_handle = None;
    if config.scheduler.enabled {
        let scheduler = Arc::new(ReminderScheduler::new(
            tasks,
            sink,
            sessions,
            config.scheduler.poll_interval_secs,
            config.state.session_ttl_secs(),
        ));
        scheduler_handle = Some(scheduler.spawn(shutdown.clone()));
    }

    // Local chat channel: one conversation per process, one turn per line.
    // Outer surfaces (HTTP, bots) call ChatEngine::handle_turn the same way.
    let user = whoami();
    let conversation_id = format!("local:{}", user);
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(b"tasknest ready. Describe a task, or ctrl-c to quit.\n> ")
        .await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let message = line.trim();
                if message.is_empty() {
                    stdout.write_all(b"> ").await?;
                    stdout.flush().await?;
                    continue;
                }
                let reply = turn_reply(
                    &engine,
                    &TurnRequest {
                        conversation_id: conversation_id.clone(),
                        user_id: user.clone(),
                        message: message.to_string(),
                    },
                )
                .await;
                stdout.write_all(format!("{}\n> ", reply).as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        // Let an in-flight cycle finish.
        let _ = handle.await;
    }
    Ok(())
}

/// A failed turn must not take the daemon down: store or session errors
/// are logged and answered with a retry prompt, and the loop continues.
pub(crate) async fn turn_reply(engine: &ChatEngine, req: &TurnRequest) -> String {
    match engine.handle_turn(req).await {
        Ok(response) => response.message,
        Err(e) => {
            error!(conversation_id = %req.conversation_id, "Turn failed: {:#}", e);
            "Something went wrong on my side. Please try that again.".to_string()
        }
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}
