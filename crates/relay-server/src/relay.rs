//! Per-request event fan-out, command handling and generation under a
//! shared deadline.

use std::sync::Arc;
use std::time::Duration;

use relay_config::Config;
use relay_contracts::{Event, MessageContent, MessageEvent, Source};
use relay_kernel::command::{self, Command};
use relay_kernel::{replies, strip_marker, Scope, ScopeKey, ScopeKind};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::gateway::MessagingGateway;
use crate::provider::CompletionProvider;
use crate::store::{SettingsStore, StoreError};

/// Point in time by which the inbound webhook must be answered. Copied into
/// every event task; never mutated.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Time left once `margin` is reserved before the deadline.
    pub fn budget(&self, margin: Duration) -> Duration {
        relay_kernel::budget(self.remaining(), margin)
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub command_marker: String,
    pub request_timeout: Duration,
    pub wait_margin: Duration,
    pub generation_margin: Duration,
}

impl RelaySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command_marker: cfg.relay.command_marker.clone(),
            request_timeout: Duration::from_millis(cfg.server.request_timeout_ms),
            wait_margin: Duration::from_millis(cfg.server.wait_margin_ms),
            generation_margin: Duration::from_millis(cfg.relay.generation_margin_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub total: usize,
    /// Tasks still running when the wait budget ran out. They are detached,
    /// not aborted.
    pub abandoned: usize,
}

pub struct Relay {
    store: Arc<dyn SettingsStore>,
    provider: Arc<dyn CompletionProvider>,
    gateway: Arc<dyn MessagingGateway>,
    settings: RelaySettings,
}

struct TextMessage {
    scope: Scope,
    text: String,
    reply_token: String,
    quote_token: Option<String>,
}

impl Relay {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        provider: Arc<dyn CompletionProvider>,
        gateway: Arc<dyn MessagingGateway>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            provider,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Spawns one task per event and waits for them until `wait_margin`
    /// before the deadline.
    pub async fn dispatch(self: &Arc<Self>, events: Vec<Event>, deadline: Deadline) -> DispatchOutcome {
        let total = events.len();
        let mut handles: Vec<JoinHandle<()>> = events
            .into_iter()
            .enumerate()
            .map(|(index, event)| {
                let relay = Arc::clone(self);
                let span = info_span!("event", index, kind = event.kind());
                tokio::spawn(async move { relay.handle_event(event, deadline).await }.instrument(span))
            })
            .collect();

        let wait = deadline.budget(self.settings.wait_margin);
        let finished = tokio::time::timeout(wait, async {
            for handle in handles.iter_mut() {
                if let Err(err) = handle.await {
                    error!(error = %err, "event task failed");
                }
            }
        })
        .await
        .is_ok();

        let abandoned = if finished {
            0
        } else {
            handles.iter().filter(|h| !h.is_finished()).count()
        };
        if abandoned > 0 {
            warn!(total, abandoned, "deadline reached; leaving unfinished events running");
        }
        DispatchOutcome { total, abandoned }
    }

    async fn handle_event(&self, event: Event, deadline: Deadline) {
        let event = match event {
            Event::Message(event) => event,
            Event::Unsupported => {
                debug!("ignoring non-message event");
                return;
            }
        };
        let occurred_at = event.occurred_at();
        let MessageEvent {
            reply_token,
            source,
            message,
            webhook_event_id,
            ..
        } = event;

        let scope = match source {
            Source::User { user_id } => Scope::User { user_id },
            Source::Group { group_id, user_id } => Scope::Group {
                group_id,
                user_id: user_id.unwrap_or_default(),
            },
            other => {
                warn!(source_kind = other.kind(), "unsupported event source");
                return;
            }
        };
        let content = match message {
            MessageContent::Text(content) => content,
            other => {
                warn!(message_kind = other.kind(), "unsupported message type");
                return;
            }
        };
        let Some(reply_token) = reply_token else {
            warn!(%webhook_event_id, "message event without reply token");
            return;
        };

        let text = match scope.kind() {
            ScopeKind::User => content.text,
            ScopeKind::Group => match strip_marker(&content.text, &self.settings.command_marker) {
                Some(stripped) => stripped.to_string(),
                None => {
                    debug!("group message without command marker");
                    return;
                }
            },
        };

        info!(
            user_id = scope.user_id(),
            group_id = scope.group_id(),
            %webhook_event_id,
            occurred_at = ?occurred_at,
            "handling text message"
        );
        let message = TextMessage {
            scope,
            text,
            reply_token,
            quote_token: content.quote_token,
        };
        match command::parse(&message.text, message.scope.kind()) {
            Some(command) => self.run_command(&message, command).await,
            None => self.generate(&message, deadline).await,
        }
    }

    async fn run_command(&self, message: &TextMessage, command: Command) {
        let scope = &message.scope;
        let reply = match command {
            Command::SetDefaultInstruction(instruction) => match scope.fallback_key() {
                Some(key) => {
                    self.save(scope, &key, &instruction, replies::DEFAULT_INSTRUCTION_UPDATED)
                        .await
                }
                None => replies::UPDATE_FAILED.to_string(),
            },
            Command::SetInstruction(instruction) => {
                self.save(
                    scope,
                    &scope.personal_key(),
                    &instruction,
                    replies::INSTRUCTION_UPDATED,
                )
                .await
            }
            Command::GetInstruction => match self.store.get(&scope.personal_key()).await {
                Ok(instruction) if instruction.is_empty() => replies::NO_INSTRUCTION.to_string(),
                Ok(instruction) => instruction,
                Err(err) => {
                    error!(
                        user_id = scope.user_id(),
                        group_id = scope.group_id(),
                        error = %err,
                        "failed to get instruction"
                    );
                    replies::FETCH_FAILED.to_string()
                }
            },
        };
        self.reply(message, &reply).await;
    }

    async fn save(&self, scope: &Scope, key: &ScopeKey, instruction: &str, confirmation: &str) -> String {
        match self.store.set(key, instruction).await {
            Ok(()) => {
                info!(
                    user_id = scope.user_id(),
                    group_id = scope.group_id(),
                    "instruction updated"
                );
                confirmation.to_string()
            }
            Err(err) => {
                error!(
                    user_id = scope.user_id(),
                    group_id = scope.group_id(),
                    error = %err,
                    "failed to set instruction"
                );
                replies::UPDATE_FAILED.to_string()
            }
        }
    }

    async fn effective_instruction(&self, scope: &Scope) -> Result<String, StoreError> {
        let personal = self.store.get(&scope.personal_key()).await?;
        if !personal.is_empty() {
            return Ok(personal);
        }
        match scope.fallback_key() {
            Some(key) => self.store.get(&key).await,
            None => Ok(personal),
        }
    }

    /// The provider call runs in its own task so losing the race against the
    /// timer never cancels it; a late result is dropped.
    async fn generate(&self, message: &TextMessage, deadline: Deadline) {
        let instruction = match self.effective_instruction(&message.scope).await {
            Ok(instruction) => instruction,
            Err(err) => {
                error!(
                    user_id = message.scope.user_id(),
                    group_id = message.scope.group_id(),
                    error = %err,
                    "failed to get instruction"
                );
                self.reply(message, replies::FETCH_FAILED).await;
                return;
            }
        };

        let provider = Arc::clone(&self.provider);
        let question = message.text.clone();
        let mut call = tokio::spawn(
            async move { provider.generate(&instruction, &question).await }.in_current_span(),
        );
        let budget = deadline.budget(self.settings.generation_margin);

        tokio::select! {
            biased;
            joined = &mut call => match joined {
                Ok(Ok(text)) if text.is_empty() => {
                    info!("empty generation; not replying");
                }
                Ok(Ok(text)) => {
                    debug!(chars = text.chars().count(), "generation finished");
                    self.reply(message, &text).await;
                }
                Ok(Err(err)) => {
                    error!(error = %err, "failed to generate response");
                    self.reply(message, replies::GENERATION_FAILED).await;
                }
                Err(err) => {
                    error!(error = %err, "generation task failed");
                    self.reply(message, replies::GENERATION_FAILED).await;
                }
            },
            _ = tokio::time::sleep(budget) => {
                warn!(budget_ms = budget.as_millis() as u64, "generation timed out");
                tokio::spawn(
                    async move {
                        if let Ok(Ok(text)) = call.await {
                            debug!(
                                chars = text.chars().count(),
                                "discarding generation that finished after the timeout"
                            );
                        }
                    }
                    .in_current_span(),
                );
                self.reply(message, replies::GENERATION_TIMEOUT).await;
            }
        }
    }

    async fn reply(&self, message: &TextMessage, text: &str) {
        if let Err(err) = self
            .gateway
            .reply(&message.reply_token, text, message.quote_token.as_deref())
            .await
        {
            warn!(
                user_id = message.scope.user_id(),
                error = %err,
                "failed to reply message"
            );
        }
    }
}
