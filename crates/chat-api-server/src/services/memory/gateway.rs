use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{ContextTemplate, MemoryBackend, MemoryError, MemoryUser, ThreadMessage, ZepClient};
use crate::config::MemoryConfig;
use crate::models::{ChatMessage, Role};

/// Shape of the memory block the service returns for a thread
pub const CONTEXT_TEMPLATE: &str = "\
# ABOUT THE USER

%{user_summary}

# PEOPLE, TRAITS AND PREFERENCES

%{entities types=[person,personality_trait,skill,hobby,goal,fact,preference,location,occupation,relationship] limit=20}

# TOPICS THEY CARE ABOUT

%{entities types=[topic,interest,technology,project] limit=15}

%{edges types=[emotion,feeling,mood] limit=0}

%{entities types=[emotion,feeling,mood] limit=0}

These are long-lived facts about the user, not their current mood.
";

const MEMORY_HEADER: &str = "# USER MEMORY (Persistent Preferences & Facts)";
const MEMORY_FOOTER: &str =
    "Use this memory to remember user preferences, facts, and context across conversations.";

/// One exchange to write back to the memory service
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub user_id: String,
    pub user_name: String,
    pub user_message: String,
    pub assistant_message: String,
    pub user_at: Option<DateTime<Utc>>,
    pub assistant_at: Option<DateTime<Utc>>,
}

/// Best-effort access to persistent user memory.
///
/// Nothing here returns an error: failures are logged and the chat
/// flow carries on without memory.
pub struct MemoryGateway {
    backend: Arc<dyn MemoryBackend>,
    config: MemoryConfig,
    template_ready: AtomicBool,
}

impl MemoryGateway {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: MemoryConfig) -> Self {
        Self { backend, config, template_ready: AtomicBool::new(false) }
    }

    /// `None` when memory is switched off or no API key is configured
    pub fn from_settings(config: &MemoryConfig) -> Result<Option<Self>, MemoryError> {
        if !config.enabled {
            info!("Memory service disabled");
            return Ok(None);
        }
        let Some(api_key) = config.resolved_api_key() else {
            warn!("Memory service enabled but no API key configured, continuing without memory");
            return Ok(None);
        };

        let client = ZepClient::new(
            &config.base_url,
            &api_key,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Some(Self::new(Arc::new(client), config.clone())))
    }

    /// One persistent thread per user
    pub fn thread_id(user_id: &str) -> String {
        format!("{}_thread", user_id)
    }

    /// Memory is never injected into the first turn of a conversation
    pub fn should_inject(prior_message_count: i64) -> bool {
        prior_message_count > 0
    }

    fn parse_name(name: &str) -> (String, Option<String>) {
        let mut parts = name.trim().splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or_default().to_string();
        let last = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        (first, last)
    }

    pub async fn ensure_user_exists(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        metadata: Option<Map<String, Value>>,
    ) -> bool {
        let (first_name, last_name) = Self::parse_name(name);
        let user = MemoryUser {
            user_id: user_id.to_string(),
            email: email.to_string(),
            first_name,
            last_name,
            metadata,
        };

        match self.backend.add_user(&user).await {
            Ok(()) => {
                info!("Registered user {} with memory service", user_id);
                true
            }
            Err(MemoryError::AlreadyExists(_)) => {
                debug!("User {} already known to memory service", user_id);
                true
            }
            Err(e) => {
                warn!("Could not register user {} with memory service: {}", user_id, e);
                false
            }
        }
    }

    /// Create or refresh the formatting template. Runs its checks once per process.
    pub async fn ensure_context_template(&self) {
        if self.template_ready.load(Ordering::Acquire) {
            return;
        }
        let template_id = self.config.template_id.as_str();

        match self.backend.get_template(template_id).await {
            Ok(existing) if existing.template == CONTEXT_TEMPLATE => {
                debug!("Context template {} is up to date", template_id);
                self.template_ready.store(true, Ordering::Release);
                return;
            }
            Ok(_) => {
                info!("Context template {} differs, replacing it", template_id);
                match self.backend.delete_template(template_id).await {
                    Ok(()) | Err(MemoryError::NotFound(_)) => {}
                    Err(e) => warn!("Could not delete context template {}: {}", template_id, e),
                }
            }
            Err(MemoryError::NotFound(_)) => debug!("Context template {} missing, creating", template_id),
            Err(e) => debug!("Could not check context template {}: {}", template_id, e),
        }

        let wanted = ContextTemplate {
            template_id: template_id.to_string(),
            template: CONTEXT_TEMPLATE.to_string(),
        };
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            match self.backend.create_template(&wanted).await {
                Ok(()) | Err(MemoryError::AlreadyExists(_)) => {
                    info!("Context template {} ready", template_id);
                    self.template_ready.store(true, Ordering::Release);
                    return;
                }
                Err(MemoryError::Unavailable(_)) if attempt < max_retries => {
                    let delay = Duration::from_millis(self.config.initial_retry_delay_ms) * 2u32.pow(attempt);
                    warn!(
                        "Memory service unavailable creating template, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt + 1,
                        max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    info!("Skipping context template setup after {} attempt(s): {}", attempt + 1, e);
                    return;
                }
            }
        }
    }

    /// Formatted memory for the user, `None` on any failure or when empty
    pub async fn get_user_context(&self, user_id: &str) -> Option<String> {
        let thread_id = Self::thread_id(user_id);
        match self.backend.get_context(&thread_id, &self.config.template_id).await {
            Ok(context) if !context.trim().is_empty() => Some(context),
            Ok(_) => None,
            Err(MemoryError::NotFound(_)) => {
                debug!("No memory thread yet for user {}", user_id);
                None
            }
            Err(e) => {
                warn!("Memory lookup failed for user {}: {}", user_id, e);
                None
            }
        }
    }

    /// System message carrying the memory block, `None` for blank context
    pub fn memory_message(&self, context: &str) -> Option<ChatMessage> {
        let context = context.trim();
        if context.is_empty() {
            return None;
        }
        let context = truncate_chars(context, self.config.max_context_chars);
        Some(ChatMessage::new(
            Role::System,
            format!("{}\n{}\n\n{}", MEMORY_HEADER, context, MEMORY_FOOTER),
        ))
    }

    /// Write both sides of a turn to the user's thread. Returns false on failure.
    pub async fn record_turn(&self, turn: TurnRecord) -> bool {
        let thread_id = Self::thread_id(&turn.user_id);

        match self.backend.create_thread(&thread_id, &turn.user_id).await {
            Ok(()) | Err(MemoryError::AlreadyExists(_)) => {}
            Err(MemoryError::NotFound(_)) => {
                warn!("User {} unknown to memory service, thread not created", turn.user_id)
            }
            Err(e) => warn!("Could not create memory thread {}: {}", thread_id, e),
        }

        let user_at = turn.user_at.unwrap_or_else(Utc::now);
        let assistant_at = turn.assistant_at.unwrap_or(user_at + ChronoDuration::seconds(1));
        let user_name = match turn.user_name.trim() {
            "" => "User".to_string(),
            name => name.to_string(),
        };

        let messages = [
            (Role::User, user_name, turn.user_message, user_at),
            (Role::Assistant, self.config.assistant_name.clone(), turn.assistant_message, assistant_at),
        ]
        .into_iter()
        .map(|(role, name, content, created_at)| ThreadMessage {
            name,
            role: role.to_string(),
            content: self.clip_message(&turn.user_id, content),
            created_at,
        })
        .collect::<Vec<_>>();

        for batch in messages.chunks(self.config.batch_size.max(1)) {
            if let Err(e) = self.backend.add_messages(&thread_id, batch).await {
                warn!("Failed to record turn for user {}: {}", turn.user_id, e);
                return false;
            }
        }

        debug!("Recorded {} messages to memory thread {}", messages.len(), thread_id);
        true
    }

    fn clip_message(&self, user_id: &str, content: String) -> String {
        let limit = self.config.message_max_chars;
        if content.chars().count() <= limit {
            return content;
        }
        warn!("Truncating memory message for user {} to {} chars", user_id, limit);
        truncate_chars(&content, limit)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::client::MockMemoryBackend;
    use chrono::TimeZone;

    fn config() -> MemoryConfig {
        MemoryConfig { enabled: true, api_key: "zk".into(), ..MemoryConfig::default() }
    }

    fn gateway(backend: MockMemoryBackend) -> MemoryGateway {
        MemoryGateway::new(Arc::new(backend), config())
    }

    #[test]
    fn test_injection_policy() {
        assert!(!MemoryGateway::should_inject(0));
        assert!(MemoryGateway::should_inject(1));
        assert!(MemoryGateway::should_inject(42));
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(MemoryGateway::parse_name("Ada"), ("Ada".to_string(), None));
        assert_eq!(
            MemoryGateway::parse_name("  Ada King Lovelace "),
            ("Ada".to_string(), Some("King Lovelace".to_string()))
        );
        assert_eq!(MemoryGateway::parse_name(""), (String::new(), None));
    }

    #[tokio::test]
    async fn test_existing_user_counts_as_success() {
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_add_user()
            .withf(|user| user.first_name == "Ada" && user.last_name.as_deref() == Some("Lovelace"))
            .returning(|_| Err(MemoryError::AlreadyExists("user exists".into())));

        assert!(gateway(backend).ensure_user_exists("u1", "ada@example.com", "Ada Lovelace", None).await);
    }

    #[tokio::test]
    async fn test_user_registration_failure_is_swallowed() {
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_add_user()
            .returning(|_| Err(MemoryError::Api { status: 500, body: "boom".into() }));

        assert!(!gateway(backend).ensure_user_exists("u1", "ada@example.com", "", None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_creation_retries_unavailable_then_sticks() {
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_get_template()
            .times(1)
            .returning(|id| Err(MemoryError::NotFound(id.to_string())));
        let mut seq = mockall::Sequence::new();
        backend
            .expect_create_template()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(MemoryError::Unavailable("503".into())));
        backend
            .expect_create_template()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|t| t.template == CONTEXT_TEMPLATE)
            .returning(|_| Ok(()));

        let gateway = gateway(backend);
        let started = tokio::time::Instant::now();
        gateway.ensure_context_template().await;

        // 500ms then 1000ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(1500));
        gateway.ensure_context_template().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_gives_up_after_bounded_retries() {
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_get_template()
            .returning(|id| Err(MemoryError::NotFound(id.to_string())));
        backend
            .expect_create_template()
            .times(3)
            .returning(|_| Err(MemoryError::Unavailable("503".into())));

        gateway(backend).ensure_context_template().await;
    }

    #[tokio::test]
    async fn test_stale_template_is_replaced() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_get_template().returning(|id| {
            Ok(ContextTemplate { template_id: id.to_string(), template: "old".into() })
        });
        backend.expect_delete_template().times(1).returning(|_| Ok(()));
        backend.expect_create_template().times(1).returning(|_| Ok(()));

        gateway(backend).ensure_context_template().await;
    }

    #[tokio::test]
    async fn test_current_template_is_left_alone() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_get_template().returning(|id| {
            Ok(ContextTemplate { template_id: id.to_string(), template: CONTEXT_TEMPLATE.into() })
        });
        backend.expect_delete_template().never();
        backend.expect_create_template().never();

        gateway(backend).ensure_context_template().await;
    }

    #[tokio::test]
    async fn test_context_lookup_never_fails() {
        let mut backend = MockMemoryBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_get_context()
            .withf(|thread, template| thread == "u1_thread" && template == "companion-agent-context")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("Enjoys chess".into()));
        backend
            .expect_get_context()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(MemoryError::NotFound("thread".into())));
        backend
            .expect_get_context()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(MemoryError::Unavailable("503".into())));
        backend
            .expect_get_context()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("   ".into()));

        let gateway = gateway(backend);
        assert_eq!(gateway.get_user_context("u1").await.as_deref(), Some("Enjoys chess"));
        assert_eq!(gateway.get_user_context("u1").await, None);
        assert_eq!(gateway.get_user_context("u1").await, None);
        assert_eq!(gateway.get_user_context("u1").await, None);
    }

    #[test]
    fn test_memory_message_wraps_and_caps_context() {
        let gateway = MemoryGateway::new(
            Arc::new(MockMemoryBackend::new()),
            MemoryConfig { max_context_chars: 5, ..config() },
        );

        let message = gateway.memory_message("abcdefghij").unwrap();
        assert_eq!(message.role, Role::System);
        assert!(message.content.starts_with("# USER MEMORY (Persistent Preferences & Facts)\nabcde\n\n"));
        assert!(!message.content.contains("abcdef"));
        assert!(gateway.memory_message("  \n ").is_none());
    }

    #[tokio::test]
    async fn test_record_turn_shapes_messages() {
        let user_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let long_reply = "x".repeat(3000);

        let mut backend = MockMemoryBackend::new();
        backend
            .expect_create_thread()
            .withf(|thread, user| thread == "u1_thread" && user == "u1")
            .returning(|_, _| Err(MemoryError::AlreadyExists("thread".into())));
        backend
            .expect_add_messages()
            .times(1)
            .withf(move |thread, batch| {
                thread == "u1_thread"
                    && batch.len() == 2
                    && batch[0].name == "User"
                    && batch[0].role == "user"
                    && batch[0].created_at == user_at
                    && batch[1].name == "Neo"
                    && batch[1].role == "assistant"
                    && batch[1].content.chars().count() == 2500
                    && batch[1].created_at == user_at + ChronoDuration::seconds(1)
            })
            .returning(|_, _| Ok(()));

        let recorded = gateway(backend)
            .record_turn(TurnRecord {
                user_id: "u1".into(),
                user_name: "  ".into(),
                user_message: "I like tea".into(),
                assistant_message: long_reply,
                user_at: Some(user_at),
                assistant_at: None,
            })
            .await;
        assert!(recorded);
    }

    #[tokio::test]
    async fn test_record_turn_reports_write_failure() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_create_thread().returning(|_, _| Ok(()));
        backend
            .expect_add_messages()
            .returning(|_, _| Err(MemoryError::Unavailable("503".into())));

        let recorded = gateway(backend)
            .record_turn(TurnRecord {
                user_id: "u1".into(),
                user_name: "Ada".into(),
                user_message: "hi".into(),
                assistant_message: "hello".into(),
                user_at: None,
                assistant_at: None,
            })
            .await;
        assert!(!recorded);
    }
}
