use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS chat_conversations (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        last_activity TIMESTAMPTZ NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        name TEXT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_chat_conversations_user_activity
        ON chat_conversations (user_id, last_activity DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS chat_messages (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL REFERENCES chat_conversations(id) ON DELETE CASCADE,
        sender_role TEXT NOT NULL,
        content TEXT NOT NULL,
        message_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation_created
        ON chat_messages (conversation_id, created_at)"#,
];

/// Create the chat tables if they are missing
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("✅ Chat schema verified");
    Ok(())
}
