//! Durable conversation membership, owned by the persisted store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::protocol::Identity;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("participant store failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("participant lookup timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ParticipantResolver: Send + Sync {
    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<Identity>, ResolveError>;
}

/// Looks up `conversation_id`, giving up after `limit`.
pub async fn resolve_within(
    resolver: &dyn ParticipantResolver,
    conversation_id: &str,
    limit: Duration,
) -> Result<Vec<Identity>, ResolveError> {
    tokio::time::timeout(limit, resolver.list_participants(conversation_id))
        .await
        .map_err(|_| ResolveError::Timeout(limit))?
}

#[derive(Clone)]
pub struct SqliteParticipants {
    db_pool: SqlitePool,
}

impl SqliteParticipants {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                identity TEXT NOT NULL,
                PRIMARY KEY (conversation_id, identity)
            )
            "#,
        )
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    pub async fn add(&self, conversation_id: &str, identity: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO participants (conversation_id,identity) VALUES (?,?)")
            .bind(conversation_id)
            .bind(identity)
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ParticipantResolver for SqliteParticipants {
    async fn list_participants(&self, conversation_id: &str) -> Result<Vec<Identity>, ResolveError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT identity FROM participants WHERE conversation_id=? ORDER BY identity")
                .bind(conversation_id)
                .fetch_all(&self.db_pool)
                .await?;
        Ok(rows.into_iter().map(|(identity,)| identity).collect())
    }
}
