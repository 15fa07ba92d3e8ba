//! Contact book lookups for tag-filtered broadcasts.

use async_trait::async_trait;
use domain::models::RecipientSpec;
use domain::services::{normalize_unique, ContactResolver};
use domain::store::StoreError;
use domain::CoreError;
use sqlx::PgPool;
use uuid::Uuid;

use crate::metrics::QueryTimer;

#[derive(Clone)]
pub struct ContactRepository {
    pool: PgPool,
}

impl ContactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Phones of the user's contacts carrying any (or, with `match_all`,
    /// every) tag. An empty tag list matches the whole book.
    pub async fn find_phones_by_tags(
        &self,
        user_id: Uuid,
        tags: &[String],
        match_all: bool,
    ) -> Result<Vec<String>, sqlx::Error> {
        let timer = QueryTimer::new("find_contact_phones_by_tags");
        let result: Result<Vec<(String,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT phone
            FROM contacts
            WHERE user_id = $1
              AND (
                cardinality($2::TEXT[]) = 0
                OR ($3 AND tags @> $2::TEXT[])
                OR (NOT $3 AND tags && $2::TEXT[])
              )
            ORDER BY created_at ASC, phone ASC
            "#,
        )
        .bind(user_id)
        .bind(tags)
        .bind(match_all)
        .fetch_all(&self.pool)
        .await;
        timer.observe(&result);
        Ok(result?.into_iter().map(|p| p.0).collect())
    }
}

#[async_trait]
impl ContactResolver for ContactRepository {
    async fn resolve(&self, user_id: Uuid, spec: &RecipientSpec) -> Result<Vec<String>, CoreError> {
        match spec {
            RecipientSpec::List { recipients } => Ok(normalize_unique(recipients)),
            RecipientSpec::Filter { tags, match_all } => {
                let phones = self
                    .find_phones_by_tags(user_id, tags, *match_all)
                    .await
                    .map_err(StoreError::from)?;
                Ok(normalize_unique(phones))
            }
        }
    }
}
