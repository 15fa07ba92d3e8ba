//! Recipient resolution.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::RecipientSpec;
use shared::validation::normalize_recipient;

/// Turns a recipient spec into concrete, normalized addresses.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn resolve(&self, user_id: Uuid, spec: &RecipientSpec) -> Result<Vec<String>, CoreError>;
}

/// Normalizes addresses, dropping invalid ones and duplicates while
/// keeping first-seen order.
pub fn normalize_unique<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|r| normalize_recipient(r.as_ref()))
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

#[derive(Debug, Clone)]
struct StaticContact {
    phone: String,
    tags: Vec<String>,
}

/// Resolver over an in-memory contact book.
#[derive(Debug, Default)]
pub struct StaticContactResolver {
    contacts: RwLock<HashMap<Uuid, Vec<StaticContact>>>,
}

impl StaticContactResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_contact(&self, user_id: Uuid, phone: impl Into<String>, tags: &[&str]) {
        if let Ok(mut contacts) = self.contacts.write() {
            contacts.entry(user_id).or_default().push(StaticContact {
                phone: phone.into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            });
        }
    }
}

#[async_trait]
impl ContactResolver for StaticContactResolver {
    async fn resolve(&self, user_id: Uuid, spec: &RecipientSpec) -> Result<Vec<String>, CoreError> {
        match spec {
            RecipientSpec::List { recipients } => Ok(normalize_unique(recipients)),
            RecipientSpec::Filter { tags, match_all } => {
                let contacts = self
                    .contacts
                    .read()
                    .map_err(|_| CoreError::Upstream("contact book unavailable".to_string()))?;
                let Some(book) = contacts.get(&user_id) else {
                    return Ok(Vec::new());
                };

                let matches = book.iter().filter(|c| {
                    if tags.is_empty() {
                        true
                    } else if *match_all {
                        tags.iter().all(|t| c.tags.contains(t))
                    } else {
                        tags.iter().any(|t| c.tags.contains(t))
                    }
                });
                Ok(normalize_unique(matches.map(|c| c.phone.as_str())))
            }
        }
    }
}
