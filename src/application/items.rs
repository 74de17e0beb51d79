//! In-memory `items` collection behind `/items` and the query endpoint.
//!
//! Every successful mutation calls the cache hook once per dependent topic.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::cache::CacheTrigger;

pub const ITEMS_TOPIC: &str = "items";

const MAX_NAME_LEN: usize = 200;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
    pub tags: Vec<String>,
    pub revision: u64,
    #[serde(skip)]
    position: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateItemCommand {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateItemCommand {
    pub name: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSort {
    #[default]
    Created,
    Name,
}

/// Filter shared by `GET /items` (query string) and `POST /query` (body).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemFilter {
    pub search: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub sort: ItemSort,
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item `{0}` not found")]
    NotFound(Uuid),
    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Clone, Default)]
pub struct ItemService {
    items: Arc<DashMap<Uuid, Item>>,
    sequence: Arc<AtomicU64>,
    cache_trigger: Option<CacheTrigger>,
    topics: Vec<String>,
}

impl ItemService {
    pub fn new() -> Self {
        Self {
            topics: vec![ITEMS_TOPIC.to_string()],
            ..Self::default()
        }
    }

    pub fn with_cache_trigger(mut self, trigger: CacheTrigger) -> Self {
        self.cache_trigger = Some(trigger);
        self
    }

    /// Another topic whose responses are derived from items.
    pub fn with_dependent_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }

    pub fn list(&self, filter: &ItemFilter) -> Vec<Item> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut items: Vec<Item> = self
            .items
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|item| {
                filter
                    .tag
                    .as_deref()
                    .is_none_or(|tag| item.tags.iter().any(|t| t == tag))
            })
            .filter(|item| {
                search
                    .as_deref()
                    .is_none_or(|needle| item.name.to_lowercase().contains(needle))
            })
            .collect();

        match filter.sort {
            ItemSort::Created => items.sort_by_key(|item| item.position),
            ItemSort::Name => {
                items.sort_by(|a, b| a.name.cmp(&b.name).then(a.position.cmp(&b.position)))
            }
        }

        items.truncate(filter.limit.unwrap_or(MAX_LIMIT).min(MAX_LIMIT));
        items
    }

    pub fn get(&self, id: Uuid) -> Result<Item, ItemError> {
        self.items
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ItemError::NotFound(id))
    }

    #[instrument(skip(self, command))]
    pub async fn create(&self, command: CreateItemCommand) -> Result<Item, ItemError> {
        let item = Item {
            id: Uuid::new_v4(),
            name: validate_name(&command.name)?,
            tags: normalize_tags(command.tags),
            revision: 1,
            position: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.items.insert(item.id, item.clone());
        self.notify().await;
        Ok(item)
    }

    #[instrument(skip(self, command))]
    pub async fn update(&self, id: Uuid, command: UpdateItemCommand) -> Result<Item, ItemError> {
        let name = command.name.as_deref().map(validate_name).transpose()?;
        let updated = {
            let mut entry = self.items.get_mut(&id).ok_or(ItemError::NotFound(id))?;
            if let Some(name) = name {
                entry.name = name;
            }
            if let Some(tags) = command.tags {
                entry.tags = normalize_tags(tags);
            }
            entry.revision += 1;
            entry.clone()
        };
        self.notify().await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ItemError> {
        self.items.remove(&id).ok_or(ItemError::NotFound(id))?;
        self.notify().await;
        Ok(())
    }

    async fn notify(&self) {
        if let Some(trigger) = &self.cache_trigger {
            for topic in &self.topics {
                trigger.notify_mutated(topic).await;
            }
        }
    }
}

fn validate_name(name: &str) -> Result<String, ItemError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ItemError::Invalid("name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ItemError::Invalid("name must be at most 200 characters"));
    }
    Ok(name.to_string())
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}
