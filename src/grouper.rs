use std::collections::HashMap;

use crate::config::{ConfigError, MAX_REMOTE_BATCH_SIZE};
use crate::event::TagRead;
use crate::model::{CorrelationKey, Destination, ItemId};

/// A decoded queue item, ready to be uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryItem {
    pub id: ItemId,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub correlation_key: CorrelationKey,
    pub destination: Destination,
    pub event: TagRead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryChunk {
    pub destination: Destination,
    pub correlation_key: CorrelationKey,
    pub items: Vec<DeliveryItem>,
}

impl DeliveryChunk {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.id).collect()
    }

    pub fn events(&self) -> Vec<TagRead> {
        self.items.iter().map(|item| item.event.clone()).collect()
    }
}

/// Splits ready items into chunks of one (destination, correlation key) pair
/// and at most `max_batch_size` items. FIFO order holds within a group, and
/// groups are emitted in order of their oldest item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryGrouper {
    max_batch_size: usize,
}

impl DeliveryGrouper {
    pub fn new(max_batch_size: usize) -> Result<Self, ConfigError> {
        if max_batch_size == 0 || max_batch_size > MAX_REMOTE_BATCH_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_batch_size must be between 1 and {MAX_REMOTE_BATCH_SIZE}"
            )));
        }
        Ok(Self { max_batch_size })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn group(&self, items: Vec<DeliveryItem>) -> Vec<DeliveryChunk> {
        let mut groups: Vec<(Destination, CorrelationKey, Vec<DeliveryItem>)> = Vec::new();
        let mut index: HashMap<(Destination, CorrelationKey), usize> = HashMap::new();

        for item in items {
            let key = (item.destination.clone(), item.correlation_key.clone());
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((
                    item.destination.clone(),
                    item.correlation_key.clone(),
                    Vec::new(),
                ));
                groups.len() - 1
            });
            groups[slot].2.push(item);
        }

        let mut chunks = Vec::new();
        for (destination, correlation_key, mut members) in groups {
            while !members.is_empty() {
                let rest = members.split_off(members.len().min(self.max_batch_size));
                chunks.push(DeliveryChunk {
                    destination: destination.clone(),
                    correlation_key: correlation_key.clone(),
                    items: members,
                });
                members = rest;
            }
        }
        chunks
    }
}
