//! Topic registry.
//!
//! The broker is the process-wide handle to the log transport: a registry of
//! topic logs shared by writers, the consumer pool, and version-topic
//! producers. Cloning the broker clones the handle, not the data.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lagoon_core::TopicName;
use tracing::debug;

use crate::error::{LogError, LogResult};
use crate::log::TopicLog;

/// Handle to the in-process log transport.
#[derive(Debug, Clone, Default)]
pub struct LogBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    topics: RwLock<HashMap<TopicName, Arc<TopicLog>>>,
}

impl LogBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic.
    ///
    /// # Errors
    /// Returns `TopicExists` if the name is taken.
    pub fn create_topic(&self, name: TopicName, partition_count: u32) -> LogResult<Arc<TopicLog>> {
        let mut topics = self.inner.topics.write().expect("broker poisoned");
        if topics.contains_key(&name) {
            return Err(LogError::TopicExists {
                name: name.as_str().to_string(),
            });
        }
        debug!(topic = %name, partitions = partition_count, "creating topic");
        let topic = Arc::new(TopicLog::new(name.clone(), partition_count));
        topics.insert(name, Arc::clone(&topic));
        Ok(topic)
    }

    /// Creates a topic if it does not exist yet and returns it.
    #[must_use]
    pub fn ensure_topic(&self, name: &TopicName, partition_count: u32) -> Arc<TopicLog> {
        if let Some(topic) = self.get(name) {
            return topic;
        }
        match self.create_topic(name.clone(), partition_count) {
            Ok(topic) => topic,
            // Lost the race; the other creator's topic wins.
            Err(_) => self.get(name).expect("topic must exist after race"),
        }
    }

    /// Returns a topic by name.
    #[must_use]
    pub fn get(&self, name: &TopicName) -> Option<Arc<TopicLog>> {
        self.inner
            .topics
            .read()
            .expect("broker poisoned")
            .get(name)
            .cloned()
    }

    /// Returns a topic by name, as a result.
    ///
    /// # Errors
    /// Returns `TopicNotFound` for an unknown name.
    pub fn require(&self, name: &TopicName) -> LogResult<Arc<TopicLog>> {
        self.get(name).ok_or_else(|| LogError::TopicNotFound {
            name: name.as_str().to_string(),
        })
    }

    /// Deletes a topic. No-op if absent.
    pub fn delete_topic(&self, name: &TopicName) {
        let removed = self
            .inner
            .topics
            .write()
            .expect("broker poisoned")
            .remove(name);
        if removed.is_some() {
            debug!(topic = %name, "deleted topic");
        }
    }

    /// Returns the names of all topics.
    #[must_use]
    pub fn topic_names(&self) -> Vec<TopicName> {
        self.inner
            .topics
            .read()
            .expect("broker poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
