//! QueueRegistry: named queues owned by one process.
//!
//! Queues are registered once under their name and closed together at
//! shutdown. Lookups hand out `Arc<Queue>` so producers can hold a queue
//! without holding the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::queue::Queue;
use crate::domain::{QueueError, RegistryError};

#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, Arc<Queue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `queue` under its own name.
    pub fn register(&mut self, queue: Queue) -> Result<Arc<Queue>, RegistryError> {
        let name = queue.name().to_string();
        if self.queues.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let queue = Arc::new(queue);
        self.queues.insert(name, Arc::clone(&queue));
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Close every queue, one after another. Returns the failures by name;
    /// a failing queue does not stop the others from closing.
    pub async fn close_all(&self) -> Vec<(String, QueueError)> {
        let mut failures = Vec::new();
        for (name, queue) in &self.queues {
            if let Err(err) = queue.close().await {
                failures.push((name.clone(), err));
            }
        }
        info!(queues = self.queues.len(), failed = failures.len(), "registry closed");
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::QueueBuilder;

    fn queue(name: &str) -> Queue {
        QueueBuilder::new(name).handler_fn(|| async {}).build().unwrap()
    }

    #[tokio::test]
    async fn register_and_get() {
        let mut registry = QueueRegistry::new();
        registry.register(queue("emails")).unwrap();
        registry.register(queue("reports")).unwrap();

        assert_eq!(registry.get("emails").unwrap().name(), "emails");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["emails".to_string(), "reports".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let mut registry = QueueRegistry::new();
        registry.register(queue("emails")).unwrap();
        let err = registry.register(queue("emails")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("emails".into()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn close_all_closes_every_queue() {
        let mut registry = QueueRegistry::new();
        let a = registry.register(queue("a")).unwrap();
        let b = registry.register(queue("b")).unwrap();

        assert!(registry.close_all().await.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
