//! Explicit list of consumers a host runs.

use crate::consumer::Consumer;
use crate::errors::RegistryError;
use readmodel_types::ConsumerName;
use std::collections::BTreeSet;

/// The consumers to run over one event stream.
///
/// Checkpoints are keyed by consumer name, so registering two consumers with
/// the same name is rejected.
pub struct ConsumerRegistry<E> {
    consumers: Vec<Box<dyn Consumer<E>>>,
    names: BTreeSet<ConsumerName>,
}

impl<E> ConsumerRegistry<E>
where
    E: Send + Sync + 'static,
{
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
            names: BTreeSet::new(),
        }
    }

    /// Add a consumer.
    pub fn register<C>(mut self, consumer: C) -> Result<Self, RegistryError>
    where
        C: Consumer<E> + 'static,
    {
        let name = consumer.name().clone();
        if !self.names.insert(name.clone()) {
            return Err(RegistryError::DuplicateConsumer(name));
        }
        self.consumers.push(Box::new(consumer));
        Ok(self)
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<ConsumerName> {
        self.consumers.iter().map(|c| c.name().clone()).collect()
    }

    /// Number of registered consumers.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Consumers in registration order.
    pub fn into_consumers(self) -> Vec<Box<dyn Consumer<E>>> {
        self.consumers
    }
}

impl<E> Default for ConsumerRegistry<E>
where
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for ConsumerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("names", &self.names)
            .finish()
    }
}
