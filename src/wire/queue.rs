/// Identity and properties of a queue as both roles declare it.
///
/// Declaration is idempotent: declaring an existing queue with matching
/// properties is a no-op, while mismatched properties are a configuration
/// error that closes the declaring channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    /// Durable queues (and their persisted messages) survive broker restart.
    pub durable: bool,
}

impl QueueDescriptor {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
        }
    }

    /// Descriptor of the dead-letter sibling of this queue. It shares the
    /// durability of the primary queue.
    pub fn dead_letter(&self) -> Self {
        Self {
            name: dead_letter_queue(&self.name),
            durable: self.durable,
        }
    }
}

/// Conventional name for the dead-letter queue of `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}
