use std::collections::HashSet;

use shared::{domain::MessageId, protocol::InboundMessage};

/// Ids of every message already handed to the renderer for this conversation.
#[derive(Debug, Default)]
pub struct MessageDeduper {
    rendered: HashSet<MessageId>,
}

impl MessageDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the message id and returns `true` only on its first sighting.
    pub fn should_render(&mut self, message: &InboundMessage) -> bool {
        self.rendered.insert(message.id.clone())
    }

    pub fn has_rendered(&self, id: &MessageId) -> bool {
        self.rendered.contains(id)
    }

    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }
}
