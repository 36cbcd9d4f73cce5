use std::collections::BTreeSet;

use shared::domain::MessageId;

use crate::error::ValidationError;

/// Multi-select mode for batch deletion. The selected set is empty exactly
/// when the mode is inactive.
#[derive(Debug, Default)]
pub struct SelectionCoordinator {
    selected: BTreeSet<MessageId>,
    deleting: bool,
}

impl SelectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.selected.is_empty()
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub fn selected(&self) -> impl Iterator<Item = &MessageId> {
        self.selected.iter()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Starts a fresh selection holding only the message the gesture started
    /// on. Ignored while a delete request is outstanding.
    pub fn enter(&mut self, initial: MessageId) -> bool {
        if self.deleting {
            return false;
        }
        self.selected.clear();
        self.selected.insert(initial);
        true
    }

    /// Flips membership of one message. Toggling the last selected message
    /// off leaves selection mode.
    pub fn toggle(&mut self, id: MessageId) -> bool {
        if !self.selected.remove(&id) {
            self.selected.insert(id);
            return true;
        }
        !self.selected.is_empty()
    }

    pub fn exit(&mut self) {
        self.selected.clear();
        self.deleting = false;
    }

    /// Claims the current selection for a delete request.
    pub fn delete_request(&mut self) -> Result<Vec<MessageId>, ValidationError> {
        if self.deleting {
            return Err(ValidationError::DeleteInProgress);
        }
        if self.selected.is_empty() {
            return Err(ValidationError::EmptySelection);
        }
        self.deleting = true;
        Ok(self.selected.iter().cloned().collect())
    }

    pub fn on_delete_succeeded(&mut self) {
        self.exit();
    }

    /// The selection stays intact so the user can retry.
    pub fn on_delete_failed(&mut self) {
        self.deleting = false;
    }
}
