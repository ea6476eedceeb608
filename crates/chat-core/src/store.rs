use thiserror::Error;

use crate::types::{
    ConfirmedSend, DeliveryState, MessageRecord, StateChange, TimelineWindow,
};

/// Errors that can occur while inserting optimistic records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record was submitted without a provisional id.
    #[error("optimistic record is missing a provisional id")]
    MissingProvisionalId,
    /// Another pending record already carries the same provisional id.
    #[error("provisional id '{0}' is already pending")]
    DuplicateProvisionalId(String),
}

/// In-memory ordered, deduplicated message sequence for one conversation.
///
/// Records are kept sorted by `(created_at_ms, seq)`; the insertion sequence
/// counter is monotonic and survives [`TimelineStore::reset`] so sequence
/// numbers are never reused.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    conversation_id: String,
    records: Vec<MessageRecord>,
    next_seq: u64,
    window: TimelineWindow,
}

impl TimelineStore {
    /// Create an empty store for one conversation.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            records: Vec::new(),
            next_seq: 0,
            window: TimelineWindow::default(),
        }
    }

    /// Owning conversation id.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Discard all records and cursors and switch to another conversation.
    pub fn reset(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = conversation_id.into();
        self.records.clear();
        self.window = TimelineWindow::default();
    }

    /// All records in display order.
    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    /// Number of records currently loaded.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current pagination window.
    pub fn window(&self) -> &TimelineWindow {
        &self.window
    }

    /// Update the older edge of the window after a pagination fetch.
    pub fn set_older_edge(&mut self, cursor: Option<String>, has_more: bool) {
        self.window.oldest_cursor = cursor;
        self.window.has_more_older = has_more;
    }

    /// Update the newer edge of the window after a pagination fetch.
    pub fn set_newer_edge(&mut self, cursor: Option<String>, has_more: bool) {
        self.window.newest_cursor = cursor;
        self.window.has_more_newer = has_more;
    }

    /// Append a new optimistic record.
    ///
    /// Requires `provisional_id` to be set and unique among currently
    /// pending records. Forces `delivery_state = Pending` and assigns the
    /// next insertion sequence number.
    pub fn insert_optimistic(&mut self, mut record: MessageRecord) -> Result<(), StoreError> {
        let Some(provisional_id) = record.provisional_id.clone() else {
            return Err(StoreError::MissingProvisionalId);
        };

        if self
            .records
            .iter()
            .any(|existing| {
                existing.is_pending()
                    && existing.provisional_id.as_deref() == Some(provisional_id.as_str())
            })
        {
            return Err(StoreError::DuplicateProvisionalId(provisional_id));
        }

        record.delivery_state = DeliveryState::Pending;
        self.insert_sorted(record);
        Ok(())
    }

    /// Insert a server-confirmed record in sorted position.
    ///
    /// Assigns the next sequence number; a `Pending` incoming state is
    /// lifted to `Sent` since the record already exists on the server.
    pub fn insert_confirmed(&mut self, mut record: MessageRecord) {
        if record.delivery_state == DeliveryState::Pending {
            record.delivery_state = DeliveryState::Sent;
        }
        self.insert_sorted(record);
    }

    /// Promote the pending record with `provisional_id` to its confirmed identity.
    ///
    /// Replaces `id`, `created_at_ms` and server-confirmed attachments while
    /// preserving `provisional_id`, then advances the state to `Sent` and
    /// recomputes the record's sorted position. A missing pending record is
    /// a silent no-op: the record may already have been promoted or removed
    /// by the racing remote-echo path.
    pub fn promote(&mut self, provisional_id: &str, confirmed: &ConfirmedSend) -> bool {
        let Some(index) = self.records.iter().position(|record| {
            record.is_pending() && record.provisional_id.as_deref() == Some(provisional_id)
        }) else {
            return false;
        };

        let record = &mut self.records[index];
        record.id = confirmed.id.clone();
        record.created_at_ms = confirmed.created_at_ms;
        if let Some(attachments) = &confirmed.attachments {
            record.attachments = attachments.clone();
        }
        record.delivery_state.advance(DeliveryState::Sent);
        self.reposition(index);
        true
    }

    /// Apply a monotonic state transition to the record with `id`.
    ///
    /// A missing record is a no-op (`false`), tolerating out-of-order or
    /// late events. Repeating a change leaves the store unchanged.
    pub fn apply_state_change(&mut self, id: &str, change: &StateChange) -> bool {
        let Some(index) = self.records.iter().position(|record| record.id == id) else {
            return false;
        };

        let record = &mut self.records[index];
        match change {
            StateChange::Delivered { user_ids } => {
                record
                    .delivered_to
                    .extend(user_ids.iter().cloned());
                record.delivery_state.advance(DeliveryState::Delivered);
            }
            StateChange::Read { user_ids } => {
                record.read_by.extend(user_ids.iter().cloned());
                record.delivery_state.advance(DeliveryState::Read);
            }
            StateChange::Recall => record.recalled = true,
            StateChange::Pin => record.pinned = true,
            StateChange::Unpin => record.pinned = false,
            StateChange::HideFrom { user_id } => {
                record.hidden_from.insert(user_id.clone());
            }
            StateChange::Delete => {
                self.records.remove(index);
            }
        }
        true
    }

    /// Restartable ordered iterator over the records visible to `viewer_id`.
    ///
    /// Each call produces a fresh sequence reflecting current state.
    pub fn query<'a>(
        &'a self,
        viewer_id: &'a str,
    ) -> impl Iterator<Item = &'a MessageRecord> + 'a {
        self.records
            .iter()
            .filter(move |record| record.visible_to(viewer_id))
    }

    /// Look up a record by its current id.
    pub fn get(&self, id: &str) -> Option<&MessageRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Look up a record by the provisional id it was born with.
    pub fn get_by_provisional(&self, provisional_id: &str) -> Option<&MessageRecord> {
        self.records
            .iter()
            .find(|record| record.provisional_id.as_deref() == Some(provisional_id))
    }

    /// Mark the pending record with `provisional_id` as failed.
    ///
    /// The record stays in the timeline with its original content so the
    /// user can retry or discard it.
    pub fn mark_failed(&mut self, provisional_id: &str) -> bool {
        let Some(record) = self.records.iter_mut().find(|record| {
            record.is_pending() && record.provisional_id.as_deref() == Some(provisional_id)
        }) else {
            return false;
        };
        record.delivery_state.advance(DeliveryState::Failed)
    }

    pub(crate) fn records_mut(&mut self) -> &mut Vec<MessageRecord> {
        &mut self.records
    }

    pub(crate) fn remove_by_index(&mut self, index: usize) -> MessageRecord {
        self.records.remove(index)
    }

    pub(crate) fn reposition(&mut self, index: usize) {
        let record = self.records.remove(index);
        let position = self.sorted_position(record.created_at_ms, record.seq);
        self.records.insert(position, record);
    }

    pub(crate) fn insert_sorted(&mut self, mut record: MessageRecord) {
        record.seq = self.next_seq;
        self.next_seq += 1;
        let position = self.sorted_position(record.created_at_ms, record.seq);
        self.records.insert(position, record);
    }

    fn sorted_position(&self, created_at_ms: u64, seq: u64) -> usize {
        self.records
            .partition_point(|record| (record.created_at_ms, record.seq) <= (created_at_ms, seq))
    }
}
