use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    store::{StoreError, TimelineStore},
    types::{
        Attachment, ConfirmedSend, DeliveryState, MessageKind, MessageRecord, ReconcilerConfig,
        RemoteEvent, ReplySnapshot, StateChange, TimelineWindow,
    },
};

/// How an incoming remote record was resolved against the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Genuinely new message, inserted in sorted position.
    Inserted,
    /// Duplicate delivery of a known record; monotonic fields merged.
    MergedDuplicate,
    /// Confirmation of an optimistic record; promoted in place.
    PromotedOptimistic,
    /// Fingerprint tie-break removed the existing record in favor of the
    /// incoming one.
    ReplacedByFingerprint,
}

/// Derived correlation key for records lacking a shared id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint<'a> {
    sender_id: &'a str,
    kind: MessageKind,
    key: &'a str,
}

fn fingerprint(record: &MessageRecord) -> Option<Fingerprint<'_>> {
    if record.kind.fingerprints_by_content() {
        Some(Fingerprint {
            sender_id: &record.sender_id,
            kind: record.kind,
            key: &record.content,
        })
    } else {
        record.attachment().map(|attachment| Fingerprint {
            sender_id: &record.sender_id,
            kind: record.kind,
            key: &attachment.url,
        })
    }
}

/// Merges local intents, server confirmations and remote events into one
/// causally consistent, time-ordered conversation view.
///
/// Owns its [`TimelineStore`] exclusively; all mutation goes through the
/// reconciler. Merge ambiguity is a normal operating condition resolved
/// deterministically, never an error: whichever of the API-response and
/// remote-echo paths arrives first, the final state is the same.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: TimelineStore,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler for one conversation.
    pub fn new(conversation_id: impl Into<String>, config: ReconcilerConfig) -> Self {
        Self {
            store: TimelineStore::new(conversation_id),
            config,
        }
    }

    /// Owning conversation id.
    pub fn conversation_id(&self) -> &str {
        self.store.conversation_id()
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &TimelineStore {
        &self.store
    }

    /// Current pagination window.
    pub fn window(&self) -> &TimelineWindow {
        self.store.window()
    }

    /// Restartable ordered iterator over records visible to `viewer_id`.
    pub fn query<'a>(
        &'a self,
        viewer_id: &'a str,
    ) -> impl Iterator<Item = &'a MessageRecord> + 'a {
        self.store.query(viewer_id)
    }

    /// Discard all state and switch to another conversation.
    pub fn reset(&mut self, conversation_id: impl Into<String>) {
        self.store.reset(conversation_id);
    }

    /// Create and insert an optimistic record for a local send intent.
    ///
    /// Generates a `local-...` provisional id and, for replies, snapshots
    /// the replied-to message while it is still loaded. Returns the
    /// provisional id used to correlate the eventual confirmation.
    #[allow(clippy::too_many_arguments)]
    pub fn create_optimistic(
        &mut self,
        now_ms: u64,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
        reply_to_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let provisional_id = format!("local-{}", Uuid::new_v4());
        let reply_snapshot = reply_to_id
            .and_then(|id| self.store.get(id))
            .map(|original| ReplySnapshot {
                sender_id: original.sender_id.clone(),
                content: original.content.clone(),
                kind: original.kind,
            });

        let record = MessageRecord {
            id: provisional_id.clone(),
            provisional_id: Some(provisional_id.clone()),
            conversation_id: self.store.conversation_id().to_owned(),
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            kind,
            attachments,
            created_at_ms: now_ms,
            seq: 0,
            delivery_state: DeliveryState::Pending,
            recalled: false,
            pinned: false,
            hidden_from: Default::default(),
            delivered_to: Default::default(),
            read_by: Default::default(),
            reply_to_id: reply_to_id.map(str::to_owned),
            reply_snapshot,
        };

        self.store.insert_optimistic(record)?;
        trace!(provisional_id = %provisional_id, "optimistic record inserted");
        Ok(provisional_id)
    }

    /// Promote an optimistic record after a successful API send.
    ///
    /// No-op when the record was already promoted by the racing remote-echo
    /// path or removed in the meantime.
    pub fn confirm_send(&mut self, provisional_id: &str, confirmed: &ConfirmedSend) -> bool {
        let promoted = self.store.promote(provisional_id, confirmed);
        debug!(
            provisional_id = %provisional_id,
            message_id = %confirmed.id,
            promoted,
            "send confirmed"
        );
        promoted
    }

    /// Mark an optimistic record as failed after a rejected API send.
    pub fn fail_send(&mut self, provisional_id: &str) -> bool {
        let failed = self.store.mark_failed(provisional_id);
        debug!(provisional_id = %provisional_id, failed, "send failed");
        failed
    }

    /// Merge one incoming remote record into the timeline.
    ///
    /// Layered matching, first match wins:
    /// 1. exact id -> duplicate, merge monotonic fields only;
    /// 2. optimistic echo (carried provisional id, or equal sender/content/
    ///    kind within the echo window) -> promote the pending record;
    /// 3. content fingerprint within the fingerprint window -> keep the
    ///    record with the most-progressed delivery state, later timestamp on
    ///    ties, and drop the other;
    /// 4. no match -> insert as a confirmed record in sorted position.
    pub fn upsert_from_remote(&mut self, incoming: MessageRecord) -> MergeOutcome {
        // Rule 1: exact id.
        if let Some(index) = self
            .store
            .records()
            .iter()
            .position(|record| record.id == incoming.id)
        {
            self.merge_monotonic(index, &incoming);
            trace!(message_id = %incoming.id, "remote duplicate merged by id");
            return MergeOutcome::MergedDuplicate;
        }

        // Rule 2a: the echo carries the provisional id of the submission.
        if let Some(provisional_id) = incoming.provisional_id.clone()
            && let Some(index) = self
                .store
                .records()
                .iter()
                .position(|record| record.provisional_id.as_deref() == Some(provisional_id.as_str()))
        {
            return self.resolve_echo(index, &provisional_id, incoming);
        }

        // Rule 2b: pending record with identical sender/content/kind close in time.
        if let Some((index, provisional_id)) = self.find_pending_echo(&incoming) {
            return self.resolve_echo(index, &provisional_id, incoming);
        }

        // Rule 3: content fingerprint fallback.
        if let Some(index) = self.find_fingerprint_match(&incoming) {
            return self.resolve_fingerprint(index, incoming);
        }

        // Rule 4: genuinely new.
        trace!(message_id = %incoming.id, "remote record inserted");
        self.store.insert_confirmed(incoming);
        MergeOutcome::Inserted
    }

    /// Apply a non-typing remote event to the timeline.
    ///
    /// Returns whether any record changed. Typing events are presence state
    /// and are handled outside the timeline.
    pub fn apply_remote(&mut self, event: RemoteEvent) -> bool {
        match event {
            RemoteEvent::NewMessage(record) => {
                self.upsert_from_remote(record);
                true
            }
            RemoteEvent::Delivered {
                message_ids,
                user_id,
            } => self.apply_receipts(&message_ids, StateChange::Delivered {
                user_ids: vec![user_id],
            }),
            RemoteEvent::Read {
                message_ids,
                user_id,
            } => self.apply_receipts(&message_ids, StateChange::Read {
                user_ids: vec![user_id],
            }),
            RemoteEvent::Recalled { message_id } => {
                self.store.apply_state_change(&message_id, &StateChange::Recall)
            }
            RemoteEvent::Deleted { message_id, user_id } => self
                .store
                .apply_state_change(&message_id, &StateChange::HideFrom { user_id }),
            RemoteEvent::Typing { .. } => false,
        }
    }

    /// Apply a state change to one record by id.
    pub fn apply_state_change(&mut self, id: &str, change: &StateChange) -> bool {
        self.store.apply_state_change(id, change)
    }

    /// Merge an older-history page into the timeline.
    ///
    /// Records already present (pushed earlier over the realtime channel)
    /// are matched by the same id + fingerprint procedure and not inserted
    /// twice. Returns the number of genuinely new records.
    pub fn extend_older(
        &mut self,
        records: Vec<MessageRecord>,
        next_cursor: Option<String>,
        has_more: bool,
    ) -> usize {
        let inserted = self.merge_page(records);
        self.store.set_older_edge(next_cursor, has_more);
        debug!(inserted, has_more, "older window extended");
        inserted
    }

    /// Merge a newer-history page into the timeline; symmetric to
    /// [`Reconciler::extend_older`].
    pub fn extend_newer(
        &mut self,
        records: Vec<MessageRecord>,
        next_cursor: Option<String>,
        has_more: bool,
    ) -> usize {
        let inserted = self.merge_page(records);
        self.store.set_newer_edge(next_cursor, has_more);
        debug!(inserted, has_more, "newer window extended");
        inserted
    }

    fn merge_page(&mut self, records: Vec<MessageRecord>) -> usize {
        records
            .into_iter()
            .filter(|record| {
                matches!(
                    self.upsert_from_remote(record.clone()),
                    MergeOutcome::Inserted
                )
            })
            .count()
    }

    fn apply_receipts(&mut self, message_ids: &[String], change: StateChange) -> bool {
        let mut changed = false;
        for message_id in message_ids {
            changed |= self.store.apply_state_change(message_id, &change);
        }
        changed
    }

    fn find_pending_echo(&self, incoming: &MessageRecord) -> Option<(usize, String)> {
        self.store.records().iter().enumerate().find_map(|(index, record)| {
            let in_window =
                record.created_at_ms.abs_diff(incoming.created_at_ms) < self.config.echo_window_ms;
            if record.is_pending()
                && record.sender_id == incoming.sender_id
                && record.content == incoming.content
                && record.kind == incoming.kind
                && in_window
            {
                record
                    .provisional_id
                    .clone()
                    .map(|provisional_id| (index, provisional_id))
            } else {
                None
            }
        })
    }

    fn resolve_echo(
        &mut self,
        index: usize,
        provisional_id: &str,
        incoming: MessageRecord,
    ) -> MergeOutcome {
        let was_pending = self.store.records()[index].is_pending();
        if was_pending {
            self.store.promote(
                provisional_id,
                &ConfirmedSend {
                    id: incoming.id.clone(),
                    created_at_ms: incoming.created_at_ms,
                    attachments: Some(incoming.attachments.clone()),
                },
            );
        }

        // Promotion resorts the buffer; locate the record again before
        // folding in whatever receipts the echo already carries.
        if let Some(index) = self
            .store
            .records()
            .iter()
            .position(|record| record.provisional_id.as_deref() == Some(provisional_id))
        {
            self.merge_monotonic(index, &incoming);
        }

        if was_pending {
            debug!(
                provisional_id = %provisional_id,
                message_id = %incoming.id,
                "optimistic record promoted by remote echo"
            );
            MergeOutcome::PromotedOptimistic
        } else {
            trace!(message_id = %incoming.id, "late echo merged into promoted record");
            MergeOutcome::MergedDuplicate
        }
    }

    fn find_fingerprint_match(&self, incoming: &MessageRecord) -> Option<usize> {
        let incoming_fp = fingerprint(incoming)?;
        self.store.records().iter().position(|record| {
            fingerprint(record).as_ref() == Some(&incoming_fp)
                && record.created_at_ms.abs_diff(incoming.created_at_ms)
                    < self.config.fingerprint_window_ms
        })
    }

    fn resolve_fingerprint(&mut self, index: usize, mut incoming: MessageRecord) -> MergeOutcome {
        let existing = &self.store.records()[index];
        let incoming_wins = match incoming
            .delivery_state
            .priority()
            .cmp(&existing.delivery_state.priority())
        {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => incoming.created_at_ms >= existing.created_at_ms,
        };

        if incoming_wins {
            let removed = self.store.remove_by_index(index);
            // Carry over what the losing record knew: receipts, flags and
            // the provisional lineage of an optimistic submission.
            incoming.delivered_to.extend(removed.delivered_to);
            incoming.read_by.extend(removed.read_by);
            incoming.hidden_from.extend(removed.hidden_from);
            incoming.recalled |= removed.recalled;
            incoming.delivery_state.advance(removed.delivery_state);
            if incoming.provisional_id.is_none() {
                incoming.provisional_id = removed.provisional_id;
            }
            if incoming.reply_snapshot.is_none() {
                incoming.reply_snapshot = removed.reply_snapshot;
                incoming.reply_to_id = incoming.reply_to_id.or(removed.reply_to_id);
            }
            debug!(
                winner = %incoming.id,
                loser = %removed.id,
                "fingerprint match replaced existing record"
            );
            self.store.insert_confirmed(incoming);
            MergeOutcome::ReplacedByFingerprint
        } else {
            self.merge_monotonic(index, &incoming);
            trace!(
                winner = %self.store.records()[index].id,
                loser = %incoming.id,
                "fingerprint match kept existing record"
            );
            MergeOutcome::MergedDuplicate
        }
    }

    /// Fold the monotonic fields of `incoming` into the record at `index`:
    /// forward delivery-state transitions, receipt-set unions, and the
    /// irreversible recall flag. Identity and content are left untouched.
    fn merge_monotonic(&mut self, index: usize, incoming: &MessageRecord) {
        let record = &mut self.store.records_mut()[index];
        record.delivery_state.advance(incoming.delivery_state);
        record
            .delivered_to
            .extend(incoming.delivered_to.iter().cloned());
        record.read_by.extend(incoming.read_by.iter().cloned());
        record
            .hidden_from
            .extend(incoming.hidden_from.iter().cloned());
        record.recalled |= incoming.recalled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new("c1", ReconcilerConfig::default())
    }

    fn remote(id: &str, sender: &str, content: &str, created_at_ms: u64) -> MessageRecord {
        MessageRecord {
            id: id.to_owned(),
            provisional_id: None,
            conversation_id: "c1".to_owned(),
            sender_id: sender.to_owned(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            attachments: Vec::new(),
            created_at_ms,
            seq: 0,
            delivery_state: DeliveryState::Sent,
            recalled: false,
            pinned: false,
            hidden_from: Default::default(),
            delivered_to: Default::default(),
            read_by: Default::default(),
            reply_to_id: None,
            reply_snapshot: None,
        }
    }

    fn image_remote(id: &str, sender: &str, url: &str, created_at_ms: u64) -> MessageRecord {
        MessageRecord {
            kind: MessageKind::Image,
            attachments: vec![Attachment {
                url: url.to_owned(),
                mime_type: "image/png".to_owned(),
                file_name: "photo.png".to_owned(),
                size_bytes: Some(1024),
            }],
            ..remote(id, sender, "", created_at_ms)
        }
    }

    #[test]
    fn api_response_then_echo_yields_one_promoted_record() {
        // Scenario A: optimistic send, API response first, echo second.
        let mut rec = reconciler();
        let provisional_id = rec
            .create_optimistic(1_000, "u1", "hi", MessageKind::Text, Vec::new(), None)
            .expect("optimistic insert should work");

        rec.confirm_send(
            &provisional_id,
            &ConfirmedSend {
                id: "srv-42".to_owned(),
                created_at_ms: 1_100,
                attachments: None,
            },
        );

        let outcome = rec.upsert_from_remote(remote("srv-42", "u1", "hi", 1_100));
        assert_eq!(outcome, MergeOutcome::MergedDuplicate);

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-42");
        assert_eq!(records[0].provisional_id.as_deref(), Some(provisional_id.as_str()));
        assert_eq!(records[0].delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn echo_before_api_response_converges_to_same_state() {
        // Scenario B: the remote echo wins the race against the API response.
        let mut rec = reconciler();
        let provisional_id = rec
            .create_optimistic(1_000, "u1", "hi", MessageKind::Text, Vec::new(), None)
            .expect("optimistic insert should work");

        let outcome = rec.upsert_from_remote(remote("srv-42", "u1", "hi", 2_500));
        assert_eq!(outcome, MergeOutcome::PromotedOptimistic);

        // The late API response finds nothing pending and is a no-op.
        let promoted = rec.confirm_send(
            &provisional_id,
            &ConfirmedSend {
                id: "srv-42".to_owned(),
                created_at_ms: 2_500,
                attachments: None,
            },
        );
        assert!(!promoted);

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-42");
        assert_eq!(records[0].provisional_id.as_deref(), Some(provisional_id.as_str()));
        assert_eq!(records[0].delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn echo_carrying_provisional_id_matches_without_content_equality() {
        let mut rec = reconciler();
        let provisional_id = rec
            .create_optimistic(1_000, "u1", "hi", MessageKind::Text, Vec::new(), None)
            .expect("optimistic insert should work");

        // Server normalized the content; correlation still works via the
        // carried provisional id.
        let mut echo = remote("srv-9", "u1", "hi (edited)", 40_000);
        echo.provisional_id = Some(provisional_id.clone());
        assert_eq!(rec.upsert_from_remote(echo), MergeOutcome::PromotedOptimistic);

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-9");
    }

    #[test]
    fn duplicate_delivery_merges_receipts_without_reinsert() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-1", "u2", "yo", 1_000));

        let mut duplicate = remote("srv-1", "u2", "yo", 1_000);
        duplicate.delivery_state = DeliveryState::Read;
        duplicate.read_by.insert("u1".to_owned());
        assert_eq!(
            rec.upsert_from_remote(duplicate),
            MergeOutcome::MergedDuplicate
        );

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].delivery_state, DeliveryState::Read);
        assert!(records[0].read_by.contains("u1"));
    }

    #[test]
    fn fingerprint_fallback_prefers_most_progressed_state() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-a", "u2", "ping", 1_000));

        // Same sender/content arrives under a different id with a more
        // progressed delivery state; it wins and the older copy is dropped.
        let mut better = remote("srv-b", "u2", "ping", 3_000);
        better.delivery_state = DeliveryState::Delivered;
        assert_eq!(
            rec.upsert_from_remote(better),
            MergeOutcome::ReplacedByFingerprint
        );

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-b");
        assert_eq!(records[0].delivery_state, DeliveryState::Delivered);
    }

    #[test]
    fn fingerprint_fallback_keeps_existing_on_lower_priority() {
        let mut rec = reconciler();
        let mut existing = remote("srv-a", "u2", "ping", 2_000);
        existing.delivery_state = DeliveryState::Read;
        rec.upsert_from_remote(existing);

        let worse = remote("srv-b", "u2", "ping", 3_000);
        assert_eq!(rec.upsert_from_remote(worse), MergeOutcome::MergedDuplicate);

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "srv-a");
        assert_eq!(records[0].delivery_state, DeliveryState::Read);
    }

    #[test]
    fn fingerprint_equal_priority_prefers_later_timestamp() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-a", "u2", "ping", 2_000));
        assert_eq!(
            rec.upsert_from_remote(remote("srv-b", "u2", "ping", 4_000)),
            MergeOutcome::ReplacedByFingerprint
        );
        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records[0].id, "srv-b");
    }

    #[test]
    fn media_records_fingerprint_by_attachment_url() {
        let mut rec = reconciler();
        rec.upsert_from_remote(image_remote("srv-a", "u2", "https://cdn/x.png", 1_000));

        // Same sender and URL under a new id: duplicate.
        assert_eq!(
            rec.upsert_from_remote(image_remote("srv-b", "u2", "https://cdn/x.png", 2_000)),
            MergeOutcome::ReplacedByFingerprint
        );
        // Different URL: a genuinely new image.
        assert_eq!(
            rec.upsert_from_remote(image_remote("srv-c", "u2", "https://cdn/y.png", 2_500)),
            MergeOutcome::Inserted
        );
        assert_eq!(rec.store().len(), 2);
    }

    #[test]
    fn records_outside_time_window_are_not_correlated() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-a", "u2", "gm", 1_000));

        // Same fingerprint a minute later is a legitimate repeat message.
        assert_eq!(
            rec.upsert_from_remote(remote("srv-b", "u2", "gm", 61_000)),
            MergeOutcome::Inserted
        );
        assert_eq!(rec.store().len(), 2);
    }

    #[test]
    fn receipts_out_of_order_still_end_read() {
        // Scenario C: markRead arrives before markDelivered.
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-1", "u1", "hi", 1_000));

        assert!(rec.apply_remote(RemoteEvent::Read {
            message_ids: vec!["srv-1".to_owned()],
            user_id: "u2".to_owned(),
        }));
        assert!(rec.apply_remote(RemoteEvent::Delivered {
            message_ids: vec!["srv-1".to_owned()],
            user_id: "u2".to_owned(),
        }));

        let record = rec.store().get("srv-1").expect("record should exist");
        assert_eq!(record.delivery_state, DeliveryState::Read);
    }

    #[test]
    fn receipt_for_unknown_message_is_tolerated() {
        let mut rec = reconciler();
        assert!(!rec.apply_remote(RemoteEvent::Delivered {
            message_ids: vec!["srv-404".to_owned()],
            user_id: "u2".to_owned(),
        }));
    }

    #[test]
    fn pagination_page_with_known_record_inserts_page_minus_one() {
        // Scenario D: one record of the page was already pushed.
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-5", "u2", "already here", 5_000));

        let page = vec![
            remote("srv-3", "u2", "three", 3_000),
            remote("srv-4", "u2", "four", 4_000),
            remote("srv-5", "u2", "already here", 5_000),
        ];
        let inserted = rec.extend_older(page, Some("cursor-2".to_owned()), true);

        assert_eq!(inserted, 2);
        assert_eq!(rec.store().len(), 3);
        assert_eq!(rec.window().oldest_cursor.as_deref(), Some("cursor-2"));
        assert!(rec.window().has_more_older);

        let ids: Vec<&str> = rec.query("u1").map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-3", "srv-4", "srv-5"]);
    }

    #[test]
    fn extend_newer_updates_the_newer_edge() {
        let mut rec = reconciler();
        let inserted = rec.extend_newer(
            vec![remote("srv-9", "u2", "new", 9_000)],
            None,
            false,
        );
        assert_eq!(inserted, 1);
        assert_eq!(rec.window().newest_cursor, None);
        assert!(!rec.window().has_more_newer);
    }

    #[test]
    fn recall_event_flags_record_but_keeps_content_and_position() {
        // Scenario E.
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-1", "u2", "oops", 1_000));
        rec.upsert_from_remote(remote("srv-2", "u2", "next", 2_000));

        assert!(rec.apply_remote(RemoteEvent::Recalled {
            message_id: "srv-1".to_owned(),
        }));

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "srv-1");
        assert!(records[0].recalled);
        assert_eq!(records[0].content, "oops");
    }

    #[test]
    fn deleted_event_hides_record_from_that_user_only() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-1", "u2", "hi", 1_000));
        assert!(rec.apply_remote(RemoteEvent::Deleted {
            message_id: "srv-1".to_owned(),
            user_id: "u1".to_owned(),
        }));

        assert_eq!(rec.query("u1").count(), 0);
        assert_eq!(rec.query("u2").count(), 1);
    }

    #[test]
    fn typing_event_never_touches_the_timeline() {
        let mut rec = reconciler();
        assert!(!rec.apply_remote(RemoteEvent::Typing {
            user_id: "u2".to_owned(),
            display_name: "Bo".to_owned(),
        }));
        assert!(rec.store().is_empty());
    }

    #[test]
    fn reply_snapshot_is_taken_at_send_time() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-1", "u2", "original", 1_000));

        let provisional_id = rec
            .create_optimistic(
                2_000,
                "u1",
                "replying",
                MessageKind::Text,
                Vec::new(),
                Some("srv-1"),
            )
            .expect("reply insert should work");

        // Recalling the original later must not rewrite the snapshot.
        rec.apply_remote(RemoteEvent::Recalled {
            message_id: "srv-1".to_owned(),
        });

        let reply = rec
            .store()
            .get_by_provisional(&provisional_id)
            .expect("reply should exist");
        assert_eq!(reply.reply_to_id.as_deref(), Some("srv-1"));
        let snapshot = reply.reply_snapshot.as_ref().expect("snapshot should exist");
        assert_eq!(snapshot.content, "original");
        assert_eq!(snapshot.sender_id, "u2");
    }

    #[test]
    fn interleavings_never_duplicate_a_logical_message() {
        // No-duplicate invariant under both race orders and a late echo.
        for echo_first in [false, true] {
            let mut rec = reconciler();
            let provisional_id = rec
                .create_optimistic(1_000, "u1", "hello", MessageKind::Text, Vec::new(), None)
                .expect("optimistic insert should work");
            let confirmed = ConfirmedSend {
                id: "srv-7".to_owned(),
                created_at_ms: 1_200,
                attachments: None,
            };

            if echo_first {
                rec.upsert_from_remote(remote("srv-7", "u1", "hello", 1_200));
                rec.confirm_send(&provisional_id, &confirmed);
            } else {
                rec.confirm_send(&provisional_id, &confirmed);
                rec.upsert_from_remote(remote("srv-7", "u1", "hello", 1_200));
            }
            // A second, late echo.
            rec.upsert_from_remote(remote("srv-7", "u1", "hello", 1_200));

            let records: Vec<_> = rec.query("u1").collect();
            assert_eq!(records.len(), 1, "echo_first={echo_first}");
            assert_eq!(records[0].id, "srv-7");
        }
    }

    #[test]
    fn query_orders_by_timestamp_regardless_of_arrival_order() {
        let mut rec = reconciler();
        rec.upsert_from_remote(remote("srv-3", "u2", "c", 30_000));
        rec.upsert_from_remote(remote("srv-1", "u2", "a", 10_000));
        rec.upsert_from_remote(remote("srv-2", "u2", "b", 20_000));

        let ids: Vec<&str> = rec.query("u1").map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["srv-1", "srv-2", "srv-3"]);
    }

    #[test]
    fn failed_send_stays_in_timeline_for_retry() {
        let mut rec = reconciler();
        let provisional_id = rec
            .create_optimistic(1_000, "u1", "hi", MessageKind::Text, Vec::new(), None)
            .expect("optimistic insert should work");
        assert!(rec.fail_send(&provisional_id));

        let records: Vec<_> = rec.query("u1").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].delivery_state, DeliveryState::Failed);
        assert_eq!(records[0].content, "hi");
    }
}
