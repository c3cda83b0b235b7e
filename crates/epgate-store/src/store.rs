//! Conversation queue / debounce state machine — the core of this crate.
//! `ConversationStore::add_pending_message` implements the admission cases
//! A–E; `request_flush` and `on_stream_finished` implement the flush and
//! completion contracts that drive the queue forward.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use epgate_core::types::{
    AdmissionStatus, BatchKey, ChatId, ChatType, ConversationKey, ConversationQueueEntry,
    PendingInbound, StreamId, StreamState, UserId, PRUNE_INTERVAL_SECS, STREAM_TTL_SECS,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Invoked when a batch's debounce timer fires or an explicit flush is
/// requested on the active batch — this is what begins agent processing.
/// Takes the batch's `PendingInbound` by value — it has already been removed
/// from the store by the time `flush` runs, so this is the handler's only
/// chance to see the accumulated `contents`/`msg_ids` the admission cases
/// built up.
#[async_trait::async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(&self, batch: PendingInbound);
}

struct DebounceTimer {
    token: CancellationToken,
}

pub struct ConversationStore<H: FlushHandler + 'static> {
    streams: DashMap<StreamId, StreamState>,
    msg_id_to_stream: DashMap<String, StreamId>,
    pending: DashMap<BatchKey, PendingInbound>,
    conversations: DashMap<ConversationKey, ConversationQueueEntry>,
    batch_stream: DashMap<BatchKey, StreamId>,
    ack_streams: DashMap<BatchKey, Vec<StreamId>>,
    timers: DashMap<BatchKey, DebounceTimer>,
    flush_handler: Arc<H>,
    handler_refs: AtomicUsize,
    pruner: AsyncMutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl<H: FlushHandler + 'static> ConversationStore<H> {
    pub fn new(flush_handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            msg_id_to_stream: DashMap::new(),
            pending: DashMap::new(),
            conversations: DashMap::new(),
            batch_stream: DashMap::new(),
            ack_streams: DashMap::new(),
            timers: DashMap::new(),
            flush_handler,
            handler_refs: AtomicUsize::new(0),
            pruner: AsyncMutex::new(None),
        })
    }

    pub fn stream(&self, stream_id: &StreamId) -> Option<dashmap::mapref::one::Ref<'_, StreamId, StreamState>> {
        self.streams.get(stream_id)
    }

    pub fn stream_mut(
        &self,
        stream_id: &StreamId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, StreamId, StreamState>> {
        self.streams.get_mut(stream_id)
    }

    pub fn stream_for_msg_id(&self, msg_id: &str) -> Option<StreamId> {
        self.msg_id_to_stream.get(msg_id).map(|e| e.clone())
    }

    /// Registers a stream that was allocated outside `add_pending_message` —
    /// used for ack streams, which have no pending batch of their own.
    pub fn insert_stream(&self, stream: StreamState) {
        self.streams.insert(stream.stream_id.clone(), stream);
    }

    /// Admits one inbound message into the queue, implementing admission
    /// cases A–E. The initial batch's key is the conversation key itself;
    /// every subsequent queued batch gets `"<conversationKey>#q<seq>"`.
    #[instrument(skip(self, content), fields(%conversation_key))]
    pub fn add_pending_message(
        self: &Arc<Self>,
        conversation_key: ConversationKey,
        msg_id: Option<String>,
        content: String,
        user_id: UserId,
        chat_type: ChatType,
        chat_id: Option<ChatId>,
        debounce_ms: u64,
    ) -> (StreamId, AdmissionStatus) {
        let initial_batch_key = BatchKey(conversation_key.0.clone());

        let existing = self.conversations.get(&conversation_key).map(|e| {
            (e.active_batch_key.clone(), e.queue.clone(), e.next_seq)
        });

        let Some((active_batch_key, queue, _next_seq)) = existing else {
            // Case A: first ever message, or idle after prior completion.
            let stream_id = StreamId::generate();
            let stream = StreamState::new(
                stream_id.clone(),
                conversation_key.clone(),
                initial_batch_key.clone(),
                user_id,
                chat_type,
                chat_id,
            );
            self.streams.insert(stream_id.clone(), stream);
            self.batch_stream.insert(initial_batch_key.clone(), stream_id.clone());

            let mut pending = PendingInbound::new(stream_id.clone(), conversation_key.clone(), initial_batch_key.clone());
            pending.contents.push(content);
            if let Some(id) = &msg_id {
                pending.msg_ids.push(id.clone());
                self.msg_id_to_stream.insert(id.clone(), stream_id.clone());
            }
            self.pending.insert(initial_batch_key.clone(), pending);

            self.conversations.insert(
                conversation_key,
                ConversationQueueEntry {
                    active_batch_key: Some(initial_batch_key.clone()),
                    queue: None,
                    next_seq: 0,
                },
            );
            self.start_debounce(initial_batch_key, debounce_ms);
            return (stream_id, AdmissionStatus::ActiveNew);
        };

        let active_is_initial = active_batch_key.as_ref() == Some(&initial_batch_key);
        let active_stream_id = active_batch_key.as_ref().and_then(|bk| self.batch_stream.get(bk).map(|e| e.clone()));
        let active_started = active_stream_id
            .as_ref()
            .and_then(|sid| self.streams.get(sid).map(|s| s.started))
            .unwrap_or(true);

        // Case C: active batch is a *queued-turned-active* batch whose
        // stream hasn't started processing yet — safe to merge.
        if !active_is_initial && !active_started {
            let batch_key = active_batch_key.expect("active_is_initial false implies Some");
            let stream_id = active_stream_id.expect("batch_stream populated alongside streams");
            self.merge_into(&batch_key, msg_id, content, debounce_ms);
            return (stream_id, AdmissionStatus::ActiveMerged);
        }

        // Case D: a queued batch already exists — merge into it.
        if let Some(queued_batch_key) = queue {
            let stream_id = self
                .batch_stream
                .get(&queued_batch_key)
                .map(|e| e.clone())
                .expect("queued batch always has an allocated stream");
            self.merge_into(&queued_batch_key, msg_id, content, debounce_ms);
            return (stream_id, AdmissionStatus::QueuedMerged);
        }

        // Case B (initial active, don't merge) and Case E (active started,
        // no queue yet) both land here: allocate a fresh queued batch.
        let seq = {
            let mut entry = self.conversations.get_mut(&conversation_key).expect("checked Some above");
            let seq = entry.next_seq;
            entry.next_seq += 1;
            seq
        };
        let queued_batch_key = BatchKey(format!("{}#q{seq}", conversation_key.0));
        let stream_id = StreamId::generate();
        let stream = StreamState::new(
            stream_id.clone(),
            conversation_key.clone(),
            queued_batch_key.clone(),
            user_id,
            chat_type,
            chat_id,
        );
        self.streams.insert(stream_id.clone(), stream);
        self.batch_stream.insert(queued_batch_key.clone(), stream_id.clone());

        let mut pending = PendingInbound::new(stream_id.clone(), conversation_key.clone(), queued_batch_key.clone());
        pending.contents.push(content);
        if let Some(id) = &msg_id {
            pending.msg_ids.push(id.clone());
            self.msg_id_to_stream.insert(id.clone(), stream_id.clone());
        }
        self.pending.insert(queued_batch_key.clone(), pending);

        if let Some(mut entry) = self.conversations.get_mut(&conversation_key) {
            entry.queue = Some(queued_batch_key.clone());
        }
        self.start_debounce(queued_batch_key, debounce_ms);
        (stream_id, AdmissionStatus::QueuedNew)
    }

    /// Merges `content`/`msg_id` into the pending batch at `batch_key` and
    /// resets its debounce timer. Per spec, a merged `msg_id` is *not*
    /// mapped to the underlying stream — callers register an ack stream
    /// for it separately via [`Self::add_ack_stream_for_batch`].
    fn merge_into(self: &Arc<Self>, batch_key: &BatchKey, msg_id: Option<String>, content: String, debounce_ms: u64) {
        if let Some(mut pending) = self.pending.get_mut(batch_key) {
            pending.contents.push(content);
            if let Some(id) = msg_id {
                pending.msg_ids.push(id);
            }
        }
        self.start_debounce(batch_key.clone(), debounce_ms);
    }

    /// (Re)starts the cancellable debounce timer for `batch_key` — any
    /// existing timer is cancelled first (cancel-and-respawn).
    fn start_debounce(self: &Arc<Self>, batch_key: BatchKey, debounce_ms: u64) {
        if let Some((_, old)) = self.timers.remove(&batch_key) {
            old.token.cancel();
        }
        let token = CancellationToken::new();
        self.timers.insert(batch_key.clone(), DebounceTimer { token: token.clone() });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(debounce_ms)) => {
                    this.request_flush(batch_key).await;
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Flush contract: if `batch_key` is the conversation's active batch,
    /// flush immediately; otherwise mark it ready and wait for
    /// `on_stream_finished` to promote it.
    #[instrument(skip(self), fields(%batch_key))]
    pub async fn request_flush(self: &Arc<Self>, batch_key: BatchKey) {
        let Some(pending) = self.pending.get(&batch_key) else {
            return;
        };
        let conversation_key = pending.conversation_key.clone();
        drop(pending);

        let is_active = self
            .conversations
            .get(&conversation_key)
            .map(|e| e.active_batch_key.as_ref() == Some(&batch_key))
            .unwrap_or(false);

        if is_active {
            self.flush_pending(&batch_key).await;
        } else if let Some(mut pending) = self.pending.get_mut(&batch_key) {
            pending.ready_to_flush = true;
        }
    }

    /// One-shot: removes the pending entry, cancels its timer, and invokes
    /// the registered flush handler.
    async fn flush_pending(self: &Arc<Self>, batch_key: &BatchKey) {
        let Some((_, pending)) = self.pending.remove(batch_key) else {
            return;
        };
        if let Some((_, timer)) = self.timers.remove(batch_key) {
            timer.token.cancel();
        }
        if let Some(mut stream) = self.streams.get_mut(&pending.stream_id) {
            stream.started = true;
        }
        debug!(batch_key = %batch_key, "flushing batch to agent driver");
        self.flush_handler.flush(pending).await;
    }

    /// Completion contract: advances the queue past `stream_id`'s batch,
    /// promoting any queued batch to active.
    #[instrument(skip(self))]
    pub async fn on_stream_finished(self: &Arc<Self>, stream_id: &StreamId) {
        let Some(stream) = self.streams.get(stream_id) else {
            return;
        };
        let conversation_key = stream.conversation_key.clone();
        let finished_batch_key = stream.batch_key.clone();
        drop(stream);

        let is_active_batch = self
            .conversations
            .get(&conversation_key)
            .map(|e| e.active_batch_key.as_ref() == Some(&finished_batch_key))
            .unwrap_or(false);
        if !is_active_batch {
            return;
        }

        let promoted = {
            let mut entry = match self.conversations.get_mut(&conversation_key) {
                Some(e) => e,
                None => return,
            };
            let promoted = entry.queue.take();
            entry.active_batch_key = promoted.clone();
            promoted
        };

        match promoted {
            None => {
                self.conversations.remove(&conversation_key);
            }
            Some(batch_key) => {
                let ready = self
                    .pending
                    .get(&batch_key)
                    .map(|p| p.ready_to_flush)
                    .unwrap_or(false);
                if ready {
                    self.flush_pending(&batch_key).await;
                }
            }
        }
    }

    pub fn add_ack_stream_for_batch(&self, batch_key: BatchKey, ack_stream_id: StreamId) {
        self.ack_streams.entry(batch_key).or_default().push(ack_stream_id);
    }

    pub fn drain_ack_streams(&self, batch_key: &BatchKey) -> Vec<StreamId> {
        self.ack_streams.remove(batch_key).map(|(_, v)| v).unwrap_or_default()
    }

    pub fn map_msg_id(&self, msg_id: String, stream_id: StreamId) {
        self.msg_id_to_stream.insert(msg_id, stream_id);
    }

    /// Starts the 60s pruner on the first registered handler, and stops it
    /// when the last one unregisters.
    pub async fn register_handler(self: &Arc<Self>) {
        if self.handler_refs.fetch_add(1, Ordering::SeqCst) == 0 {
            let token = CancellationToken::new();
            let this = Arc::clone(self);
            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = interval.tick() => this.prune(),
                        _ = task_token.cancelled() => break,
                    }
                }
            });
            *self.pruner.lock().await = Some((token, handle));
        }
    }

    pub async fn unregister_handler(self: &Arc<Self>) {
        if self.handler_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some((token, handle)) = self.pruner.lock().await.take() {
                token.cancel();
                handle.abort();
            }
        }
    }

    /// Prunes expired streams, dangling msg-id mappings, timed-out pending
    /// batches, and conversation entries with no active batch and no queue.
    pub fn prune(&self) {
        let now = Utc::now();

        let expired_streams: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for id in &expired_streams {
            self.streams.remove(id);
        }
        self.msg_id_to_stream.retain(|_, sid| !expired_streams.contains(sid));

        let expired_batches: Vec<BatchKey> = self
            .pending
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for batch_key in &expired_batches {
            self.pending.remove(batch_key);
            if let Some((_, timer)) = self.timers.remove(batch_key) {
                timer.token.cancel();
            }
        }

        self.conversations.retain(|_, entry| {
            let active_alive = entry
                .active_batch_key
                .as_ref()
                .map(|bk| self.batch_stream.get(bk).is_some())
                .unwrap_or(false);
            active_alive || entry.queue.is_some()
        });
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct RecordingHandler {
        flushes: AtomicU32,
    }

    #[async_trait::async_trait]
    impl FlushHandler for RecordingHandler {
        async fn flush(&self, batch: PendingInbound) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            let _ = batch.stream_id;
        }
    }

    fn store() -> Arc<ConversationStore<RecordingHandler>> {
        ConversationStore::new(Arc::new(RecordingHandler {
            flushes: AtomicU32::new(0),
        }))
    }

    #[tokio::test]
    async fn first_message_is_case_a_active_new() {
        let store = store();
        let (stream_id, status) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m1".into()),
            "hello".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50,
        );
        assert_eq!(status, AdmissionStatus::ActiveNew);
        assert_eq!(store.stream_for_msg_id("m1"), Some(stream_id));
    }

    #[tokio::test]
    async fn second_message_before_flush_is_case_b_queued_new_not_merged() {
        let store = store();
        let (first_id, _) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m1".into()),
            "hello".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        let (second_id, status) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m2".into()),
            "again".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        assert_eq!(status, AdmissionStatus::QueuedNew);
        assert_ne!(first_id, second_id, "initial batch must never merge");
    }

    #[tokio::test]
    async fn third_message_merges_into_existing_queue_case_d() {
        let store = store();
        store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m1".into()),
            "hello".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        let (queued_id, _) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m2".into()),
            "again".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        let (third_id, status) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m3".into()),
            "once more".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        assert_eq!(status, AdmissionStatus::QueuedMerged);
        assert_eq!(third_id, queued_id);
        // Merged msg-ids are not mapped to the underlying stream.
        assert_eq!(store.stream_for_msg_id("m3"), None);
    }

    #[tokio::test]
    async fn on_stream_finished_promotes_queue_and_flushes_if_ready() {
        let store = store();
        let (active_id, _) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m1".into()),
            "hello".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        let (queued_id, _) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m2".into()),
            "again".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        // Simulate the queued batch's debounce firing before the active one finishes.
        store.request_flush(BatchKey(format!("acct:u1:direct#q0"))).await;
        assert!(store.pending.get(&BatchKey("acct:u1:direct#q0".into())).unwrap().ready_to_flush);

        store.on_stream_finished(&active_id).await;
        // Queue should now be promoted and, since it was ready, flushed.
        assert!(store.pending.get(&BatchKey("acct:u1:direct#q0".into())).is_none());
        let _ = queued_id;
    }

    #[tokio::test]
    async fn conversation_entry_removed_when_queue_empty_on_finish() {
        let store = store();
        let (active_id, _) = store.add_pending_message(
            "acct:u1:direct".into(),
            Some("m1".into()),
            "hello".into(),
            "u1".into(),
            ChatType::Direct,
            None,
            50_000,
        );
        store.on_stream_finished(&active_id).await;
        assert!(store.conversations.get(&ConversationKey("acct:u1:direct".into())).is_none());
    }
}
