use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::{watch, Notify};

use crate::{
    chat::{ChannelId, ChatClient, ChatError, MessageRef},
    health::Heartbeats,
};

const TICK_IDLE_WAIT: Duration = Duration::from_millis(250);

/// Fire-and-forget notification, optionally self-deleting.
#[derive(Debug, Clone)]
pub struct Notice {
    pub channel_id: ChannelId,
    pub text: String,
    pub delete_after: Option<Duration>,
}

#[derive(Debug, Clone)]
struct SentMessage {
    message: MessageRef,
    text: String,
}

struct MutableEntry {
    channel_id: ChannelId,
    sticky: bool,
    desired: Vec<String>,
    sent: Vec<SentMessage>,
    dirty: bool,
    last_dispatch: u64,
}

#[derive(Default)]
struct BoardInner {
    bundles: HashMap<String, MutableEntry>,
    notices: VecDeque<Notice>,
    timed_deletes: Vec<(Instant, MessageRef)>,
    retiring: Vec<String>,
    dispatch_counter: u64,
}

/// Shared signalling surface between the components that produce status
/// content and the dispatch loop that owns every chat-message handle.
///
/// Producers only register, publish rendered pages, and retire; they never
/// see a `MessageRef`.
#[derive(Default)]
pub struct DispatchBoard {
    inner: Mutex<BoardInner>,
    notify: Notify,
}

impl DispatchBoard {
    pub fn register(&self, key: impl Into<String>, channel_id: ChannelId, sticky: bool) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("board lock poisoned");
        inner.bundles.entry(key).or_insert(MutableEntry {
            channel_id,
            sticky,
            desired: Vec::new(),
            sent: Vec::new(),
            dirty: false,
            last_dispatch: 0,
        });
    }

    /// Publishes the bundle's freshly rendered pages and marks it pending.
    pub fn publish(&self, key: &str, pages: Vec<String>) {
        {
            let mut inner = self.inner.lock().expect("board lock poisoned");
            let Some(entry) = inner.bundles.get_mut(key) else {
                log::error!("publish for unregistered bundle, KEY: {key}");
                return;
            };
            entry.desired = pages;
            entry.dirty = true;
        }
        self.notify.notify_waiters();
    }

    /// Redirects future messages of this bundle to another channel. The
    /// old messages are deleted and the content resent on the next tick.
    pub fn move_channel(&self, key: &str, channel_id: ChannelId) {
        {
            let mut inner = self.inner.lock().expect("board lock poisoned");
            let Some(entry) = inner.bundles.get_mut(key) else {
                return;
            };
            if entry.channel_id == channel_id {
                return;
            }
            let old: Vec<SentMessage> = std::mem::take(&mut entry.sent);
            entry.channel_id = channel_id;
            entry.dirty = true;
            let now = Instant::now();
            inner
                .timed_deletes
                .extend(old.into_iter().map(|sent| (now, sent.message)));
        }
        self.notify.notify_waiters();
    }

    /// Queues the bundle for removal: its messages are deleted and the
    /// entry dropped by the loop.
    pub fn retire(&self, key: &str) {
        {
            let mut inner = self.inner.lock().expect("board lock poisoned");
            if inner.bundles.contains_key(key) {
                inner.retiring.push(key.to_owned());
            }
        }
        self.notify.notify_waiters();
    }

    pub fn notice(&self, notice: Notice) {
        {
            let mut inner = self.inner.lock().expect("board lock poisoned");
            inner.notices.push_back(notice);
        }
        self.notify.notify_waiters();
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("board lock poisoned")
            .bundles
            .contains_key(key)
    }

    #[cfg(test)]
    fn sent_texts(&self, key: &str) -> Vec<String> {
        self.inner.lock().unwrap().bundles[key]
            .sent
            .iter()
            .map(|s| s.text.clone())
            .collect()
    }
}

/// One minimal chat operation against an existing message set. Indices
/// refer to the pre-tick `sent` vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOp {
    Edit { index: usize, text: String },
    Send { text: String },
    Delete { index: usize },
}

/// Projects the desired pages onto the already-sent messages as the
/// smallest op set that keeps channel order equal to page order.
///
/// Shrinking prefers reusing messages whose content already matches the
/// surviving pages (order-preserving), edits the rest in place, and
/// deletes the surplus.
pub fn project_ops(sent: &[String], desired: &[String]) -> Vec<MessageOp> {
    let mut ops = Vec::new();

    if desired.len() >= sent.len() {
        for (index, page) in desired.iter().take(sent.len()).enumerate() {
            if &sent[index] != page {
                ops.push(MessageOp::Edit {
                    index,
                    text: page.clone(),
                });
            }
        }
        for page in desired.iter().skip(sent.len()) {
            ops.push(MessageOp::Send { text: page.clone() });
        }
        return ops;
    }

    // shrink: pick an increasing slot per surviving page, preferring slots
    // whose content already matches
    let mut picked = vec![false; sent.len()];
    let mut cursor = 0usize;
    for (j, page) in desired.iter().enumerate() {
        // leave enough later slots for the remaining pages
        let latest = sent.len() - (desired.len() - j);
        let exact = (cursor..=latest).find(|&i| !picked[i] && &sent[i] == page);
        let slot = exact.unwrap_or(cursor);
        picked[slot] = true;
        if &sent[slot] != page {
            ops.push(MessageOp::Edit {
                index: slot,
                text: page.clone(),
            });
        }
        cursor = slot + 1;
    }
    for (index, was_picked) in picked.iter().enumerate() {
        if !was_picked {
            ops.push(MessageOp::Delete { index });
        }
    }

    ops
}

/// Diff-based projector that owns all chat-message handles and issues
/// minimal edit/delete/send operations, one pending bundle per tick.
pub struct MessageDispatcher {
    chat: Arc<dyn ChatClient>,
    board: Arc<DispatchBoard>,
    sticky_recent_window: usize,
}

enum TickOutcome {
    Worked,
    Idle,
}

impl MessageDispatcher {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        board: Arc<DispatchBoard>,
        sticky_recent_window: usize,
    ) -> Self {
        Self {
            chat,
            board,
            sticky_recent_window,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>, heartbeats: Arc<Heartbeats>) {
        log::info!("dispatch loop started");

        loop {
            heartbeats.beat("dispatch");

            if *shutdown.borrow() {
                break;
            }

            let outcome = self.tick().await;

            if matches!(outcome, TickOutcome::Idle) {
                let wake = self.board.notify.notified();
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = wake => {}
                    _ = tokio::time::sleep(TICK_IDLE_WAIT) => {}
                }
            }
        }

        log::info!("dispatch loop stopped");
    }

    async fn tick(&self) -> TickOutcome {
        self.sweep_timed_deletes().await;
        self.sweep_retiring().await;

        if let Some((key, channel_id, sticky, desired, sent)) = self.take_pending() {
            self.dispatch_bundle(&key, channel_id, sticky, desired, sent)
                .await;
            return TickOutcome::Worked;
        }

        let notice = {
            let mut inner = self.board.inner.lock().expect("board lock poisoned");
            inner.notices.pop_front()
        };
        if let Some(notice) = notice {
            self.send_notice(notice).await;
            return TickOutcome::Worked;
        }

        TickOutcome::Idle
    }

    #[cfg(test)]
    pub(crate) async fn test_tick(&self) {
        let _ = self.tick().await;
    }

    /// Oldest-dispatched pending bundle, snapshotted so no board lock is
    /// held across chat calls.
    fn take_pending(&self) -> Option<(String, ChannelId, bool, Vec<String>, Vec<SentMessage>)> {
        let mut inner = self.board.inner.lock().expect("board lock poisoned");

        let key = inner
            .bundles
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .min_by_key(|(_, entry)| entry.last_dispatch)
            .map(|(key, _)| key.clone())?;

        inner.dispatch_counter += 1;
        let stamp = inner.dispatch_counter;
        let entry = inner.bundles.get_mut(&key).expect("pending bundle");
        entry.dirty = false;
        entry.last_dispatch = stamp;

        Some((
            key.clone(),
            entry.channel_id,
            entry.sticky,
            entry.desired.clone(),
            entry.sent.clone(),
        ))
    }

    async fn dispatch_bundle(
        &self,
        key: &str,
        channel_id: ChannelId,
        sticky: bool,
        desired: Vec<String>,
        sent: Vec<SentMessage>,
    ) {
        let sent_texts: Vec<String> = sent.iter().map(|s| s.text.clone()).collect();
        let ops = project_ops(&sent_texts, &desired);

        let mut slots: Vec<Option<SentMessage>> = sent.into_iter().map(Some).collect();
        let mut appended: Vec<SentMessage> = Vec::new();

        for op in ops {
            match op {
                MessageOp::Edit { index, text } => {
                    let Some(slot) = slots[index].as_mut() else {
                        continue;
                    };
                    match self.chat.edit(&slot.message, &text).await {
                        Ok(()) => slot.text = text,
                        Err(ChatError::NotFound) => {
                            // the message is gone; forget the handle and
                            // let the next tick resend the page
                            slots[index] = None;
                            self.write_back(key, slots, appended, true);
                            return;
                        }
                        Err(err) => {
                            log::error!("failed to edit bundle message, KEY: {key}, ERROR: {err}");
                            self.write_back(key, slots, appended, true);
                            return;
                        }
                    }
                }
                MessageOp::Send { text } => match self.chat.send(channel_id, &text).await {
                    Ok(message) => appended.push(SentMessage { message, text }),
                    Err(err) => {
                        log::error!("failed to send bundle message, KEY: {key}, ERROR: {err}");
                        self.write_back(key, slots, appended, true);
                        return;
                    }
                },
                MessageOp::Delete { index } => {
                    let Some(slot) = slots[index].take() else {
                        continue;
                    };
                    match self.chat.delete(&slot.message).await {
                        Ok(()) | Err(ChatError::NotFound) => {}
                        Err(err) => {
                            log::error!(
                                "failed to delete bundle message, KEY: {key}, ERROR: {err}"
                            );
                            self.write_back(key, slots, appended, true);
                            return;
                        }
                    }
                }
            }
        }

        let mut current: Vec<SentMessage> = slots.into_iter().flatten().collect();
        current.extend(appended);

        if sticky && !current.is_empty() {
            match self.enforce_sticky(channel_id, &desired, current).await {
                Ok(stuck) => current = stuck,
                Err((partial, err)) => {
                    log::error!("sticky re-anchor failed, KEY: {key}, ERROR: {err}");
                    self.write_back_sent(key, partial, true);
                    return;
                }
            }
        }

        self.write_back_sent(key, current, false);
    }

    /// If any foreign message landed below ours, delete and resend so the
    /// bundle stays at the bottom of its channel.
    async fn enforce_sticky(
        &self,
        channel_id: ChannelId,
        desired: &[String],
        current: Vec<SentMessage>,
    ) -> Result<Vec<SentMessage>, (Vec<SentMessage>, ChatError)> {
        let ours_max = current
            .iter()
            .map(|s| s.message.message_id)
            .max()
            .unwrap_or(0);

        let recent = match self
            .chat
            .fetch_recent(channel_id, self.sticky_recent_window)
            .await
        {
            Ok(recent) => recent,
            Err(err) => return Err((current, err)),
        };

        let overtaken = recent.iter().any(|&id| id > ours_max);
        if !overtaken {
            return Ok(current);
        }

        for i in 0..current.len() {
            match self.chat.delete(&current[i].message).await {
                Ok(()) | Err(ChatError::NotFound) => {}
                Err(err) => return Err((current, err)),
            }
        }

        let mut resent = Vec::with_capacity(desired.len());
        for page in desired {
            match self.chat.send(channel_id, page).await {
                Ok(message) => resent.push(SentMessage {
                    message,
                    text: page.clone(),
                }),
                Err(err) => return Err((resent, err)),
            }
        }
        Ok(resent)
    }

    fn write_back(
        &self,
        key: &str,
        slots: Vec<Option<SentMessage>>,
        appended: Vec<SentMessage>,
        redispatch: bool,
    ) {
        let mut current: Vec<SentMessage> = slots.into_iter().flatten().collect();
        current.extend(appended);
        self.write_back_sent(key, current, redispatch);
    }

    fn write_back_sent(&self, key: &str, sent: Vec<SentMessage>, redispatch: bool) {
        let mut inner = self.board.inner.lock().expect("board lock poisoned");
        if let Some(entry) = inner.bundles.get_mut(key) {
            entry.sent = sent;
            if redispatch {
                entry.dirty = true;
            }
        }
    }

    async fn send_notice(&self, notice: Notice) {
        match self.chat.send(notice.channel_id, &notice.text).await {
            Ok(message) => {
                if let Some(delete_after) = notice.delete_after {
                    let mut inner = self.board.inner.lock().expect("board lock poisoned");
                    inner
                        .timed_deletes
                        .push((Instant::now() + delete_after, message));
                }
            }
            Err(ChatError::Transient(err)) => {
                log::error!("transient failure sending notice, retrying, ERROR: {err}");
                let mut inner = self.board.inner.lock().expect("board lock poisoned");
                inner.notices.push_front(notice);
            }
            Err(err) => {
                log::error!("dropping undeliverable notice, ERROR: {err}");
            }
        }
    }

    async fn sweep_timed_deletes(&self) {
        let due: Vec<MessageRef> = {
            let mut inner = self.board.inner.lock().expect("board lock poisoned");
            let now = Instant::now();
            let (due, pending): (Vec<_>, Vec<_>) = inner
                .timed_deletes
                .drain(..)
                .partition(|(when, _)| *when <= now);
            inner.timed_deletes = pending;
            due.into_iter().map(|(_, message)| message).collect()
        };

        for message in due {
            match self.chat.delete(&message).await {
                Ok(()) | Err(ChatError::NotFound) => {}
                Err(err) => {
                    log::error!("failed timed delete, ERROR: {err}");
                    let mut inner = self.board.inner.lock().expect("board lock poisoned");
                    inner.timed_deletes.push((Instant::now(), message));
                }
            }
        }
    }

    async fn sweep_retiring(&self) {
        let retiring: Vec<(String, Vec<SentMessage>)> = {
            let mut inner = self.board.inner.lock().expect("board lock poisoned");
            let keys = std::mem::take(&mut inner.retiring);
            keys.into_iter()
                .filter_map(|key| {
                    inner
                        .bundles
                        .remove(&key)
                        .map(|entry| (key, entry.sent))
                })
                .collect()
        };

        for (key, sent) in retiring {
            for message in sent {
                match self.chat.delete(&message.message).await {
                    Ok(()) | Err(ChatError::NotFound) => {}
                    Err(err) => {
                        log::error!("failed to retire bundle message, KEY: {key}, ERROR: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_utils::RecordingChat;
    use pretty_assertions::assert_eq;

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_project_ops_no_change_is_empty() {
        let sent = pages(&["a", "b"]);
        assert_eq!(project_ops(&sent, &sent), vec![]);
    }

    #[test]
    fn test_project_ops_edits_changed_pages_only() {
        let ops = project_ops(&pages(&["a", "b", "c"]), &pages(&["a", "x", "c"]));
        assert_eq!(
            ops,
            vec![MessageOp::Edit {
                index: 1,
                text: "x".to_owned()
            }]
        );
    }

    #[test]
    fn test_project_ops_grow_sends_extra_pages() {
        let ops = project_ops(&pages(&["a"]), &pages(&["a", "b", "c"]));
        assert_eq!(
            ops,
            vec![
                MessageOp::Send {
                    text: "b".to_owned()
                },
                MessageOp::Send {
                    text: "c".to_owned()
                },
            ]
        );
    }

    #[test]
    fn test_project_ops_shrink_reuses_matching_messages() {
        // surviving pages "a" and "c" already exist; only "b" is deleted
        let ops = project_ops(&pages(&["a", "b", "c"]), &pages(&["a", "c"]));
        assert_eq!(ops, vec![MessageOp::Delete { index: 1 }]);
    }

    #[test]
    fn test_project_ops_shrink_edits_in_order_without_matches() {
        let ops = project_ops(&pages(&["a", "b", "c"]), &pages(&["x", "y"]));
        assert_eq!(
            ops,
            vec![
                MessageOp::Edit {
                    index: 0,
                    text: "x".to_owned()
                },
                MessageOp::Edit {
                    index: 1,
                    text: "y".to_owned()
                },
                MessageOp::Delete { index: 2 },
            ]
        );
    }

    #[test]
    fn test_project_ops_shrink_keeps_channel_order() {
        // "c" matches sent[2], but picking it for page zero would leave no
        // later slot for page one, so it must not be picked out of order
        let ops = project_ops(&pages(&["a", "b", "c"]), &pages(&["c", "b"]));
        assert_eq!(
            ops,
            vec![
                MessageOp::Edit {
                    index: 0,
                    text: "c".to_owned()
                },
                MessageOp::Delete { index: 2 },
            ]
        );
    }

    #[actix_rt::test]
    async fn test_dispatch_sends_then_edits_then_noop() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.register("k", 42, false);
        board.publish("k", pages(&["one", "two"]));
        dispatcher.tick().await;
        assert_eq!(chat.texts_in(42), vec!["one", "two"]);
        assert_eq!(board.sent_texts("k"), vec!["one", "two"]);

        board.publish("k", pages(&["one", "2"]));
        let sends_before = chat.send_count();
        dispatcher.tick().await;
        assert_eq!(chat.texts_in(42), vec!["one", "2"]);
        assert_eq!(chat.send_count(), sends_before, "edit must not resend");

        // unchanged content produces zero operations
        let ops_before = chat.op_count();
        board.publish("k", pages(&["one", "2"]));
        dispatcher.tick().await;
        assert_eq!(chat.op_count(), ops_before);
    }

    #[actix_rt::test]
    async fn test_dispatch_shrink_deletes_surplus() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.register("k", 7, false);
        board.publish("k", pages(&["a", "b", "c"]));
        dispatcher.tick().await;

        board.publish("k", pages(&["a", "c"]));
        dispatcher.tick().await;
        assert_eq!(chat.texts_in(7), vec!["a", "c"]);
    }

    #[actix_rt::test]
    async fn test_missing_message_is_forgotten_and_resent() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.register("k", 7, false);
        board.publish("k", pages(&["a", "b"]));
        dispatcher.tick().await;

        // someone deleted our second message behind our back
        chat.drop_message(7, 1);

        board.publish("k", pages(&["a", "b2"]));
        dispatcher.tick().await; // edit hits 404, handle forgotten
        dispatcher.tick().await; // re-dispatch sends the missing page
        assert_eq!(chat.texts_in(7), vec!["a", "b2"]);
    }

    #[actix_rt::test]
    async fn test_sticky_bundle_reanchors_below_foreign_message() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.register("k", 9, true);
        board.publish("k", pages(&["queue page"]));
        dispatcher.tick().await;

        // a foreign message lands below the bundle
        chat.send(9, "someone talking").await.unwrap();

        board.publish("k", pages(&["queue page"]));
        dispatcher.tick().await;

        let texts = chat.texts_in(9);
        assert_eq!(texts, vec!["someone talking", "queue page"]);
    }

    #[actix_rt::test]
    async fn test_notice_with_delete_after_is_deleted() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.notice(Notice {
            channel_id: 5,
            text: "gone soon".to_owned(),
            delete_after: Some(Duration::ZERO),
        });
        dispatcher.tick().await;
        assert_eq!(chat.texts_in(5), vec!["gone soon"]);

        dispatcher.tick().await;
        assert!(chat.texts_in(5).is_empty());
    }

    #[actix_rt::test]
    async fn test_retire_deletes_all_messages() {
        let chat = Arc::new(RecordingChat::default());
        let board = Arc::new(DispatchBoard::default());
        let dispatcher = MessageDispatcher::new(chat.clone(), board.clone(), 5);

        board.register("k", 3, false);
        board.publish("k", pages(&["a", "b"]));
        dispatcher.tick().await;

        board.retire("k");
        dispatcher.tick().await;
        assert!(chat.texts_in(3).is_empty());
        assert!(!board.is_registered("k"));
    }
}
