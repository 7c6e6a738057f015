use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    chat::{ChannelId, GuildId},
    media::{MediaRequest, RequestStage},
};

/// Character budget of a single rendered row, reasons included. Rows are
/// truncated to this width so the freeze-time pagination can never
/// overflow a page as stages and reasons change afterwards.
pub const MAX_ROW_WIDTH: usize = 120;

/// Frozen position of a row: (page index, row index within page). Assigned
/// once at `freeze` and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSlot {
    pub page: usize,
    pub row: usize,
}

#[derive(Debug, Clone)]
pub struct BundleRow {
    pub request_id: Uuid,
    display: String,
    pub stage: RequestStage,
    pub reason: Option<String>,
    pub slot: Option<PageSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleCounters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub discarded: usize,
}

impl BundleCounters {
    pub fn all_counted(&self) -> bool {
        self.completed + self.failed + self.discarded == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The rendered form may have changed; the owner should re-publish.
    pub changed: bool,
    /// This update made the bundle finished.
    pub finished_now: bool,
}

/// A user-visible grouping of 1..N media requests with a stable paginated
/// display.
///
/// Rows are appended before `freeze` and only updated in place after it.
/// Freezing assigns every row its permanent page slot, which is what lets
/// the dispatcher project changes as pure message edits.
pub struct ProgressBundle {
    pub id: Uuid,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    input: String,
    rows: Vec<BundleRow>,
    by_request: HashMap<Uuid, usize>,
    frozen: bool,
    rows_per_page: usize,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl ProgressBundle {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        input: impl Into<String>,
        page_char_limit: usize,
    ) -> Self {
        // one line of slack per page for the header on page zero
        let rows_per_page = (page_char_limit / (MAX_ROW_WIDTH + 1))
            .saturating_sub(1)
            .max(1);

        Self {
            id: Uuid::new_v4(),
            guild_id,
            channel_id,
            input: truncate_chars(&input.into(), MAX_ROW_WIDTH / 2),
            rows: Vec::new(),
            by_request: HashMap::new(),
            frozen: false,
            rows_per_page,
            error: None,
            finished_at: None,
        }
    }

    /// Key under which this bundle registers with the dispatch board.
    pub fn board_key(&self) -> String {
        format!("bundle-{}", self.id)
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Replaces the header text once the catalog reveals a better display
    /// name (album or playlist title) than the raw input.
    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = truncate_chars(&input.into(), MAX_ROW_WIDTH / 2);
    }

    pub fn add_request(&mut self, request: &MediaRequest, initial_stage: RequestStage) {
        if self.frozen {
            log::error!(
                "attempted to add a request to frozen bundle {id}, REQUEST: {req}",
                id = self.id,
                req = request.id
            );
            return;
        }

        let display = truncate_chars(request.raw_search.as_ref(), MAX_ROW_WIDTH / 2);
        self.by_request.insert(request.id, self.rows.len());
        self.rows.push(BundleRow {
            request_id: request.id,
            display,
            stage: initial_stage,
            reason: None,
            slot: None,
        });
    }

    /// Makes row ordering and pagination permanent. No rows may be added
    /// afterwards.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.frozen = true;

        for (i, row) in self.rows.iter_mut().enumerate() {
            row.slot = Some(PageSlot {
                page: i / self.rows_per_page,
                row: i % self.rows_per_page,
            });
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// A catalog-lookup failure before any request was produced. The
    /// bundle renders the error and is immediately finished.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn update(
        &mut self,
        request_id: Uuid,
        stage: RequestStage,
        reason: Option<String>,
    ) -> UpdateOutcome {
        let Some(&index) = self.by_request.get(&request_id) else {
            return UpdateOutcome {
                changed: false,
                finished_now: false,
            };
        };

        let row = &mut self.rows[index];
        let changed = row.stage != stage || row.reason != reason;
        row.stage = stage;
        row.reason = reason;

        let mut finished_now = false;
        if self.frozen && self.counters().all_counted() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
            finished_now = true;
        }

        UpdateOutcome {
            changed,
            finished_now,
        }
    }

    pub fn stage_of(&self, request_id: Uuid) -> Option<RequestStage> {
        self.by_request
            .get(&request_id)
            .map(|&i| self.rows[i].stage)
    }

    pub fn slot_of(&self, request_id: Uuid) -> Option<PageSlot> {
        self.by_request.get(&request_id).and_then(|&i| self.rows[i].slot)
    }

    /// Recomputed from the rows on every call; bundle sizes are small.
    pub fn counters(&self) -> BundleCounters {
        let mut counters = BundleCounters {
            total: self.rows.len(),
            ..Default::default()
        };
        for row in &self.rows {
            match row.stage {
                RequestStage::Completed => counters.completed += 1,
                RequestStage::Failed => counters.failed += 1,
                RequestStage::Discarded => counters.discarded += 1,
                _ => {}
            }
        }
        counters
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// One string per page, in page order. Stable across calls when no
    /// state changed, so the dispatcher can diff cheaply.
    pub fn render(&self) -> Vec<String> {
        if let Some(error) = &self.error {
            return vec![format!("Failed processing '{}': {error}", self.input)];
        }

        if !self.frozen {
            return vec![format!("Processing '{}'", self.input)];
        }

        if self.is_finished() {
            let counters = self.counters();
            return vec![format!(
                "Completed processing of '{}' {}/{} media_requests processed, {} failed",
                self.input, counters.completed, counters.total, counters.failed
            )];
        }

        let page_count = self
            .rows
            .last()
            .and_then(|row| row.slot)
            .map(|slot| slot.page + 1)
            .unwrap_or(1);

        let mut pages = vec![Vec::new(); page_count];
        for (i, row) in self.rows.iter().enumerate() {
            let slot = row.slot.expect("frozen rows carry slots");
            pages[slot.page].push(self.render_row(i, row));
        }

        pages
            .into_iter()
            .enumerate()
            .map(|(page_index, lines)| {
                if lines.iter().all(String::is_empty) {
                    return String::new();
                }
                let body = lines.join("\n");
                if page_index == 0 {
                    format!("Processing '{}'\n{body}", self.input)
                } else {
                    body
                }
            })
            .collect()
    }

    fn render_row(&self, index: usize, row: &BundleRow) -> String {
        // completed rows clear to a blank line so other rows keep their
        // vertical position
        if row.stage == RequestStage::Completed {
            return String::new();
        }

        let line = match &row.reason {
            Some(reason) => format!(
                "{n}. {display} [{stage}: {reason}]",
                n = index + 1,
                display = row.display,
                stage = row.stage.label()
            ),
            None => format!(
                "{n}. {display} [{stage}]",
                n = index + 1,
                display = row.display,
                stage = row.stage.label()
            ),
        };
        truncate_chars(&line, MAX_ROW_WIDTH)
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Shared map of live bundles. The orchestrator inserts, the loops update
/// rows through it, and the player-cleanup sweep drops bundles whose
/// finished state has outlasted the grace period.
#[derive(Default)]
pub struct BundleRegistry {
    inner: Mutex<HashMap<Uuid, Entry>>,
}

struct Entry {
    bundle: Arc<Mutex<ProgressBundle>>,
    finished_since: Option<Instant>,
}

impl BundleRegistry {
    pub fn insert(&self, bundle: ProgressBundle) -> Arc<Mutex<ProgressBundle>> {
        let id = bundle.id;
        let bundle = Arc::new(Mutex::new(bundle));
        self.inner.lock().expect("registry lock poisoned").insert(
            id,
            Entry {
                bundle: Arc::clone(&bundle),
                finished_since: None,
            },
        );
        bundle
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Mutex<ProgressBundle>>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .map(|entry| Arc::clone(&entry.bundle))
    }

    pub fn mark_finished(&self, id: Uuid) {
        if let Some(entry) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get_mut(&id)
        {
            entry.finished_since.get_or_insert_with(Instant::now);
        }
    }

    /// Drops bundles finished longer than `grace` ago, returning their
    /// board keys so the caller can retire the on-screen messages.
    pub fn sweep_finished(&self, grace: Duration) -> Vec<String> {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        let expired: Vec<Uuid> = map
            .iter()
            .filter(|(_, entry)| {
                entry
                    .finished_since
                    .is_some_and(|since| since.elapsed() >= grace)
            })
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| map.remove(&id))
            .map(|entry| {
                entry
                    .bundle
                    .lock()
                    .expect("bundle lock poisoned")
                    .board_key()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SearchKind;
    use pretty_assertions::assert_eq;

    fn request(raw: &str) -> MediaRequest {
        MediaRequest::new(1, 2, 3, "tester", raw, SearchKind::FreeText)
    }

    fn bundle_with(n: usize) -> (ProgressBundle, Vec<Uuid>) {
        let mut bundle = ProgressBundle::new(1, 2, "some input", 2000);
        let mut ids = Vec::new();
        for i in 0..n {
            let req = request(&format!("track {i}"));
            ids.push(req.id);
            bundle.add_request(&req, RequestStage::Queued);
        }
        bundle.freeze();
        (bundle, ids)
    }

    #[test]
    fn test_single_row_bundle_renders_one_page() {
        let (bundle, _) = bundle_with(1);
        assert_eq!(bundle.render().len(), 1);
    }

    #[test]
    fn test_slots_are_stable_across_updates() {
        let (mut bundle, ids) = bundle_with(40);
        let before: Vec<PageSlot> = ids.iter().map(|id| bundle.slot_of(*id).unwrap()).collect();

        for id in &ids {
            bundle.update(*id, RequestStage::InProgress, None);
            bundle.update(*id, RequestStage::Failed, Some("boom".to_owned()));
        }

        let after: Vec<PageSlot> = ids.iter().map(|id| bundle.slot_of(*id).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_counters_invariant_and_finish_exactly_once() {
        let (mut bundle, ids) = bundle_with(3);

        let mut finishes = 0;
        for (i, id) in ids.iter().enumerate() {
            let counters = bundle.counters();
            assert!(counters.completed + counters.failed + counters.discarded <= counters.total);

            let stage = match i {
                0 => RequestStage::Completed,
                1 => RequestStage::Failed,
                _ => RequestStage::Discarded,
            };
            let outcome = bundle.update(*id, stage, None);
            if outcome.finished_now {
                finishes += 1;
            }
        }

        assert_eq!(finishes, 1);
        assert!(bundle.is_finished());
        assert!(bundle.counters().all_counted());

        // further updates never re-finish
        let outcome = bundle.update(ids[0], RequestStage::Completed, None);
        assert!(!outcome.finished_now);
    }

    #[test]
    fn test_render_is_stable_without_changes() {
        let (mut bundle, ids) = bundle_with(5);
        bundle.update(ids[2], RequestStage::InProgress, None);

        let first = bundle.render();
        let second = bundle.render();
        assert_eq!(first, second);
    }

    #[test]
    fn test_completed_rows_render_blank_preserving_alignment() {
        let (mut bundle, ids) = bundle_with(3);
        bundle.update(ids[0], RequestStage::Completed, None);

        let pages = bundle.render();
        let lines: Vec<&str> = pages[0].lines().collect();
        // header, blank cleared row, then the two live rows
        assert_eq!(lines[0], "Processing 'some input'");
        assert_eq!(lines[1], "");
        assert!(lines[2].starts_with("2. track 1"));
        assert!(lines[3].starts_with("3. track 2"));
    }

    #[test]
    fn test_multi_page_and_blank_page() {
        // rows_per_page with the default limit is 15
        let (mut bundle, ids) = bundle_with(20);
        let pages = bundle.render();
        assert_eq!(pages.len(), 2);

        // completing every row on page zero blanks it
        for id in ids.iter().take(15) {
            bundle.update(*id, RequestStage::Completed, None);
        }
        for id in ids.iter().skip(15) {
            // keep page one alive
            bundle.update(*id, RequestStage::InProgress, None);
        }
        let pages = bundle.render();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0], "");
        assert!(!pages[1].is_empty());
    }

    #[test]
    fn test_finished_render_is_summary() {
        let (mut bundle, ids) = bundle_with(3);
        for id in &ids {
            bundle.update(*id, RequestStage::Completed, None);
        }

        let pages = bundle.render();
        assert_eq!(
            pages,
            vec!["Completed processing of 'some input' 3/3 media_requests processed, 0 failed"]
        );
    }

    #[test]
    fn test_error_bundle_is_finished_and_renders_error() {
        let mut bundle = ProgressBundle::new(1, 2, "badlist", 2000);
        bundle.set_error("playlist fetch failed");

        assert!(bundle.is_finished());
        assert_eq!(
            bundle.render(),
            vec!["Failed processing 'badlist': playlist fetch failed"]
        );
    }

    #[test]
    fn test_registry_sweeps_after_grace() {
        let registry = BundleRegistry::default();
        let (bundle, _) = bundle_with(1);
        let id = bundle.id;
        let key = bundle.board_key();
        registry.insert(bundle);

        assert!(registry.sweep_finished(Duration::ZERO).is_empty());
        registry.mark_finished(id);
        let swept = registry.sweep_finished(Duration::ZERO);
        assert_eq!(swept, vec![key]);
        assert!(registry.get(id).is_none());
    }
}
