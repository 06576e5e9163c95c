//! Client-side row editor with debounced autosave.
//!
//! Edits apply to the local rows immediately. Every edit restarts a single
//! quiet window; once it elapses, pending edits are flushed as one upsert per
//! row carrying only the latest value of each edited field. Time is passed in
//! by the caller so the editor can be driven by any event loop.

use crate::config::ResultsDefaults;
use crate::error::{Result, ResultsError};
use crate::period::Period;
use crate::results::{self, FieldValue, PeriodView, ResultRow, RowField, RowPatch};
use crate::snapshot::PeriodState;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Destination of flushed edits.
pub trait RowSink {
    fn upsert_row(&mut self, period: Period, product_id: &str, patch: &RowPatch) -> Result<ResultRow>;
}

/// Writes straight into a workspace database.
pub struct StoreSink<'a> {
    conn: &'a mut Connection,
    defaults: ResultsDefaults,
}

impl<'a> StoreSink<'a> {
    pub fn new(conn: &'a mut Connection, defaults: ResultsDefaults) -> Self {
        StoreSink { conn, defaults }
    }
}

impl RowSink for StoreSink<'_> {
    fn upsert_row(&mut self, period: Period, product_id: &str, patch: &RowPatch) -> Result<ResultRow> {
        results::upsert_row(self.conn, &self.defaults, period, product_id, patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Scheduled { deadline: Instant },
    /// The period is locked; nothing was changed or queued.
    IgnoredLocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosaveFailure {
    pub product_id: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: Vec<String>,
    pub failed: Vec<AutosaveFailure>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct PendingRow {
    last_edit: u64,
    patch: RowPatch,
}

#[derive(Debug)]
pub struct RowEditor {
    period: Period,
    quiet: Duration,
    locked: bool,
    rows: BTreeMap<String, ResultRow>,
    pending: BTreeMap<String, PendingRow>,
    deadline: Option<Instant>,
    edit_seq: u64,
}

impl RowEditor {
    pub fn new(period: Period, quiet: Duration) -> Self {
        RowEditor {
            period,
            quiet,
            locked: false,
            rows: BTreeMap::new(),
            pending: BTreeMap::new(),
            deadline: None,
            edit_seq: 0,
        }
    }

    /// Starts from a server view of the period.
    pub fn from_view(view: &PeriodView, quiet: Duration) -> Self {
        let mut editor = RowEditor::new(view.meta.period(), quiet);
        editor.reconcile(view);
        editor
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn row(&self, product_id: &str) -> Option<&ResultRow> {
        self.rows.get(product_id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.values()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Records one field edit at `now`. `product_id` is trimmed the same way
    /// the store trims it.
    pub fn edit(
        &mut self,
        now: Instant,
        product_id: &str,
        field: RowField,
        value: FieldValue,
    ) -> Result<EditOutcome> {
        if self.locked {
            return Ok(EditOutcome::IgnoredLocked);
        }
        let product_id = product_id.trim();
        if product_id.is_empty() {
            return Err(ResultsError::validation("productId must be a non-empty string"));
        }
        let single = RowPatch::new().with(field, value)?;

        let row = self
            .rows
            .entry(product_id.to_string())
            .or_insert_with(|| ResultRow::new(product_id));
        single.apply_to(row);

        self.edit_seq += 1;
        let seq = self.edit_seq;
        self.pending
            .entry(product_id.to_string())
            .and_modify(|p| p.last_edit = seq)
            .or_insert_with(|| PendingRow {
                last_edit: seq,
                patch: RowPatch::new(),
            })
            .patch
            .merge(single);

        let deadline = now + self.quiet;
        self.deadline = Some(deadline);
        Ok(EditOutcome::Scheduled { deadline })
    }

    /// Flushes if the quiet window has elapsed by `now`.
    pub fn poll<S: RowSink + ?Sized>(&mut self, now: Instant, sink: &mut S) -> Option<FlushReport> {
        match self.deadline {
            Some(deadline) if now >= deadline => Some(self.flush(sink)),
            _ => None,
        }
    }

    /// Sends every pending row now, in the order their last edit happened.
    /// Failures are reported but do not stop the remaining rows, and local
    /// values are kept as edited. A row that failed for any reason other than
    /// the lock stays queued and goes out with the next flush.
    pub fn flush<S: RowSink + ?Sized>(&mut self, sink: &mut S) -> FlushReport {
        self.deadline = None;
        let mut batch: Vec<(String, PendingRow)> = std::mem::take(&mut self.pending).into_iter().collect();
        batch.sort_by_key(|(_, p)| p.last_edit);

        let mut report = FlushReport::default();
        for (product_id, pending) in batch {
            match sink.upsert_row(self.period, &product_id, &pending.patch) {
                Ok(saved) => {
                    self.rows.insert(product_id.clone(), saved);
                    report.saved.push(product_id);
                }
                Err(e) => {
                    tracing::warn!(
                        period = %self.period,
                        product_id = %product_id,
                        error = %e,
                        "autosave failed"
                    );
                    if e.is_locked() {
                        self.locked = true;
                    } else {
                        self.pending.insert(product_id.clone(), pending);
                    }
                    report.failed.push(AutosaveFailure {
                        product_id,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Replaces local rows with server state, dropping queued edits.
    pub fn reconcile(&mut self, view: &PeriodView) {
        self.locked = PeriodState::of(&view.meta).is_locked();
        self.rows = view
            .rows
            .iter()
            .map(|r| (r.product_id.clone(), r.clone()))
            .collect();
        self.pending.clear();
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<(String, RowPatch)>,
        fail_next: usize,
    }

    impl RowSink for RecordingSink {
        fn upsert_row(&mut self, _period: Period, product_id: &str, patch: &RowPatch) -> Result<ResultRow> {
            self.calls.push((product_id.to_string(), patch.clone()));
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(ResultsError::Store(rusqlite::Error::QueryReturnedNoRows));
            }
            let mut row = ResultRow::new(product_id);
            patch.apply_to(&mut row);
            Ok(row)
        }
    }

    fn june() -> Period {
        Period::new(2025, 6).unwrap()
    }

    const QUIET: Duration = Duration::from_millis(400);

    #[test]
    fn rapid_edits_to_one_field_collapse_to_last_value() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink::default();
        let t0 = Instant::now();

        for (i, v) in [1, 2, 3].into_iter().enumerate() {
            let at = t0 + Duration::from_millis(100 * i as u64);
            editor.edit(at, "p1", RowField::Fps, FieldValue::Count(v)).unwrap();
            assert!(editor.poll(at, &mut sink).is_none());
        }
        assert_eq!(editor.row("p1").unwrap().fps, Some(3));

        // Window restarts at the third edit (t0 + 200ms).
        assert!(editor.poll(t0 + Duration::from_millis(599), &mut sink).is_none());
        let report = editor.poll(t0 + Duration::from_millis(600), &mut sink).unwrap();
        assert!(report.is_clean());

        assert_eq!(sink.calls.len(), 1);
        let (pid, patch) = &sink.calls[0];
        assert_eq!(pid, "p1");
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get(RowField::Fps), Some(&FieldValue::Count(3)));
        assert!(!editor.has_pending());
    }

    #[test]
    fn edits_on_other_rows_push_the_window_back() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink::default();
        let t0 = Instant::now();

        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(1)).unwrap();
        let later = t0 + Duration::from_millis(300);
        editor.edit(later, "p2", RowField::CertMiss, FieldValue::Count(4)).unwrap();
        assert!(editor.poll(t0 + QUIET, &mut sink).is_none());

        let report = editor.poll(later + QUIET, &mut sink).unwrap();
        assert_eq!(report.saved, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(sink.calls.len(), 2);
    }

    #[test]
    fn several_fields_of_one_row_go_out_in_one_upsert() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink::default();
        let t0 = Instant::now();
        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(1)).unwrap();
        editor
            .edit(t0, "p1", RowField::Stage, FieldValue::Text("final".into()))
            .unwrap();
        editor.edit(t0, "p1", RowField::Fps, FieldValue::Unset).unwrap();
        editor.flush(&mut sink);

        assert_eq!(sink.calls.len(), 1);
        let patch = &sink.calls[0].1;
        assert_eq!(patch.get(RowField::Fps), Some(&FieldValue::Unset));
        assert_eq!(
            patch.get(RowField::Stage),
            Some(&FieldValue::Text("final".into()))
        );
    }

    #[test]
    fn failed_flush_keeps_local_state_and_later_edits_still_save() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink {
            fail_next: 1,
            ..RecordingSink::default()
        };
        let t0 = Instant::now();

        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(9)).unwrap();
        let report = editor.poll(t0 + QUIET, &mut sink).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].code, "db_failed");
        assert_eq!(editor.row("p1").unwrap().fps, Some(9));

        assert!(editor.has_pending());

        let t1 = t0 + Duration::from_secs(1);
        editor.edit(t1, "p1", RowField::CertMiss, FieldValue::Count(2)).unwrap();
        let report = editor.poll(t1 + QUIET, &mut sink).unwrap();
        assert!(report.is_clean());
        assert_eq!(sink.calls.len(), 2);

        let retried = &sink.calls[1].1;
        assert_eq!(retried.get(RowField::Fps), Some(&FieldValue::Count(9)));
        assert_eq!(retried.get(RowField::CertMiss), Some(&FieldValue::Count(2)));
        assert_eq!(editor.row("p1").unwrap().fps, Some(9));
        assert_eq!(editor.row("p1").unwrap().cert_miss, Some(2));
        assert!(!editor.has_pending());
    }

    #[test]
    fn newer_edit_wins_over_a_requeued_value() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink {
            fail_next: 1,
            ..RecordingSink::default()
        };
        let t0 = Instant::now();

        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(9)).unwrap();
        editor.flush(&mut sink);
        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(4)).unwrap();
        assert!(editor.flush(&mut sink).is_clean());

        assert_eq!(sink.calls[1].1.get(RowField::Fps), Some(&FieldValue::Count(4)));
        assert_eq!(editor.row("p1").unwrap().fps, Some(4));
    }

    #[test]
    fn padded_product_ids_share_the_trimmed_row() {
        let mut editor = RowEditor::new(june(), QUIET);
        let mut sink = RecordingSink::default();
        let t0 = Instant::now();

        editor.edit(t0, " p1 ", RowField::Fps, FieldValue::Count(1)).unwrap();
        editor.edit(t0, "p1", RowField::CertMiss, FieldValue::Count(2)).unwrap();
        assert!(editor.row(" p1 ").is_none());
        assert_eq!(editor.rows().count(), 1);

        editor.flush(&mut sink);
        assert_eq!(sink.calls.len(), 1);
        assert_eq!(sink.calls[0].0, "p1");
        assert_eq!(sink.calls[0].1.len(), 2);

        let err = editor
            .edit(t0, "   ", RowField::Fps, FieldValue::Count(1))
            .unwrap_err();
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn locked_period_ignores_edits() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let defaults = ResultsDefaults::default();
        results::lock_period(&mut conn, &defaults, june()).unwrap();
        let view = results::get_period(&conn, &defaults, june()).unwrap();

        let mut editor = RowEditor::from_view(&view, QUIET);
        assert!(editor.is_locked());
        let outcome = editor
            .edit(Instant::now(), "p1", RowField::Fps, FieldValue::Count(1))
            .unwrap();
        assert_eq!(outcome, EditOutcome::IgnoredLocked);
        assert!(!editor.has_pending());
        assert!(editor.row("p1").is_none());
    }

    #[test]
    fn store_sink_persists_and_lock_rejection_disables_editor() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let defaults = ResultsDefaults::default();
        let view = results::get_period(&conn, &defaults, june()).unwrap();
        let mut editor = RowEditor::from_view(&view, QUIET);
        let t0 = Instant::now();

        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(2)).unwrap();
        {
            let mut sink = StoreSink::new(&mut conn, defaults.clone());
            assert!(editor.flush(&mut sink).is_clean());
        }
        let stored = results::get_period(&conn, &defaults, june()).unwrap();
        assert_eq!(stored.rows[0].fps, Some(2));

        // Someone else snapshots the period while this editor still shows it open.
        results::lock_period(&mut conn, &defaults, june()).unwrap();
        editor.edit(t0, "p1", RowField::Fps, FieldValue::Count(8)).unwrap();
        let report = {
            let mut sink = StoreSink::new(&mut conn, defaults.clone());
            editor.flush(&mut sink)
        };
        assert_eq!(report.failed[0].code, "period_locked");
        assert!(editor.is_locked());

        editor.reconcile(&results::get_period(&conn, &defaults, june()).unwrap());
        assert_eq!(editor.row("p1").unwrap().fps, Some(2));
    }
}
