use resultsd::autosave::{EditOutcome, RowEditor, StoreSink};
use resultsd::config::ResultsDefaults;
use resultsd::db;
use resultsd::results::{self, FieldValue, RowField};
use resultsd::Period;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn debounced_edits_reach_the_workspace_as_one_write() {
    let workspace = temp_dir("resultsd-autosave");
    let mut conn = db::open_db(&workspace).expect("open db");
    let defaults = ResultsDefaults::default();
    let period = Period::new(2025, 6).expect("period");

    let view = results::get_period(&conn, &defaults, period).expect("get period");
    let mut editor = RowEditor::from_view(&view, defaults.autosave_quiet());
    let t0 = Instant::now();

    for (i, v) in ["1", "12", "123"].into_iter().enumerate() {
        let at = t0 + Duration::from_millis(50 * i as u64);
        let value = FieldValue::from_json(RowField::Fps, &serde_json::json!(v)).expect("value");
        let outcome = editor.edit(at, "p1", RowField::Fps, value).expect("edit");
        assert!(matches!(outcome, EditOutcome::Scheduled { .. }));
    }

    // Nothing is written before the quiet window closes.
    {
        let mut sink = StoreSink::new(&mut conn, defaults.clone());
        assert!(editor.poll(t0 + Duration::from_millis(200), &mut sink).is_none());
    }
    let before = results::get_period(&conn, &defaults, period).expect("get period");
    assert!(before.rows.is_empty());

    let deadline = editor.next_deadline().expect("pending deadline");
    let report = {
        let mut sink = StoreSink::new(&mut conn, defaults.clone());
        editor.poll(deadline, &mut sink).expect("flush at deadline")
    };
    assert_eq!(report.saved, vec!["p1".to_string()]);

    let after = results::get_period(&conn, &defaults, period).expect("get period");
    assert_eq!(after.rows.len(), 1);
    assert_eq!(after.rows[0].fps, Some(123));
    assert_eq!(editor.row("p1").and_then(|r| r.fps), Some(123));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn snapshot_from_another_connection_stops_the_editor() {
    let workspace = temp_dir("resultsd-autosave-lock");
    let mut editor_conn = db::open_db(&workspace).expect("open db");
    let mut admin_conn = db::open_db(&workspace).expect("open second connection");
    let defaults = ResultsDefaults::default();
    let period = Period::new(2025, 6).expect("period");

    let view = results::get_period(&editor_conn, &defaults, period).expect("get period");
    let mut editor = RowEditor::from_view(&view, defaults.autosave_quiet());
    let t0 = Instant::now();
    editor
        .edit(t0, "p1", RowField::CertMiss, FieldValue::Count(4))
        .expect("edit");
    {
        let mut sink = StoreSink::new(&mut editor_conn, defaults.clone());
        assert!(editor.flush(&mut sink).is_clean());
    }

    results::lock_period(&mut admin_conn, &defaults, period).expect("lock");

    editor
        .edit(t0, "p1", RowField::CertMiss, FieldValue::Count(9))
        .expect("edit");
    let report = {
        let mut sink = StoreSink::new(&mut editor_conn, defaults.clone());
        editor.flush(&mut sink)
    };
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].code, "period_locked");
    assert!(editor.is_locked());

    let later = editor
        .edit(t0, "p1", RowField::CertMiss, FieldValue::Count(10))
        .expect("edit");
    assert_eq!(later, EditOutcome::IgnoredLocked);

    let stored = results::get_period(&editor_conn, &defaults, period).expect("get period");
    assert_eq!(stored.rows[0].cert_miss, Some(4));

    let _ = std::fs::remove_dir_all(workspace);
}
