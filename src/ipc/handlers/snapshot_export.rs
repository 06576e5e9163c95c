use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::period::Period;
use crate::results;
use crate::snapshot_export;
use serde_json::json;
use std::path::PathBuf;

fn get_required_path(params: &serde_json::Value, key: &str) -> Result<PathBuf, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn export(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = Period::from_params(params)?;
    let out_path = get_required_path(params, "outPath")?;
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let view = results::get_period(conn, &state.defaults, period)?;
    if !view.meta.locked {
        return Err(HandlerErr {
            code: "not_locked",
            message: "take a snapshot before exporting".to_string(),
            details: Some(json!({ "year": period.year, "month": period.month })),
        });
    }

    let summary = snapshot_export::export_period_bundle(&view, &out_path)
        .map_err(|e| HandlerErr::new("export_failed", format!("{e:#}")))?;
    tracing::info!(%period, out = %out_path.to_string_lossy(), "snapshot exported");
    Ok(json!({
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "rowCount": summary.row_count,
        "snapshotDigest": summary.snapshot_digest,
        "outPath": out_path.to_string_lossy(),
    }))
}

fn verify(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let in_path = get_required_path(params, "inPath")?;
    let bundle = snapshot_export::read_period_bundle(&in_path)
        .map_err(|e| HandlerErr::new("bundle_invalid", format!("{e:#}")))?;
    Ok(json!({
        "period": bundle.meta.period().to_string(),
        "snapshotAt": bundle.meta.snapshot_at,
        "rowCount": bundle.rows.len(),
        "digestMatches": bundle.digest_matches,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "results.snapshot.export" => export(state, &req.params),
        "results.snapshot.verify" => verify(&req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
