use crate::grading::{self, GradeBands};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::period::Period;
use crate::results::{self, MetaPatch, ResultPeriodMeta, ResultRow, RowPatch};
use crate::snapshot;
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;

fn conn_mut(state: &mut AppState) -> Result<&mut Connection, HandlerErr> {
    state
        .db
        .as_mut()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn bands_for(meta: &ResultPeriodMeta) -> GradeBands {
    grading::grade_bands(u64::try_from(meta.clean_sample_size).unwrap_or(0))
}

fn meta_json(meta: &ResultPeriodMeta) -> Result<serde_json::Value, HandlerErr> {
    let mut out = to_json(meta)?;
    let today = Local::now().date_naive();
    out["isPast"] = json!(snapshot::is_past(meta.period(), today));
    Ok(out)
}

fn row_json(row: &ResultRow, bands: &GradeBands) -> Result<serde_json::Value, HandlerErr> {
    let mut out = to_json(row)?;
    out["fpsGrade"] = match row.fps {
        Some(fps) => json!(grading::grade_for(fps, bands)),
        None => serde_json::Value::Null,
    };
    Ok(out)
}

fn results_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = Period::from_params(params)?;
    let defaults = state.defaults.clone();
    let conn = conn_mut(state)?;
    let view = results::get_period(conn, &defaults, period)?;

    let bands = bands_for(&view.meta);
    let rows = view
        .rows
        .iter()
        .map(|r| row_json(r, &bands))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "meta": meta_json(&view.meta)?,
        "rows": rows,
        "bands": bands,
    }))
}

fn row_upsert(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = Period::from_params(params)?;
    let product_id = params
        .get("productId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing productId"))?
        .to_string();
    let patch = RowPatch::from_params(params)?;
    let defaults = state.defaults.clone();
    let conn = conn_mut(state)?;
    let row = results::upsert_row(conn, &defaults, period, &product_id, &patch)?;

    let meta = results::get_meta(conn, &defaults, period)?;
    Ok(json!({ "row": row_json(&row, &bands_for(&meta))? }))
}

fn meta_patch(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = Period::from_params(params)?;
    let patch = MetaPatch::from_params(params)?;
    let defaults = state.defaults.clone();
    let conn = conn_mut(state)?;
    let meta = results::patch_meta(conn, &defaults, period, &patch)?;
    Ok(json!({
        "meta": meta_json(&meta)?,
        "bands": bands_for(&meta),
    }))
}

fn take_snapshot(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = Period::from_params(params)?;
    let defaults = state.defaults.clone();
    let conn = conn_mut(state)?;
    let outcome = snapshot::take_snapshot(conn, &defaults, period)?;
    Ok(json!({
        "meta": meta_json(&outcome.meta)?,
        "transitioned": outcome.transitioned,
    }))
}

fn bands(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let size = params
        .get("cleanSampleSize")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "cleanSampleSize must be a non-negative integer".to_string(),
            details: params.get("cleanSampleSize").map(|v| json!({ "cleanSampleSize": v })),
        })?;
    let bands = grading::grade_bands(size);
    Ok(json!({
        "cleanSampleSize": size,
        "bands": bands,
        "ordered": bands.is_ordered(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "results.get" => results_get(state, &req.params),
        "results.row.upsert" => row_upsert(state, &req.params),
        "results.meta.patch" => meta_patch(state, &req.params),
        "results.snapshot" => take_snapshot(state, &req.params),
        "results.bands" => bands(&req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
