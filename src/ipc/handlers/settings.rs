use crate::config::ResultsDefaults;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn settings_get(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "defaults": state.defaults,
        "persisted": state.db.is_some(),
    }))
}

fn settings_update(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let next = ResultsDefaults::update(conn, params)?;
    tracing::info!(
        test_set_name = %next.test_set_name,
        clean_sample_size = next.clean_sample_size,
        "results defaults updated"
    );
    state.defaults = next;
    Ok(json!({ "defaults": state.defaults }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.get" => settings_get(state),
        "settings.update" => settings_update(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
