//! Result store: one meta record and N rows per (year, month) period.
//!
//! Every write runs inside a `BEGIN IMMEDIATE` transaction that first checks
//! the period's lock, so a snapshot taken by another connection can never
//! interleave between the check and the write.

use crate::config::ResultsDefaults;
use crate::error::{Result, ResultsError};
use crate::period::Period;
use crate::snapshot;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPeriodMeta {
    pub year: i32,
    pub month: u32,
    pub test_set_name: String,
    pub clean_sample_size: i64,
    pub locked: bool,
    pub snapshot_at: Option<String>,
    pub snapshot_digest: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    /// False when the meta was materialized from defaults and never stored.
    pub persisted: bool,
}

impl ResultPeriodMeta {
    pub fn defaults_for(period: Period, defaults: &ResultsDefaults) -> Self {
        ResultPeriodMeta {
            year: period.year,
            month: period.month,
            test_set_name: defaults.test_set_name.clone(),
            clean_sample_size: defaults.clean_sample_size,
            locked: false,
            snapshot_at: None,
            snapshot_digest: None,
            created_at: None,
            updated_at: None,
            persisted: false,
        }
    }

    pub fn period(&self) -> Period {
        Period {
            year: self.year,
            month: self.month,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub product_id: String,
    pub product_name: Option<String>,
    pub vm_name: Option<String>,
    pub stage: Option<String>,
    pub cert_miss: Option<i64>,
    pub fps: Option<i64>,
    pub cfn_preview: Option<i64>,
    pub cfn_final: Option<i64>,
    pub original: Option<String>,
    pub private_flag: bool,
    pub inv_res_flag: bool,
    pub updated_at: Option<String>,
}

impl ResultRow {
    pub fn new(product_id: impl Into<String>) -> Self {
        ResultRow {
            product_id: product_id.into(),
            ..ResultRow::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodView {
    pub meta: ResultPeriodMeta,
    pub rows: Vec<ResultRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowField {
    ProductName,
    VmName,
    Stage,
    CertMiss,
    Fps,
    CfnPreview,
    CfnFinal,
    Original,
    PrivateFlag,
    InvResFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Count,
    Flag,
}

impl RowField {
    pub const ALL: [RowField; 10] = [
        RowField::ProductName,
        RowField::VmName,
        RowField::Stage,
        RowField::CertMiss,
        RowField::Fps,
        RowField::CfnPreview,
        RowField::CfnFinal,
        RowField::Original,
        RowField::PrivateFlag,
        RowField::InvResFlag,
    ];

    pub fn key(self) -> &'static str {
        match self {
            RowField::ProductName => "productName",
            RowField::VmName => "vmName",
            RowField::Stage => "stage",
            RowField::CertMiss => "certMiss",
            RowField::Fps => "fps",
            RowField::CfnPreview => "cfnPreview",
            RowField::CfnFinal => "cfnFinal",
            RowField::Original => "original",
            RowField::PrivateFlag => "privateFlag",
            RowField::InvResFlag => "invResFlag",
        }
    }

    fn kind(self) -> FieldKind {
        match self {
            RowField::ProductName | RowField::VmName | RowField::Stage | RowField::Original => {
                FieldKind::Text
            }
            RowField::CertMiss | RowField::Fps | RowField::CfnPreview | RowField::CfnFinal => {
                FieldKind::Count
            }
            RowField::PrivateFlag | RowField::InvResFlag => FieldKind::Flag,
        }
    }
}

/// A single field write. `Unset` clears a text or count field; flags reset to false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Count(i64),
    Flag(bool),
    Unset,
}

impl FieldValue {
    /// Normalizes a wire value for `field`. Empty strings on count fields mean
    /// "not measured", never zero.
    pub fn from_json(field: RowField, v: &serde_json::Value) -> Result<Self> {
        let bad = |msg: &str| {
            ResultsError::validation_with(
                format!("{} {}", field.key(), msg),
                json!({ field.key(): v }),
            )
        };
        if v.is_null() {
            return Ok(FieldValue::Unset);
        }
        match field.kind() {
            FieldKind::Text => v
                .as_str()
                .map(|s| FieldValue::Text(s.to_string()))
                .ok_or_else(|| bad("must be a string")),
            FieldKind::Count => {
                let n = if let Some(s) = v.as_str() {
                    let s = s.trim();
                    if s.is_empty() {
                        return Ok(FieldValue::Unset);
                    }
                    s.parse::<i64>().map_err(|_| bad("must be an integer"))?
                } else {
                    v.as_i64().ok_or_else(|| bad("must be an integer"))?
                };
                if n < 0 {
                    return Err(bad("must be >= 0"));
                }
                Ok(FieldValue::Count(n))
            }
            FieldKind::Flag => v
                .as_bool()
                .map(FieldValue::Flag)
                .ok_or_else(|| bad("must be a boolean")),
        }
    }

    fn fits(&self, field: RowField) -> bool {
        matches!(
            (self, field.kind()),
            (FieldValue::Unset, _)
                | (FieldValue::Text(_), FieldKind::Text)
                | (FieldValue::Count(_), FieldKind::Count)
                | (FieldValue::Flag(_), FieldKind::Flag)
        )
    }
}

/// Field-level changes to one row. Fields not present are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPatch {
    fields: BTreeMap<RowField, FieldValue>,
}

impl RowPatch {
    pub fn new() -> Self {
        RowPatch::default()
    }

    pub fn set(&mut self, field: RowField, value: FieldValue) -> Result<()> {
        if let FieldValue::Count(n) = value {
            if n < 0 {
                return Err(ResultsError::validation_with(
                    format!("{} must be >= 0", field.key()),
                    json!({ field.key(): n }),
                ));
            }
        }
        if !value.fits(field) {
            return Err(ResultsError::validation(format!(
                "wrong value type for {}",
                field.key()
            )));
        }
        self.fields.insert(field, value);
        Ok(())
    }

    pub fn with(mut self, field: RowField, value: FieldValue) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Builds a patch from request params, ignoring keys that are not row fields.
    pub fn from_params(params: &serde_json::Value) -> Result<Self> {
        let mut patch = RowPatch::new();
        for field in RowField::ALL {
            if let Some(v) = params.get(field.key()) {
                patch.set(field, FieldValue::from_json(field, v)?)?;
            }
        }
        Ok(patch)
    }

    pub fn get(&self, field: RowField) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn merge(&mut self, other: RowPatch) {
        self.fields.extend(other.fields);
    }

    pub fn apply_to(&self, row: &mut ResultRow) {
        for (field, value) in &self.fields {
            apply_field(row, *field, value);
        }
    }
}

fn apply_field(row: &mut ResultRow, field: RowField, value: &FieldValue) {
    let text = || match value {
        FieldValue::Text(s) => Some(s.clone()),
        _ => None,
    };
    let count = || match value {
        FieldValue::Count(n) => Some(*n),
        _ => None,
    };
    let flag = || matches!(value, FieldValue::Flag(true));
    match field {
        RowField::ProductName => row.product_name = text(),
        RowField::VmName => row.vm_name = text(),
        RowField::Stage => row.stage = text(),
        RowField::Original => row.original = text(),
        RowField::CertMiss => row.cert_miss = count(),
        RowField::Fps => row.fps = count(),
        RowField::CfnPreview => row.cfn_preview = count(),
        RowField::CfnFinal => row.cfn_final = count(),
        RowField::PrivateFlag => row.private_flag = flag(),
        RowField::InvResFlag => row.inv_res_flag = flag(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaPatch {
    pub test_set_name: Option<String>,
    pub clean_sample_size: Option<i64>,
}

impl MetaPatch {
    pub fn from_params(params: &serde_json::Value) -> Result<Self> {
        let mut patch = MetaPatch::default();
        if let Some(v) = params.get("testSetName").filter(|v| !v.is_null()) {
            let name = v
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ResultsError::validation("testSetName must be a non-empty string"))?;
            patch.test_set_name = Some(name.to_string());
        }
        if let Some(v) = params.get("cleanSampleSize").filter(|v| !v.is_null()) {
            let n = v.as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                ResultsError::validation_with(
                    "cleanSampleSize must be a non-negative integer",
                    json!({ "cleanSampleSize": v }),
                )
            })?;
            patch.clean_sample_size = Some(n);
        }
        Ok(patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    pub meta: ResultPeriodMeta,
    /// True only for the call that performed the Unlocked -> Locked transition.
    pub transitioned: bool,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hex SHA-256 over the canonical JSON of `rows` in product order.
pub fn rows_digest(rows: &[ResultRow]) -> Result<String> {
    let mut sorted: Vec<&ResultRow> = rows.iter().collect();
    sorted.sort_by(|a, b| a.product_id.cmp(&b.product_id));
    let mut hasher = Sha256::new();
    for row in sorted {
        let bytes = serde_json::to_vec(row).map_err(anyhow::Error::from)?;
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Meta alone, without loading the period's rows.
pub fn get_meta(conn: &Connection, defaults: &ResultsDefaults, period: Period) -> Result<ResultPeriodMeta> {
    Ok(read_meta(conn, period)?.unwrap_or_else(|| ResultPeriodMeta::defaults_for(period, defaults)))
}

/// Returns the stored period or materialized defaults. Never writes.
pub fn get_period(conn: &Connection, defaults: &ResultsDefaults, period: Period) -> Result<PeriodView> {
    let meta = get_meta(conn, defaults, period)?;
    let rows = if meta.persisted {
        list_rows(conn, period)?
    } else {
        Vec::new()
    };
    Ok(PeriodView { meta, rows })
}

pub fn upsert_row(
    conn: &mut Connection,
    defaults: &ResultsDefaults,
    period: Period,
    product_id: &str,
    patch: &RowPatch,
) -> Result<ResultRow> {
    let product_id = product_id.trim();
    if product_id.is_empty() {
        return Err(ResultsError::validation("productId must be a non-empty string"));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_rfc3339();
    let meta = ensure_meta(&tx, defaults, period, &now)?;
    if let Err(e) = snapshot::ensure_editable(&meta) {
        tracing::warn!(%period, product_id, "rejected row write on locked period");
        return Err(e);
    }

    let mut row = read_row(&tx, period, product_id)?.unwrap_or_else(|| ResultRow::new(product_id));
    patch.apply_to(&mut row);
    row.updated_at = Some(now);

    tx.execute(
        "INSERT INTO result_rows(
            id, year, month, product_id, product_name, vm_name, stage,
            cert_miss, fps, cfn_preview, cfn_final, original,
            private_flag, inv_res_flag, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(year, month, product_id) DO UPDATE SET
           product_name = excluded.product_name,
           vm_name = excluded.vm_name,
           stage = excluded.stage,
           cert_miss = excluded.cert_miss,
           fps = excluded.fps,
           cfn_preview = excluded.cfn_preview,
           cfn_final = excluded.cfn_final,
           original = excluded.original,
           private_flag = excluded.private_flag,
           inv_res_flag = excluded.inv_res_flag,
           updated_at = excluded.updated_at",
        params![
            Uuid::new_v4().to_string(),
            period.year,
            period.month,
            row.product_id,
            row.product_name,
            row.vm_name,
            row.stage,
            row.cert_miss,
            row.fps,
            row.cfn_preview,
            row.cfn_final,
            row.original,
            row.private_flag,
            row.inv_res_flag,
            row.updated_at,
        ],
    )?;
    tx.commit()?;
    tracing::debug!(%period, product_id, fields = patch.len(), "row upserted");
    Ok(row)
}

/// Merges meta fields. Lock state is never touched here.
pub fn patch_meta(
    conn: &mut Connection,
    defaults: &ResultsDefaults,
    period: Period,
    patch: &MetaPatch,
) -> Result<ResultPeriodMeta> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_rfc3339();
    let meta = ensure_meta(&tx, defaults, period, &now)?;
    if let Err(e) = snapshot::ensure_editable(&meta) {
        tracing::warn!(%period, "rejected meta write on locked period");
        return Err(e);
    }
    tx.execute(
        "UPDATE result_periods SET
           test_set_name = COALESCE(?, test_set_name),
           clean_sample_size = COALESCE(?, clean_sample_size),
           updated_at = ?
         WHERE year = ? AND month = ?",
        params![
            patch.test_set_name,
            patch.clean_sample_size,
            now,
            period.year,
            period.month
        ],
    )?;
    let meta = load_meta(&tx, period)?;
    tx.commit()?;
    Ok(meta)
}

/// Locks the period. Only the first caller stamps `snapshot_at`; later calls
/// return the stored meta unchanged.
pub fn lock_period(
    conn: &mut Connection,
    defaults: &ResultsDefaults,
    period: Period,
) -> Result<LockOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_rfc3339();
    ensure_meta(&tx, defaults, period, &now)?;
    let digest = rows_digest(&list_rows(&tx, period)?)?;
    let changed = tx.execute(
        "UPDATE result_periods SET
           locked = 1,
           snapshot_at = ?,
           snapshot_digest = ?,
           updated_at = ?
         WHERE year = ? AND month = ? AND locked = 0",
        params![now, digest, now, period.year, period.month],
    )?;
    let meta = load_meta(&tx, period)?;
    tx.commit()?;

    let transitioned = changed == 1;
    if transitioned {
        tracing::info!(%period, snapshot_at = ?meta.snapshot_at, "period locked");
    } else {
        tracing::debug!(%period, "period already locked");
    }
    Ok(LockOutcome { meta, transitioned })
}

fn ensure_meta(
    conn: &Connection,
    defaults: &ResultsDefaults,
    period: Period,
    now: &str,
) -> Result<ResultPeriodMeta> {
    conn.execute(
        "INSERT INTO result_periods(year, month, test_set_name, clean_sample_size, locked, created_at, updated_at)
         VALUES(?, ?, ?, ?, 0, ?, ?)
         ON CONFLICT(year, month) DO NOTHING",
        params![
            period.year,
            period.month,
            defaults.test_set_name,
            defaults.clean_sample_size,
            now,
            now
        ],
    )?;
    load_meta(conn, period)
}

fn load_meta(conn: &Connection, period: Period) -> Result<ResultPeriodMeta> {
    read_meta(conn, period)?.ok_or(ResultsError::Store(rusqlite::Error::QueryReturnedNoRows))
}

fn read_meta(conn: &Connection, period: Period) -> Result<Option<ResultPeriodMeta>> {
    let meta = conn
        .query_row(
            "SELECT test_set_name, clean_sample_size, locked, snapshot_at, snapshot_digest, created_at, updated_at
             FROM result_periods
             WHERE year = ? AND month = ?",
            (period.year, period.month),
            |r| {
                Ok(ResultPeriodMeta {
                    year: period.year,
                    month: period.month,
                    test_set_name: r.get(0)?,
                    clean_sample_size: r.get(1)?,
                    locked: r.get::<_, i64>(2)? != 0,
                    snapshot_at: r.get(3)?,
                    snapshot_digest: r.get(4)?,
                    created_at: r.get(5)?,
                    updated_at: r.get(6)?,
                    persisted: true,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

const ROW_COLUMNS: &str = "product_id, product_name, vm_name, stage, cert_miss, fps,
    cfn_preview, cfn_final, original, private_flag, inv_res_flag, updated_at";

fn row_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok(ResultRow {
        product_id: r.get(0)?,
        product_name: r.get(1)?,
        vm_name: r.get(2)?,
        stage: r.get(3)?,
        cert_miss: r.get(4)?,
        fps: r.get(5)?,
        cfn_preview: r.get(6)?,
        cfn_final: r.get(7)?,
        original: r.get(8)?,
        private_flag: r.get::<_, i64>(9)? != 0,
        inv_res_flag: r.get::<_, i64>(10)? != 0,
        updated_at: r.get(11)?,
    })
}

fn read_row(conn: &Connection, period: Period, product_id: &str) -> Result<Option<ResultRow>> {
    let sql = format!(
        "SELECT {} FROM result_rows WHERE year = ? AND month = ? AND product_id = ?",
        ROW_COLUMNS
    );
    let row = conn
        .query_row(&sql, (period.year, period.month, product_id), row_from_sql)
        .optional()?;
    Ok(row)
}

fn list_rows(conn: &Connection, period: Period) -> Result<Vec<ResultRow>> {
    let sql = format!(
        "SELECT {} FROM result_rows WHERE year = ? AND month = ? ORDER BY product_id",
        ROW_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((period.year, period.month), row_from_sql)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
