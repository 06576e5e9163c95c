use crate::results::{PeriodView, ResultPeriodMeta, ResultRow};
use crate::snapshot;
use anyhow::{anyhow, bail, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const PERIOD_ENTRY: &str = "period.json";
pub const BUNDLE_FORMAT_V1: &str = "resultsd-snapshot-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub row_count: usize,
    pub snapshot_digest: String,
}

#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    pub meta: ResultPeriodMeta,
    pub rows: Vec<ResultRow>,
    pub digest_matches: bool,
}

/// Writes a locked period's meta and rows to a zip bundle at `out_path`.
pub fn export_period_bundle(view: &PeriodView, out_path: &Path) -> anyhow::Result<ExportSummary> {
    if !view.meta.locked {
        bail!(
            "period {} is not locked; only snapshots can be exported",
            view.meta.period()
        );
    }
    let digest = view
        .meta
        .snapshot_digest
        .clone()
        .ok_or_else(|| anyhow!("period {} has no snapshot digest", view.meta.period()))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": crate::results::now_rfc3339(),
        "period": view.meta.period().to_string(),
        "snapshotDigest": digest,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(PERIOD_ENTRY, opts)
        .context("failed to start period entry")?;
    zip.write_all(
        serde_json::to_string_pretty(view)
            .context("failed to serialize period")?
            .as_bytes(),
    )
    .context("failed to write period entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2,
        row_count: view.rows.len(),
        snapshot_digest: digest,
    })
}

/// Reads a bundle back and recomputes the row digest.
pub fn read_period_bundle(in_path: &Path) -> anyhow::Result<VerifiedBundle> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut period_text = String::new();
    archive
        .by_name(PERIOD_ENTRY)
        .context("bundle missing period.json")?
        .read_to_string(&mut period_text)
        .context("failed to read period.json")?;
    let view: PeriodView =
        serde_json::from_str(&period_text).context("period.json is invalid")?;

    let manifest_digest = manifest.get("snapshotDigest").and_then(|v| v.as_str());
    let rows_match = snapshot::digest_matches(&view.meta, &view.rows)
        .context("failed to hash bundled rows")?;
    let digest_matches = manifest_digest == view.meta.snapshot_digest.as_deref() && rows_match;

    Ok(VerifiedBundle {
        meta: view.meta,
        rows: view.rows,
        digest_matches,
    })
}
