//! Status command - Display stored payloads
//!
//! Provides the `parcel status` CLI command which:
//! 1. Lists deliverable payloads and cached snapshots in delivery order
//! 2. Shows per-type counts and storage usage against the configured limit
//! 3. Lists quarantined (dropped) payloads with `--dropped`

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Args;
use parcel_storage::payload_store::StoredPayload;
use parcel_storage::FilePayloadStorageService;
use tracing::info;

use super::{CommandContext, Stores};
use crate::output::{format_bytes, get_formatter, OutputFormatter};

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Also list payloads quarantined as undeliverable
    #[arg(long)]
    pub dropped: bool,
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let config = ctx.load_config()?;
        let formatter = get_formatter(ctx.format);
        let stores = Stores::open(&config);
        info!(files_dir = %config.storage.files_dir.display(), "Showing payload status");

        let (files_used, cache_used) = stores.storage.get_storage_used();
        let available = stores.storage.get_storage_available();

        if ctx.format.is_json() {
            let locations: Vec<serde_json::Value> = stores
                .all()
                .iter()
                .map(|store| self.store_json(store))
                .collect();
            let json = serde_json::json!({
                "files_dir": config.storage.files_dir.display().to_string(),
                "cache_dir": config.storage.cache_dir.display().to_string(),
                "storage_used_bytes": { "files": files_used, "cache": cache_used },
                "storage_available_bytes": available,
                "max_payload_storage_bytes": config.storage.max_payload_storage_bytes,
                "locations": locations,
            });
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success(&format!("Storage at {}", config.storage.files_dir.display()));
        formatter.field("files", &format_bytes(files_used));
        formatter.field("cache", &format_bytes(cache_used));
        if let Some(available) = available {
            formatter.field("available", &format_bytes(available));
        }
        for store in stores.all() {
            formatter.info("");
            self.print_store(store, config.storage.max_payload_storage_bytes, &*formatter);
        }
        Ok(())
    }

    fn print_store(&self, store: &FilePayloadStorageService, limit: u64, formatter: &dyn OutputFormatter) {
        let payloads = store.list_payloads();
        formatter.info(&format!(
            "{}: {} payload{} ({} of {})",
            store.location().dir_name(),
            payloads.len(),
            if payloads.len() == 1 { "" } else { "s" },
            format_bytes(store.storage_used()),
            format_bytes(limit)
        ));
        for (envelope_type, count) in count_by_type(&payloads) {
            formatter.field(envelope_type, &count.to_string());
        }
        for payload in &payloads {
            formatter.info(&format!("  {}", describe(payload)));
        }

        if self.dropped {
            let dropped = store.list_dropped();
            formatter.field("dropped", &dropped.len().to_string());
            for payload in &dropped {
                formatter.info(&format!("    {}", describe(payload)));
            }
        }
    }

    fn store_json(&self, store: &FilePayloadStorageService) -> serde_json::Value {
        let payloads = store.list_payloads();
        let mut json = serde_json::json!({
            "location": store.location().dir_name(),
            "used_bytes": store.storage_used(),
            "counts": count_by_type(&payloads),
            "payloads": payloads.iter().map(payload_json).collect::<Vec<_>>(),
        });
        if self.dropped {
            json["dropped"] = store.list_dropped().iter().map(payload_json).collect();
        }
        json
    }
}

fn count_by_type(payloads: &[StoredPayload]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for payload in payloads {
        *counts.entry(payload.metadata.envelope_type().description()).or_insert(0) += 1;
    }
    counts
}

fn created_at(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn describe(payload: &StoredPayload) -> String {
    let m = &payload.metadata;
    format!(
        "{:<8} {}  {:>10}  {}{}",
        m.envelope_type().description(),
        created_at(m.timestamp()),
        format_bytes(payload.file.size_bytes),
        m.uuid(),
        if m.complete() { "" } else { " (incomplete)" }
    )
}

fn payload_json(payload: &StoredPayload) -> serde_json::Value {
    let m = &payload.metadata;
    serde_json::json!({
        "filename": m.filename(),
        "envelope_type": m.envelope_type().description(),
        "created_at": created_at(m.timestamp()),
        "process_id": m.process_id(),
        "complete": m.complete(),
        "size_bytes": payload.file.size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use parcel_core::domain::{EnvelopeType, StoredTelemetryMetadata};
    use parcel_storage::storage::StoredFile;

    use super::*;

    fn payload(ty: EnvelopeType, ts: i64) -> StoredPayload {
        let metadata = StoredTelemetryMetadata::new(ts, "u1", "p1", ty, true).unwrap();
        StoredPayload {
            file: StoredFile {
                name: metadata.filename(),
                path: PathBuf::from(metadata.filename()),
                size_bytes: 2048,
            },
            metadata,
        }
    }

    #[test]
    fn test_count_by_type() {
        let payloads = vec![
            payload(EnvelopeType::Crash, 1),
            payload(EnvelopeType::Log, 2),
            payload(EnvelopeType::Log, 3),
        ];
        let counts = count_by_type(&payloads);
        assert_eq!(counts.get("crash"), Some(&1));
        assert_eq!(counts.get("log"), Some(&2));
        assert_eq!(counts.get("session"), None);
    }

    #[test]
    fn test_payload_json() {
        let json = payload_json(&payload(EnvelopeType::Session, 0));
        assert_eq!(json["envelope_type"], "session");
        assert_eq!(json["created_at"], "1970-01-01T00:00:00+00:00");
        assert_eq!(json["size_bytes"], 2048);
        assert_eq!(json["complete"], true);
    }
}
