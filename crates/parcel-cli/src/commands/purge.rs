//! Purge command - Delete stored payloads

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::{CommandContext, Stores};
use crate::output::get_formatter;

#[derive(Debug, Args)]
pub struct PurgeCommand {
    /// Delete only quarantined (dropped) payloads
    #[arg(long)]
    pub dropped: bool,
}

impl PurgeCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let stores = Stores::open(&ctx.load_config()?);

        let mut counts = serde_json::Map::new();
        let mut total = 0;
        for store in stores.all() {
            let deleted = if self.dropped {
                store.delete_all_dropped()
            } else {
                store.delete_all()
            };
            info!(location = store.location().dir_name(), deleted, dropped_only = self.dropped, "Purged payloads");
            counts.insert(store.location().dir_name().to_string(), deleted.into());
            total += deleted;
        }

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "dropped_only": self.dropped,
                "deleted": counts,
                "total": total,
            }));
        } else {
            let what = if self.dropped { "dropped payload" } else { "payload" };
            formatter.success(&format!("Deleted {total} {what}{}", if total == 1 { "" } else { "s" }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parcel_core::config::ConfigBuilder;
    use parcel_core::domain::{EnvelopeType, StoredTelemetryMetadata};
    use parcel_core::ports::IPayloadStore;

    use super::*;
    use crate::output::OutputFormat;

    #[tokio::test]
    async fn test_purge_deletes_every_payload() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new()
            .storage_files_dir(dir.path().join("files"))
            .storage_cache_dir(dir.path().join("cache"))
            .build();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let stores = Stores::open(&config);
        for (i, ty) in [EnvelopeType::Log, EnvelopeType::Crash].into_iter().enumerate() {
            let metadata = StoredTelemetryMetadata::new(i as i64, format!("u{i}"), "p", ty, true).unwrap();
            stores
                .payloads
                .store(&metadata, Box::new(|out: &mut dyn std::io::Write| out.write_all(b"{}")))
                .unwrap();
        }
        assert_eq!(stores.payloads.get_payloads_by_priority().len(), 2);

        let ctx = CommandContext {
            format: OutputFormat::Json,
            config_path,
        };
        PurgeCommand { dropped: false }.execute(&ctx).await.unwrap();
        assert!(stores.payloads.get_payloads_by_priority().is_empty());
    }
}
