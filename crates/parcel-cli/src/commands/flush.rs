//! Flush command - Deliver stored payloads now
//!
//! Provides the `parcel flush` CLI command which:
//! 1. Resurrects payloads left behind by earlier processes
//! 2. Runs one delivery pass over every stored payload
//! 3. Reports what was delivered, dropped or left for a later retry

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use parcel_delivery::{DeliveryModule, ResurrectionReport};
use tracing::{info, warn};

use super::CommandContext;
use crate::output::get_formatter;

#[derive(Debug, Args)]
pub struct FlushCommand {
    /// Give up after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

impl FlushCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let config = ctx.load_config()?;
        let endpoint = config.delivery.endpoint.clone();
        let module = DeliveryModule::from_config(config).context("Failed to set up delivery")?;

        info!(endpoint = %endpoint, timeout_secs = self.timeout, "Flushing stored payloads");
        let resurrection = module.resurrect().await;
        let outcome = tokio::time::timeout(Duration::from_secs(self.timeout), module.scheduling().flush()).await;
        module.shutdown().await;

        let Ok(report) = outcome else {
            warn!(timeout_secs = self.timeout, "Flush timed out");
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "success": false,
                    "error": format!("timed out after {}s", self.timeout),
                }));
            } else {
                formatter.error(&format!("Flush timed out after {}s", self.timeout));
            }
            anyhow::bail!("flush timed out");
        };

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "endpoint": endpoint,
                "resurrected": resurrection.resurrected,
                "resurrection_failures": resurrection.failed,
                "native_crashes_sent": resurrection.native_crashes_sent,
                "attempted": report.attempted,
                "delivered": report.delivered,
                "dropped": report.dropped,
                "remaining": report.remaining,
            }));
            return Ok(());
        }

        if report.attempted == 0 && resurrection == ResurrectionReport::default() {
            formatter.success("Nothing to deliver");
            return Ok(());
        }
        formatter.success(&format!("Flushed stored payloads to {endpoint}"));
        if resurrection.resurrected > 0 || resurrection.failed > 0 {
            formatter.field("resurrected", &resurrection.resurrected.to_string());
            formatter.field("failed", &resurrection.failed.to_string());
        }
        formatter.field("attempted", &report.attempted.to_string());
        formatter.field("delivered", &report.delivered.to_string());
        formatter.field("dropped", &report.dropped.to_string());
        formatter.field("remaining", &report.remaining.to_string());
        if report.dropped > 0 {
            formatter.warn(&format!("{} payload(s) quarantined as undeliverable", report.dropped));
        }
        Ok(())
    }
}
