//! Config command - View and check the delivery configuration
//!
//! Provides the `parcel config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Validates the configuration file and reports errors
//! 3. Prints the configuration file path

use anyhow::{Context, Result};
use clap::Subcommand;
use parcel_core::config::Config;
use tracing::info;

use super::CommandContext;
use crate::output::get_formatter;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            ConfigCommand::Show => self.execute_show(ctx),
            ConfigCommand::Validate => self.execute_validate(ctx),
            ConfigCommand::Path => self.execute_path(ctx),
        }
    }

    fn execute_show(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        let config = ctx.load_config()?;

        info!(config_path = %ctx.config_path.display(), "Showing configuration");

        if ctx.format.is_json() {
            let json = serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
            formatter.print_json(&json);
        } else {
            formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
            if !ctx.config_path.exists() {
                formatter.warn("File not found, showing defaults");
            }
            formatter.info("");
            let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
            for line in yaml.lines() {
                formatter.info(line);
            }
        }
        Ok(())
    }

    fn execute_validate(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = get_formatter(ctx.format);

        // Load explicitly: a missing file is a validation failure here.
        let config = match Config::load(&ctx.config_path) {
            Ok(config) => config,
            Err(e) => {
                let message = format!("{e:#}");
                if ctx.format.is_json() {
                    formatter.print_json(&serde_json::json!({
                        "valid": false,
                        "config_path": ctx.config_path.display().to_string(),
                        "errors": [message],
                    }));
                } else {
                    formatter.error(&format!("Cannot load {}: {message}", ctx.config_path.display()));
                }
                anyhow::bail!("configuration could not be loaded");
            }
        };

        let errors: Vec<String> = config.validate().iter().map(ToString::to_string).collect();
        info!(config_path = %ctx.config_path.display(), errors = errors.len(), "Validated configuration");

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "valid": errors.is_empty(),
                "config_path": ctx.config_path.display().to_string(),
                "errors": errors,
            }));
        } else if errors.is_empty() {
            formatter.success(&format!("{} is valid", ctx.config_path.display()));
        } else {
            formatter.error(&format!("{} has {} error(s):", ctx.config_path.display(), errors.len()));
            for error in &errors {
                formatter.info(&format!("  {error}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration is invalid")
        }
    }

    fn execute_path(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = get_formatter(ctx.format);
        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "config_path": ctx.config_path.display().to_string(),
                "exists": ctx.config_path.exists(),
            }));
        } else {
            println!("{}", ctx.config_path.display());
        }
        Ok(())
    }
}
