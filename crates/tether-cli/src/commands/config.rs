//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tether_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "relay_url": config.relay_url,
                    "user_id": config.user_id,
                    "token_set": config.token.is_some(),
                    "contacts": config.contacts,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:  {}", config.data_dir.display());
            println!(
                "  relay_url: {}",
                config.relay_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  user_id:   {}",
                config.user_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  token:     {}",
                if config.token.is_some() { "(set)" } else { "(not set)" }
            );
            if !config.contacts.is_empty() {
                println!("  contacts:  {}", config.contacts.join(", "));
            }
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;

    match key.as_str() {
        "data_dir" => config.data_dir = PathBuf::from(&value),
        "relay_url" => {
            if !value.starts_with("ws://") && !value.starts_with("wss://") {
                bail!("relay_url must be a ws:// or wss:// URL");
            }
            config.relay_url = Some(value.clone());
        }
        "user_id" => config.user_id = Some(value.clone()),
        "token" => config.token = Some(value.clone()),
        _ => bail!(
            "Unknown config key: {} (valid: data_dir, relay_url, user_id, token)",
            key
        ),
    }

    config.save().context("Failed to save configuration")?;
    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}
