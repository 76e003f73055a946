//! Configuration display.

use console::style;

use super::icons::dim_arrow;
use crate::config::Config;

/// Print the effective configuration (file values plus env overrides).
pub fn cmd_config_show(config: &Config, json: bool) -> anyhow::Result<()> {
    let source = config
        .source_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    eprintln!("{} Source: {}", dim_arrow(), style(source).dim());

    let rendered = if json {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };
    println!("{}", rendered);
    Ok(())
}
