use std::{env, path::PathBuf};

use config::{Config, File};
use log::debug;
use serde::Deserialize;

use crate::cli::Args;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub token: Option<String>,
    pub bot: Option<bool>,
    pub api_url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub page_size: Option<u16>,
    pub overlap_minutes: Option<i64>,
}

const CONFIG_FILE_NAME: &str = env!("CARGO_PKG_NAME");

// Function to get the XDG_CONFIG_HOME path
fn get_xdg_config_path() -> Option<PathBuf> {
    // First check XDG_CONFIG_HOME environment variable
    if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config));
    }

    // If XDG_CONFIG_HOME is not set, fall back to $HOME/.config
    if let Ok(home) = env::var("HOME") {
        return Some(PathBuf::from(home).join(".config"));
    }

    None
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let Some(xdg_config) = get_xdg_config_path() else {
        return Ok(Settings::default());
    };

    let config_path = xdg_config.join(CONFIG_FILE_NAME).join("config.toml");
    if !config_path.exists() {
        return Ok(Settings::default());
    }

    debug!("reading settings from {}", config_path.display());
    Config::builder()
        .add_source(File::from(config_path.clone()).required(false))
        .build()?
        .try_deserialize()
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to deserialize config file {}: {}",
                config_path.display(),
                e
            )
        })
}

/// Fills whatever the command line left unset from the config file.
pub fn merge_settings_with_args(args: &Args) -> anyhow::Result<Args> {
    Ok(apply_settings(args, load_settings()?))
}

pub fn apply_settings(args: &Args, settings: Settings) -> Args {
    let mut new_args = args.clone();

    macro_rules! apply_if_unset {
        ($args:expr, $field:ident, $config:expr) => {
            if $args.$field.is_none() {
                $args.$field = $config.$field;
            }
        };
    }

    apply_if_unset!(new_args, token, settings);
    apply_if_unset!(new_args, api_url, settings);
    apply_if_unset!(new_args, output_dir, settings);
    apply_if_unset!(new_args, page_size, settings);
    apply_if_unset!(new_args, overlap_minutes, settings);

    if !new_args.bot {
        new_args.bot = settings.bot.unwrap_or(false);
    }

    debug!(
        "merged config: command {:?}, api_url {:?}, output_dir {:?}, page_size {:?}, overlap {:?}",
        new_args.command,
        new_args.api_url,
        new_args.output_dir,
        new_args.page_size,
        new_args.overlap_minutes
    );

    new_args
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn command_line_wins_over_config_file() {
        let args =
            Args::try_parse_from(["dexport", "--token", "cli", "--page-size", "20", "dm"]).unwrap();
        let settings = Settings {
            token: Some("file".to_string()),
            bot: Some(true),
            page_size: Some(100),
            overlap_minutes: Some(5),
            ..Default::default()
        };

        let merged = apply_settings(&args, settings);
        assert_eq!(merged.token.as_deref(), Some("cli"));
        assert_eq!(merged.page_size, Some(20));
        assert_eq!(merged.overlap_minutes, Some(5));
        assert!(merged.bot);
    }
}
