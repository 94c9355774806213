use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Write the default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, explicit: Option<&str>) -> Result<i32> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&format, explicit)?,
        ConfigCommands::Path => println!("{}", config_path(explicit)?.display()),
        ConfigCommands::Init { force } => init_config(force, explicit)?,
    }
    Ok(0)
}

fn config_path(explicit: Option<&str>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).to_string())),
        None => Config::config_path(),
    }
}

fn show_config(format: &str, explicit: Option<&str>) -> Result<()> {
    let config = super::load_config(explicit)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => bail!("Unknown format '{}': expected toml or json", other),
    }
    Ok(())
}

fn init_config(force: bool, explicit: Option<&str>) -> Result<()> {
    let path = config_path(explicit)?;

    if path.exists() && !force {
        bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
