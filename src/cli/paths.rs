//! CLI subcommand: `cortex-sandbox paths`
//!
//! Prints all resolved XDG paths for debugging and scripting.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<i32> {
    let paths = Paths::resolve()?;

    println!("cortex-sandbox Paths (XDG Base Directory)");
    println!("==========================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  workspace:      {}", paths.workspace.display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  snapshots:      {}", paths.snapshots_dir().display());
    println!();
    println!("Cache:      {}", paths.cache_dir.display());

    Ok(0)
}
