use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cortex_sandbox::cli::{self, Cli, Commands};
use cortex_sandbox::config::{Config, LogFormat, LoggingConfig};

fn main() -> Result<()> {
    // argv[0] dispatch: when re-exec'd as the sandbox child, enter sandbox
    // setup immediately, before Tokio, Clap, or any other initialization.
    #[cfg(unix)]
    if let Some(arg0) = std::env::args_os().next()
        && arg0
            .to_string_lossy()
            .ends_with(cortex_sandbox::sandbox::CHILD_ARGV0)
    {
        cortex_sandbox::sandbox::sandbox_child_main();
    }

    let cli = Cli::parse();

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn async_main(cli: Cli) -> Result<i32> {
    let verbose = cli.verbose;
    let config_flag = cli.config.as_deref();

    match cli.command {
        Commands::Paths => {
            init_logging(verbose, None);
            cli::paths::run()
        }
        Commands::Config(args) => {
            init_logging(verbose, None);
            cli::config::run(args, config_flag)
        }
        Commands::Run(args) => cli::run::run(args, setup(verbose, config_flag)?).await,
        Commands::Validate(args) => cli::run::validate(args, setup(verbose, config_flag)?),
        Commands::Audit(args) => cli::audit::run(args, &setup(verbose, config_flag)?),
        Commands::Snapshot(args) => cli::snapshot::run(args, setup(verbose, config_flag)?),
        Commands::Sandbox(args) => cli::sandbox::run(args, setup(verbose, config_flag)?).await,
    }
}

fn setup(verbose: bool, config_flag: Option<&str>) -> Result<Config> {
    let config = cli::load_config(config_flag)?;
    init_logging(verbose, Some(&config.logging));
    Ok(config)
}

/// Logs go to stderr so `run` output stays clean. RUST_LOG wins, then
/// `--verbose`, then `logging.level`.
fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let level = if verbose {
        "debug"
    } else {
        logging.map(|l| l.level.as_str()).unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.is_some_and(|l| l.format == LogFormat::Json) {
        builder.json().init();
    } else {
        builder.init();
    }
}
