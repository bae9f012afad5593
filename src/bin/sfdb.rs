//! The sfdb server: loads the configuration and token registry, opens the
//! store, and serves the TCP shell.

use sfdb::config::Config;
use sfdb::error::Result;
use sfdb::server::{Lockdown, Server, Tokens};
use sfdb::storage::{Store, StoreOptions};

use clap::Parser as _;
use std::path::PathBuf;
use std::time::Duration;

#[derive(clap::Parser)]
#[command(name = "sfdb", version, about = "An in-memory key/value store with on-disk durability")]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', long, default_value = "sfdb.yaml")]
    config: String,
    /// Access token file.
    #[arg(short = 't', long, default_value = "tokens.json")]
    tokens: String,
}

fn main() {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = init_logging(&config) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }
    if let Err(err) = serve(&args, config) {
        log::error!("sfdb failed: {err}");
        std::process::exit(1);
    }
}

fn serve(args: &Args, config: Config) -> Result<()> {
    if config.meids.encrypt {
        log::warn!("meids.encrypt is not supported, shard files are stored in plaintext");
    }

    let tokens = Tokens::load(&args.tokens)?;
    let store = Store::open(
        PathBuf::from(&config.dir.database),
        StoreOptions {
            signature: tokens.signature_bytes()?,
            shards: config.meids.count,
            permission: config.meids.permission,
            entry_limit: config.entry_size_limit()?,
            memory_limit: config.memory_limit()?,
            persistent: config.persistent.enabled,
            backup_limit: config.backup_size_limit()?,
            ..StoreOptions::default()
        },
    )?;
    let lockdown = Lockdown::load(
        config.server.cli_lockdown,
        config.server.max_cli_login_attempt,
        Duration::from_secs(config.server.cli_cooldown),
        PathBuf::from(".lockdown"),
    );
    Server::new(config, tokens, store, lockdown)?.serve()
}

fn init_logging(config: &Config) -> Result<()> {
    if !config.logs.enabled {
        return Ok(());
    }
    let mut builder = simplelog::ConfigBuilder::new();
    if !config.logs.show_time {
        builder.set_time_level(simplelog::LevelFilter::Off);
    } else if config.logs.time_format == "rfc2822" {
        builder.set_time_format_rfc2822();
    } else {
        builder.set_time_format_rfc3339();
    }
    let log_config = builder.build();
    let color = match config.logs.use_colors {
        true => simplelog::ColorChoice::Auto,
        false => simplelog::ColorChoice::Never,
    };
    std::fs::create_dir_all(&config.dir.logs)?;
    let file = std::fs::File::create(PathBuf::from(&config.dir.logs).join("sfdb.log"))?;
    simplelog::CombinedLogger::init(vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            log_config.clone(),
            simplelog::TerminalMode::Mixed,
            color,
        ),
        simplelog::WriteLogger::new(simplelog::LevelFilter::Info, log_config, file),
    ])?;
    Ok(())
}
