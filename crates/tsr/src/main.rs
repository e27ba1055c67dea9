use std::{path::PathBuf, process::exit};

use clap::Parser;
use tessera::{
    config::Config,
    disk::Disk,
    error::Error,
    metainfo::MetaInfo,
    torrent::Torrent,
};
use tokio::spawn;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use args::Args;

mod args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load the config file, using defaults: {e}");
            Config::default()
        }
    };

    let log_file = match (&args.log_file, config.log) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => {
            Config::config_dir().await.ok().map(|d| d.join("tsr.log"))
        }
        (None, false) => None,
    };

    let guard = init_tracing(args.verbose, log_file);

    if let Some(port) = args.port {
        let len = config.port_range_end.saturating_sub(config.port_range_start);
        config.port_range_start = port;
        config.port_range_end = port.saturating_add(len);
    }
    if let Some(strategy) = args.strategy {
        config.piece_strategy = strategy;
    }
    config.sanitize();

    if let Err(e) = download(args.torrent, args.output, config).await {
        error!("{e}");
        eprintln!("error: {e}");
        // exit skips destructors, flush the log file first
        drop(guard);
        exit(1);
    }
}

/// Install the global subscriber, logging to stderr and optionally to a
/// file. The returned guard flushes the file when dropped.
fn init_tracing(
    verbose: bool,
    log_file: Option<PathBuf>,
) -> Option<WorkerGuard> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));

    let stderr = fmt::layer().without_time().with_writer(std::io::stderr);

    let (file, guard) = match log_file.as_deref() {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "tsr.log".into());
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or(".".as_ref()), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();

    guard
}

async fn download(
    torrent: PathBuf,
    output: Option<PathBuf>,
    config: Config,
) -> Result<(), Error> {
    let bytes = tokio::fs::read(&torrent).await?;
    let meta_info = MetaInfo::from_bytes(&bytes)?;

    info!(
        "{} info hash {}, {} pieces",
        torrent.display(),
        meta_info.info_hash,
        meta_info.info.pieces()
    );

    let output = output.unwrap_or_else(|| {
        let name = meta_info
            .info
            .name
            .clone()
            .unwrap_or_else(|| meta_info.info_hash.to_string());
        PathBuf::from(name)
    });

    let mut disk = Disk::new(&output, &meta_info.info);
    let disk_tx = disk.tx.clone();

    spawn(async move {
        if let Err(e) = disk.run().await {
            warn!("disk stopped: {e}");
        }
    });

    let torrent = Torrent::new(meta_info, config, disk_tx);
    let mut torrent = torrent.start().await?;
    torrent.run().await?;

    info!("saved to {}", output.display());

    Ok(())
}
