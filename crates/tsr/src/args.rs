use std::path::PathBuf;

use clap::Parser;
use tessera::torrent::PieceStrategy;

/// Download the file of a .torrent.
#[derive(Parser, Debug)]
#[clap(name = "tsr")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Path of the .torrent file.
    pub torrent: PathBuf,

    /// Where to write the downloaded file, defaults to the name in the
    /// torrent.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// First port of the range tried for the listener of inbound peers.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Order in which pieces are downloaded: sequential or rarest.
    #[clap(short, long)]
    pub strategy: Option<PieceStrategy>,

    /// Also write the logs to this file.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Log debug messages, RUST_LOG takes precedence.
    #[clap(short, long)]
    pub verbose: bool,
}
