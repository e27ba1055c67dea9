use std::{path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::warn;

use crate::{error::Error, torrent::PieceStrategy};

/// Settings of a download session.
///
/// Every field has a default, a config file may set only some of them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// First port tried for the listener of inbound peers.
    pub port_range_start: u16,
    /// Last port tried, inclusive.
    pub port_range_end: u16,

    pub connect_timeout_secs: u64,
    /// How many times a peer is dialed before giving up on it. Retries back
    /// off exponentially.
    pub connect_attempts: u32,

    pub handshake_timeout_secs: u64,

    /// A requested block that did not arrive after this long goes back to
    /// the pool, the connection stays open.
    pub request_timeout_secs: u64,

    /// A peer that sends nothing for this long is disconnected.
    pub idle_timeout_secs: u64,
    pub keep_alive_secs: u64,

    /// Maximum number of outstanding requests per peer.
    pub max_pending_requests: usize,

    /// Hash failures tolerated from one peer before it is banned.
    pub max_peer_failures: u32,

    pub max_peers: usize,

    pub piece_strategy: PieceStrategy,

    /// Write logs to a file in the config dir.
    pub log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_range_start: 6881,
            port_range_end: 6889,
            connect_timeout_secs: 10,
            connect_attempts: 3,
            handshake_timeout_secs: 10,
            request_timeout_secs: 30,
            idle_timeout_secs: 120,
            keep_alive_secs: 120,
            max_pending_requests: 5,
            max_peer_failures: 3,
            max_peers: 50,
            piece_strategy: PieceStrategy::default(),
            log: false,
        }
    }
}

impl Config {
    /// Path of the config dir, created if it does not exist.
    pub async fn config_dir() -> Result<PathBuf, Error> {
        // errors if the user does not have a home folder
        let dotfile =
            ProjectDirs::from("", "", "Tessera").ok_or(Error::HomeInvalid)?;
        let config_path = dotfile.config_dir().to_path_buf();

        // If the user has a home folder, but for some reason we cant open it
        if !config_path.exists() {
            create_dir_all(&config_path).await.map_err(|_| {
                Error::FolderOpenError(config_path.display().to_string())
            })?
        }

        Ok(config_path)
    }

    /// Returns the path of the configuration file.
    ///
    /// If it doesn't exist, or is not a valid config, the default
    /// configuration is written to it.
    ///
    /// # Errors
    ///
    /// This fn can fail if the program does not have access to the config
    /// dir of the user.
    pub async fn config_file() -> Result<PathBuf, Error> {
        let mut config_path = Self::config_dir().await?;
        config_path.push("config.toml");

        // try to open the config file, and create one
        // if it doesnt exist. This will only fail if we dont
        // have permission to read or write to this path.
        let mut config_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config_path)
            .await?;

        let mut dst = String::new();
        config_file.read_to_string(&mut dst).await?;

        // it could also be empty, in both cases we write the default
        if let Err(e) = toml::from_str::<Config>(&dst) {
            if !dst.is_empty() {
                warn!("invalid config file, writing the default: {e}");
            }
            let config_str = toml::to_string(&Config::default())?;
            config_file.set_len(0).await?;
            config_file.rewind().await?;
            config_file.write_all(config_str.as_bytes()).await?;
            config_file.flush().await?;
        }

        Ok(config_path)
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist, it tries to create the file
    /// with the default configurations.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_file().await?;
        let config_str = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let mut config = toml::from_str::<Config>(s)?;
        config.sanitize();
        Ok(config)
    }

    /// Fix values that would stall the session: zero durations, counts and
    /// limits become 1, a reversed port range is swapped.
    ///
    /// Call it again after changing fields by hand.
    pub fn sanitize(&mut self) {
        if self.port_range_end < self.port_range_start {
            std::mem::swap(&mut self.port_range_start, &mut self.port_range_end);
        }

        for secs in [
            &mut self.connect_timeout_secs,
            &mut self.handshake_timeout_secs,
            &mut self.request_timeout_secs,
            &mut self.idle_timeout_secs,
            &mut self.keep_alive_secs,
        ] {
            *secs = (*secs).max(1);
        }

        self.connect_attempts = self.connect_attempts.max(1);
        self.max_peer_failures = self.max_peer_failures.max(1);
        self.max_pending_requests = self.max_pending_requests.max(1);
        self.max_peers = self.max_peers.max(1);
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}
