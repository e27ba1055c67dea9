//! Disk is responsible for the file I/O of a torrent.
//!
//! It only ever sees verified pieces, the torrent hands them over in any
//! order and the disk writes each one at its offset in the output file.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{
        mpsc::{self, Receiver},
        oneshot::Sender,
    },
};
use tracing::{debug, info};

use crate::{error::Error, metainfo::Info};

#[derive(Debug)]
pub enum DiskMsg {
    /// Write a verified piece at `index * piece_length`.
    WritePiece { index: usize, data: Vec<u8> },

    /// Flush the file and stop, the sender is notified once everything is on
    /// disk.
    Quit(Sender<()>),
}

#[derive(Debug)]
pub struct Disk {
    pub tx: mpsc::Sender<DiskMsg>,
    rx: Receiver<DiskMsg>,
    path: PathBuf,
    piece_length: u32,
    length: u64,
    /// Number of pieces written so far.
    written: usize,
}

impl Disk {
    pub fn new(path: impl Into<PathBuf>, info: &Info) -> Self {
        let (tx, rx) = mpsc::channel::<DiskMsg>(100);

        Self {
            tx,
            rx,
            path: path.into(),
            piece_length: info.piece_length,
            length: info.length,
            written: 0,
        }
    }

    /// Open, or create, the output file with its final size.
    pub async fn open_file(path: &Path, length: u64) -> Result<File, Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent).await.map_err(|_| {
                Error::FolderOpenError(parent.display().to_string())
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        file.set_len(length).await?;

        Ok(file)
    }

    #[tracing::instrument(
        skip(self),
        name = "disk::run",
        fields(path = %self.path.display())
    )]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("disk started event loop");

        let mut file = Self::open_file(&self.path, self.length).await?;

        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskMsg::WritePiece { index, data } => {
                    debug!("WritePiece {index}");
                    self.write_piece(&mut file, index, &data).await?;
                }
                DiskMsg::Quit(ack) => {
                    file.flush().await?;
                    file.sync_all().await?;
                    info!("wrote {} pieces to {:?}", self.written, self.path);
                    let _ = ack.send(());
                    return Ok(());
                }
            }
        }

        file.flush().await?;

        Ok(())
    }

    async fn write_piece(
        &mut self,
        file: &mut File,
        index: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let offset = index as u64 * self.piece_length as u64;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        self.written += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};
    use tokio::sync::oneshot;

    use super::*;
    use crate::metainfo::PieceHash;

    fn temp_path() -> PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("tessera-{name}")).join("out.bin")
    }

    #[tokio::test]
    async fn writes_pieces_at_their_offset() {
        let info = Info {
            name: None,
            length: 10,
            piece_length: 4,
            pieces: vec![PieceHash::default(); 3],
        };
        let path = temp_path();
        let mut disk = Disk::new(&path, &info);
        let tx = disk.tx.clone();

        let handle = tokio::spawn(async move { disk.run().await });

        // out of order
        tx.send(DiskMsg::WritePiece { index: 2, data: vec![3, 3] }).await.unwrap();
        tx.send(DiskMsg::WritePiece { index: 0, data: vec![1; 4] }).await.unwrap();
        tx.send(DiskMsg::WritePiece { index: 1, data: vec![2; 4] }).await.unwrap();

        let (ack, rx) = oneshot::channel();
        tx.send(DiskMsg::Quit(ack)).await.unwrap();
        rx.await.unwrap();
        handle.await.unwrap().unwrap();

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3]);

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }
}
