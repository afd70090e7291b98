use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};
use crate::{
    block::{BlockData, BlockInfo},
    p2p::{PeerCommand, PeerTx},
    store::{FileInfo, StoreInfo},
    torrent::{CommandToTorrent, TorrentTx},
    ID,
};

pub const DISK_QUEUE_LIMIT: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),

    #[error("piece length mismatch: got {got}, expected {expected}")]
    InvalidPieceLength { got: usize, expected: usize },

    #[error("block out of piece bounds: {0:?}")]
    BlockOutOfBounds(BlockInfo),

    #[error("channel error: {0}")]
    ChannelError(String),
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::Sender<DiskCommand>;
pub type DiskRx = mpsc::Receiver<DiskCommand>;

pub enum DiskCommand {
    // A verified piece ready to be persisted.
    WritePiece { idx: u32, data: Vec<u8> },

    // From peers requesting blocks; the read data is sent back
    // through the provided session channel.
    ReadBlock { block: BlockInfo, tx: PeerTx },

    // Flush and stop the disk task.
    Shutdown,
}

#[derive(Debug)]
struct TorrentFile {
    info: FileInfo,
    handle: fs::File,
}

impl TorrentFile {
    fn create(dir: &std::path::Path, info: FileInfo) -> Result<Self> {
        let path = dir.join(&info.path);
        if let Some(subdir) = path.parent() {
            if !subdir.exists() {
                tracing::debug!("creating sub-directory: {:?}", subdir);
                fs::create_dir_all(subdir)?;
            }
        }

        tracing::debug!("creating file: {:?}", &path);
        let handle = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // Pre-allocate to the declared length.
        handle.set_len(info.length as u64)?;

        Ok(Self { info, handle })
    }
}

// Maps piece space onto byte ranges of the backing files and performs
// positional I/O, a file at a time under that file's lock.
#[derive(Debug)]
pub struct Disk {
    info: StoreInfo,

    piece_hashes: Vec<ID>,

    files: Vec<Mutex<TorrentFile>>,
}

impl Disk {
    // Creates the output directory structure and pre-truncates every
    // file to its declared length.
    pub fn allocate(info: StoreInfo, piece_hashes: Vec<ID>) -> Result<Self> {
        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let files = info
            .files
            .iter()
            .map(|f| TorrentFile::create(&info.output_dir, f.clone()).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { info, piece_hashes, files })
    }

    // Writes one piece across the files it intersects, flushing each
    // before moving on.
    pub fn write_piece(&self, idx: u32, data: &[u8]) -> Result<()> {
        if idx >= self.info.num_pieces {
            return Err(DiskError::PieceOutOfRange(idx));
        }
        let expected = self.info.piece_length(idx);
        if data.len() != expected {
            return Err(DiskError::InvalidPieceLength { got: data.len(), expected });
        }

        let piece_start = self.info.piece_byte_offset(idx);
        let mut written = 0;
        for file in &self.files[self.info.piece_file_intersections(idx)] {
            let mut f = file.lock().unwrap();
            let file_range = f.info.byte_range();
            let offset_in_file = piece_start + written - file_range.start;
            let n = (file_range.end - (piece_start + written)).min(data.len() - written);

            f.handle.seek(SeekFrom::Start(offset_in_file as u64))?;
            f.handle.write_all(&data[written..written + n])?;
            f.handle.sync_data()?;
            written += n;
        }
        debug_assert_eq!(written, data.len());

        tracing::trace!("piece {} written at offset {}", idx, piece_start);
        Ok(())
    }

    pub fn read_piece(&self, idx: u32) -> Result<Vec<u8>> {
        if idx >= self.info.num_pieces {
            return Err(DiskError::PieceOutOfRange(idx));
        }

        let piece_start = self.info.piece_byte_offset(idx);
        let mut data = vec![0; self.info.piece_length(idx)];
        let mut read = 0;
        for file in &self.files[self.info.piece_file_intersections(idx)] {
            let mut f = file.lock().unwrap();
            let file_range = f.info.byte_range();
            let offset_in_file = piece_start + read - file_range.start;
            let n = (file_range.end - (piece_start + read)).min(data.len() - read);

            f.handle.seek(SeekFrom::Start(offset_in_file as u64))?;
            f.handle.read_exact(&mut data[read..read + n])?;
            read += n;
        }
        debug_assert_eq!(read, data.len());

        Ok(data)
    }

    pub fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        let piece = self.read_piece(block.piece_idx)?;
        let start = block.offset as usize;
        let end = start + block.len as usize;
        if start >= piece.len() || end > piece.len() {
            return Err(DiskError::BlockOutOfBounds(block));
        }
        Ok(piece[start..end].to_vec())
    }

    // Whether the bytes hash to the piece's expected sha1. Out of
    // range indices are simply not valid.
    pub fn verify_piece(&self, idx: u32, data: &[u8]) -> bool {
        match self.piece_hashes.get(idx as usize) {
            Some(hash) => {
                let digest: ID = Sha1::digest(data).into();
                digest == *hash
            }
            None => false,
        }
    }

    // Flushes remaining state on teardown.
    pub fn close(&self) -> Result<()> {
        for file in &self.files {
            file.lock().unwrap().handle.sync_all()?;
        }
        Ok(())
    }
}

pub fn spawn_disk(
    disk: Arc<Disk>,
    mut disk_rx: DiskRx,
    torrent_tx: TorrentTx,
) -> task::JoinHandle<Result<()>> {
    tracing::debug!("starting disk task");
    task::spawn(async move {
        while let Some(cmd) = disk_rx.recv().await {
            match cmd {
                DiskCommand::WritePiece { idx, data } => {
                    let disk = Arc::clone(&disk);
                    let res = task::spawn_blocking(move || disk.write_piece(idx, &data))
                        .await
                        .map_err(|e| DiskError::ChannelError(e.to_string()))?;

                    match res {
                        Ok(()) => {
                            torrent_tx
                                .send(CommandToTorrent::PieceWritten { idx })
                                .await
                                .map_err(|e| DiskError::ChannelError(e.to_string()))?;
                        }
                        Err(e) => {
                            // The output is the product; a failed write
                            // aborts the whole run.
                            tracing::error!("disk write failed: {}", e);
                            torrent_tx
                                .send(CommandToTorrent::DiskFailure(e.to_string()))
                                .await
                                .ok();
                            return Err(e);
                        }
                    }
                }

                DiskCommand::ReadBlock { block, tx } => {
                    let disk = Arc::clone(&disk);
                    task::spawn_blocking(move || {
                        match disk.read_block(block) {
                            Ok(data) => {
                                let block = BlockData {
                                    piece_idx: block.piece_idx,
                                    offset: block.offset,
                                    data,
                                };
                                // Don't stall the disk on a slow peer.
                                tx.try_send(PeerCommand::BlockRead(block)).ok();
                            }
                            Err(e) => tracing::warn!("block read failed: {}", e),
                        }
                    });
                }

                DiskCommand::Shutdown => break,
            }
        }

        let res = {
            let disk = Arc::clone(&disk);
            task::spawn_blocking(move || disk.close())
                .await
                .map_err(|e| DiskError::ChannelError(e.to_string()))?
        };
        tracing::debug!("disk task stopped");
        res
    })
}
