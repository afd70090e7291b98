use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use crate::{store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {
    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be a non-empty multiple of 20")]
    InvalidPiecesLength,

    #[error("piece length must be non-zero")]
    InvalidPieceLength,

    #[error("piece count does not match total length")]
    PieceCountMismatch,

    #[error("torrent has no length or files")]
    NoLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,
}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    // Path components, relative to the torrent directory.
    pub path: Vec<String>,

    pub length: u64,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
}

// Fields ordered by their bencoded key so re-serialization is canonical.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {
    // A list of dictionaries, one for each file. Multi-file only.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes. Single-file only.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // File or directory name.
    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

impl Info {
    // Sha1 of the bencoded info dict identifies the torrent.
    fn info_hash(&self) -> Result<ID> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&self)?);
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {
    // The announce URL of the tracker. Absent on DHT-only torrents,
    // which parse fine but yield no peers here.
    #[serde(default)]
    #[serde(deserialize_with = "crate::de::opt_url_deserialize")]
    pub announce: Option<url::Url>,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // Sha1 hash of info dict.
    #[serde(skip)]
    pub info_hash: ID,

    // (optional) backwards-compatible tiered tracker list.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl MetaInfo {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo> {
        let mut metainfo: MetaInfo = serde_bencode::from_bytes(bytes)?;
        metainfo.validate()?;
        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        if self.info.pieces.is_empty() || self.info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if self.info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }

        let total = self.total_len();
        if total == 0 {
            return Err(MetaInfoError::NoLength);
        }
        let piece_len = self.info.piece_length as u64;
        let expected = (total + piece_len - 1) / piece_len;
        if expected != self.num_pieces() as u64 {
            return Err(MetaInfoError::PieceCountMismatch);
        }

        if let Some(files) = &self.info.files {
            for file in files {
                if file.length == 0 {
                    return Err(MetaInfoError::FileNoSize);
                }
                if file.path.is_empty() || file.path.iter().any(|c| c.is_empty()) {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                if file.path[0].starts_with('/') {
                    return Err(MetaInfoError::FileAbsolutePath);
                }
            }
        }

        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info
            .pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker urls in tiers, shuffled within each tier.
    pub fn trackers(&self) -> Vec<Vec<url::Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::new();
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else if let Some(announce) = &self.announce {
            vec![vec![announce.clone()]]
        } else {
            Vec::new()
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files
                .iter()
                .map(|f| {
                    let file_info = FileInfo {
                        path: f.path.iter().collect(),
                        length: f.length as usize,
                        offset,
                    };
                    offset += f.length as usize;
                    file_info
                })
                .collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
            }]
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(|u| u.as_str()))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date)
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
