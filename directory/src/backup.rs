//! The backup store keeps a local copy of the last assignment snapshot so the
//! directory can warm its cache even when the database is unreachable at startup.
use crate::types::StoredAssignment;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub trait BackupStore: Send + Sync {
    fn load(&self) -> Result<Vec<StoredAssignment>, BackupError>;
    fn store(&self, assignments: &[StoredAssignment]) -> Result<(), BackupError>;
}

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct BackupData {
    assignments: Vec<StoredAssignment>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd1,
    Zstd3,
}

impl Compression {
    fn zstd_level(self) -> Option<i32> {
        match self {
            Compression::None => None,
            Compression::Zstd1 => Some(1),
            Compression::Zstd3 => Some(3),
        }
    }
}

/// Bincode (standard config: little-endian, varint), optionally inside a zstd frame.
#[derive(Clone, Copy)]
struct Codec(Compression);

impl Codec {
    fn write<W: Write>(self, writer: W, data: &BackupData) -> Result<usize, BackupError> {
        let config = bincode::config::standard();
        let Some(level) = self.0.zstd_level() else {
            let mut writer = writer;
            let size = bincode::serde::encode_into_std_write(data, &mut writer, config)?;
            writer.flush()?;
            return Ok(size);
        };
        let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
        let size = bincode::serde::encode_into_std_write(data, &mut encoder, config)?;
        encoder.finish()?.flush()?;
        Ok(size)
    }

    fn read<R: Read>(self, mut reader: R) -> Result<BackupData, BackupError> {
        let config = bincode::config::standard();
        Ok(match self.0 {
            Compression::None => bincode::serde::decode_from_std_read(&mut reader, config)?,
            Compression::Zstd1 | Compression::Zstd3 => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                bincode::serde::decode_from_std_read(&mut decoder, config)?
            }
        })
    }
}

/// Used when no backup location is configured.
pub struct NoopBackupStore;

impl BackupStore for NoopBackupStore {
    fn load(&self) -> Result<Vec<StoredAssignment>, BackupError> {
        tracing::warn!("No backup store configured, starting with an empty directory");
        Ok(Vec::new())
    }

    fn store(&self, _assignments: &[StoredAssignment]) -> Result<(), BackupError> {
        Ok(())
    }
}

pub struct FilesystemBackupStore {
    path: PathBuf,
    codec: Codec,
}

impl FilesystemBackupStore {
    pub fn new(base_dir: &str, filename: &str, compression: Compression) -> Self {
        FilesystemBackupStore {
            path: Path::new(base_dir).join(filename),
            codec: Codec(compression),
        }
    }
}

impl BackupStore for FilesystemBackupStore {
    fn load(&self) -> Result<Vec<StoredAssignment>, BackupError> {
        let file = File::open(&self.path)?;
        let reader = io::BufReader::new(file);
        Ok(self.codec.read(reader)?.assignments)
    }

    fn store(&self, assignments: &[StoredAssignment]) -> Result<(), BackupError> {
        // Write to a sibling file and rename so a crash never leaves a torn backup.
        let tmp_path = self.path.with_extension("tmp");
        let writer = io::BufWriter::new(File::create(&tmp_path)?);
        let data = BackupData {
            assignments: assignments.to_vec(),
        };
        let size = self.codec.write(writer, &data)?;
        std::fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(path = ?self.path, bytes = size, "Stored backup assignments");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_assignments() -> Vec<StoredAssignment> {
        vec![
            StoredAssignment::new("zulip", "shard-a"),
            StoredAssignment {
                realm: "lear".into(),
                shard: "shard-b".into(),
                pinned: true,
                epoch: 7,
            },
        ]
    }

    #[test]
    fn test_codec() {
        for compression in [Compression::None, Compression::Zstd1, Compression::Zstd3] {
            let codec = Codec(compression);
            let data = BackupData {
                assignments: get_assignments(),
            };
            let mut buffer: Vec<u8> = Vec::new();
            let size = codec.write(&mut buffer, &data).unwrap();
            assert!(size > 0);
            let mut reader: &[u8] = &buffer;
            let decoded = codec.read(&mut reader).unwrap();
            assert_eq!(data, decoded);
        }
    }

    #[test]
    fn test_filesystem() {
        let dir = tempfile::tempdir().unwrap();

        let provider = FilesystemBackupStore::new(
            dir.path().to_str().unwrap(),
            "backup.bin",
            Compression::Zstd1,
        );
        let data = get_assignments();

        provider.store(&data).unwrap();
        let loaded = provider.load().unwrap();
        assert_eq!(data, loaded);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider =
            FilesystemBackupStore::new(dir.path().to_str().unwrap(), "absent.bin", Compression::None);
        assert!(matches!(provider.load(), Err(BackupError::Io(_))));
    }
}
