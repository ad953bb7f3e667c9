//! Storage seam for the backup archive, plus snapshot (de)compression.

use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{HarvestError, Result};

/// Name of the single entry inside a compressed snapshot.
pub const SNAPSHOT_ENTRY: &str = "snapshot.json";

/// Upper bound on a decompressed snapshot (zip-bomb protection).
const MAX_SNAPSHOT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Flat, independently addressable object storage holding the manifest and snapshots.
pub trait ArchiveStore: Send + Sync {
    /// Store an object, replacing any previous one atomically.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch an object, `None` if absent.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an object. Deleting a missing object is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    fn list(&self) -> Result<Vec<String>>;
}

/// Archive kept in a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    dir: PathBuf,
}

impl LocalArchive {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(HarvestError::InvalidInput(format!("invalid archive object name: {:?}", name)));
        }
        Ok(self.dir.join(name))
    }
}

impl ArchiveStore for LocalArchive {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Deflate a snapshot into a single-entry zip.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(bytes.len() as u64 >= u32::MAX as u64);
        zip.start_file(SNAPSHOT_ENTRY, options)?;
        zip.write_all(bytes)?;
        zip.finish()?;
    }
    Ok(buf)
}

/// Inverse of [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let entry = archive.by_name(SNAPSHOT_ENTRY)?;
    let mut out = Vec::new();
    entry.take(MAX_SNAPSHOT_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_SNAPSHOT_BYTES {
        return Err(HarvestError::Archive(format!(
            "{} exceeds size limit ({} bytes)",
            SNAPSHOT_ENTRY, MAX_SNAPSHOT_BYTES
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_archive_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::open(dir.path().join("backups")).unwrap();

        archive.put("a.json", b"{}").unwrap();
        archive.put("a.json", b"{\"v\":2}").unwrap();
        assert_eq!(archive.get("a.json").unwrap().unwrap(), b"{\"v\":2}");
        assert_eq!(archive.list().unwrap(), vec!["a.json".to_string()]);

        archive.delete("a.json").unwrap();
        archive.delete("a.json").unwrap();
        assert!(archive.get("a.json").unwrap().is_none());
    }

    #[test]
    fn test_local_archive_rejects_paths() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::open(dir.path()).unwrap();
        assert!(archive.put("../escape.json", b"x").is_err());
        assert!(archive.get(".hidden").is_err());
    }

    #[test]
    fn test_compression_round_trip_shrinks_repetitive_json() {
        let json = serde_json::to_vec(&vec![serde_json::json!({"name": "rain on a tin roof"}); 200]).unwrap();
        let zipped = compress(&json).unwrap();
        assert!(zipped.len() < json.len());
        assert_eq!(decompress(&zipped).unwrap(), json);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(matches!(decompress(b"not a zip"), Err(HarvestError::Archive(_))));
    }
}
