//! On-disk layout of a storage dir
//!
//! Dir layout:
//! ```text
//! <dir>/
//! ├── 1001                  committed block 1001
//! ├── 1002                  committed block 1002
//! └── .tmp_blocks/
//!     └── 33/
//!         └── 1003          temporary block 1003 of session 33
//! ```
//!
//! A committed block is one file named by its decimal block id whose length
//! is the committed size. Commit renames the temporary file into place.

use bytes::Bytes;
use stratus_common::{BlockId, Result, SessionId};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the per-dir directory holding temporary blocks
pub const TEMP_DIR_NAME: &str = ".tmp_blocks";

/// Path of a committed block file
#[must_use]
pub fn committed_block_path(dir: &Path, block_id: BlockId) -> PathBuf {
    dir.join(block_id.to_string())
}

/// Directory holding the temporary blocks of one session
#[must_use]
pub fn session_temp_dir(dir: &Path, session_id: SessionId) -> PathBuf {
    dir.join(TEMP_DIR_NAME).join(session_id.to_string())
}

/// Path of a temporary block file
#[must_use]
pub fn temp_block_path(dir: &Path, session_id: SessionId, block_id: BlockId) -> PathBuf {
    session_temp_dir(dir, session_id).join(block_id.to_string())
}

/// Parse a committed block file name
///
/// Only plain decimal names are block files; anything else is ignored.
#[must_use]
pub fn parse_block_file_name(name: &str) -> Option<BlockId> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok().map(BlockId::new)
}

/// List committed block files in a dir as (block id, file length)
pub fn scan_committed_blocks(dir: &Path) -> Result<Vec<(BlockId, u64)>> {
    let mut blocks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(block_id) = name.to_str().and_then(parse_block_file_name) else {
            continue;
        };
        blocks.push((block_id, entry.metadata()?.len()));
    }
    blocks.sort_unstable_by_key(|(id, _)| *id);
    Ok(blocks)
}

/// Delete all leftover temporary blocks of a dir, returning how many files went away
pub fn clear_temp_blocks(dir: &Path) -> Result<usize> {
    let temp_root = dir.join(TEMP_DIR_NAME);
    if !temp_root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for session_dir in fs::read_dir(&temp_root)? {
        let session_dir = session_dir?.path();
        if session_dir.is_dir() {
            removed += fs::read_dir(&session_dir)?.count();
            fs::remove_dir_all(&session_dir)?;
        } else {
            fs::remove_file(&session_dir)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Create an empty file, creating parent directories as needed
pub fn create_empty_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(())
}

/// Write `data` at `offset`, extending the file if needed
pub fn write_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Read a whole block file
pub fn read_file(path: &Path) -> Result<Bytes> {
    Ok(Bytes::from(fs::read(path)?))
}

/// Length of a file in bytes
pub fn file_len(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Remove a file, returning whether it existed
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory if it is empty; missing or non-empty dirs are left alone
pub fn remove_dir_if_empty(path: &Path) {
    let _ = fs::remove_dir(path);
}

/// Rename within one filesystem
pub fn rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(src, dst)?;
    Ok(())
}

/// Copy a block file to another dir, possibly on another device
///
/// The source is left in place; the caller removes it once the metadata
/// points at the copy.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::copy(src, dst)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let dir = Path::new("/data/ssd0");
        assert_eq!(
            committed_block_path(dir, BlockId::new(1001)),
            PathBuf::from("/data/ssd0/1001")
        );
        assert_eq!(
            temp_block_path(dir, SessionId::new(33), BlockId::new(1003)),
            PathBuf::from("/data/ssd0/.tmp_blocks/33/1003")
        );
    }

    #[test]
    fn test_parse_block_file_name() {
        assert_eq!(parse_block_file_name("42"), Some(BlockId::new(42)));
        assert_eq!(parse_block_file_name("0"), Some(BlockId::new(0)));
        assert_eq!(parse_block_file_name(""), None);
        assert_eq!(parse_block_file_name("-1"), None);
        assert_eq!(parse_block_file_name("42.tmp"), None);
        assert_eq!(parse_block_file_name(".tmp_blocks"), None);
        // Overflows u64
        assert_eq!(parse_block_file_name("99999999999999999999999"), None);
    }

    #[test]
    fn test_scan_and_clear() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("7"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("3"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let temp = temp_block_path(dir.path(), SessionId::new(1), BlockId::new(9));
        create_empty_file(&temp).unwrap();

        let blocks = scan_committed_blocks(dir.path()).unwrap();
        assert_eq!(blocks, vec![(BlockId::new(3), 10), (BlockId::new(7), 100)]);

        assert_eq!(clear_temp_blocks(dir.path()).unwrap(), 1);
        assert!(!temp.exists());
        assert_eq!(clear_temp_blocks(dir.path()).unwrap(), 0);
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("5");
        create_empty_file(&path).unwrap();
        write_at(&path, 0, b"hello").unwrap();
        write_at(&path, 5, b" world").unwrap();

        assert_eq!(file_len(&path).unwrap(), 11);
        assert_eq!(read_file(&path).unwrap(), Bytes::from_static(b"hello world"));

        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn test_copy_across_dirs() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = committed_block_path(src_dir.path(), BlockId::new(1));
        fs::write(&src, b"payload").unwrap();

        let dst = committed_block_path(dst_dir.path(), BlockId::new(1));
        assert_eq!(copy_file(&src, &dst).unwrap(), 7);
        assert!(src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }
}
