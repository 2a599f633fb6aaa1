//! Durable file replacement
//!
//! A payload is written to a temporary file in the target directory, synced,
//! renamed over the final name, and the directory is synced so the new entry
//! survives power loss.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Prefix of in-progress temporary files; never parsed as payloads
pub const TEMP_PREFIX: &str = ".tmp-";

/// Syncs a directory so that created, renamed or removed entries are durable
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Path of a fresh temporary file next to `target`
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Writes `target` atomically using `write` to fill the file
///
/// `write` receives the open temporary file and must return it once done so
/// it can be synced. On any failure the temporary file is removed and
/// `target` is left untouched.
pub fn write_atomically<F>(target: &Path, write: F) -> io::Result<u64>
where
    F: FnOnce(File) -> io::Result<File>,
{
    let tmp = temp_path_for(target);
    let result = (|| -> io::Result<u64> {
        let file = File::create(&tmp)?;
        let file = write(file)?;
        file.sync_all()?;
        let len = file.metadata()?.len();
        drop(file);
        fs::rename(&tmp, target)?;
        if let Some(parent) = target.parent() {
            fsync_dir(parent)?;
        }
        Ok(len)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
