//! Crash-safe file replacement
//!
//! Both helpers write a sibling temp file in the destination directory, flush
//! it to disk, then rename it over the destination. A reader sees either the
//! old content or the new content, never a prefix of the new one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn temp_sibling(dst: &Path) -> io::Result<PathBuf> {
    let name = dst.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination has no file name: {}", dst.display()),
        )
    })?;
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.tmp", name.to_string_lossy())))
}

/// Atomically replace `dst` with `content`
pub fn atomic_write(dst: &Path, content: &[u8]) -> io::Result<()> {
    let temp = temp_sibling(dst)?;
    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp, dst)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Atomically replace `dst` with a copy of `src`
pub fn atomic_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let temp = temp_sibling(dst)?;
    let result = (|| {
        fs::copy(src, &temp)?;
        File::open(&temp)?.sync_all()?;
        fs::rename(&temp, dst)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}
