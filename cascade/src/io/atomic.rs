//! Crash-safe file replacement (write temp file, then rename over the target).

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Replace `path` with `contents`; readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Append `line` to `path` without ever exposing a partial write.
///
/// The current file is copied into the temp file at the filesystem level,
/// the line is appended and synced, and the temp file is renamed over the
/// original. Cost is one copy of the file per call, never an in-memory
/// rewrite. A missing terminator on the last existing line is repaired first
/// so the new record always starts on its own line.
pub fn append_atomic(path: &Path, line: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_path(path);
    let copied = match fs::copy(path, &tmp_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            File::create(&tmp_path)
                .with_context(|| format!("create temp file {}", tmp_path.display()))?;
            0
        }
        Err(e) => return Err(e).with_context(|| format!("copy {}", path.display())),
    };

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(&tmp_path)
        .with_context(|| format!("open temp file {}", tmp_path.display()))?;
    let mut record = Vec::with_capacity(line.len() + 2);
    if copied > 0 && !ends_with_newline(&mut file)? {
        record.push(b'\n');
    }
    record.extend_from_slice(line);
    if !line.ends_with(b"\n") {
        record.push(b'\n');
    }
    file.write_all(&record)
        .with_context(|| format!("append temp file {}", tmp_path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).context("seek to last byte")?;
    file.read_exact(&mut last).context("read last byte")?;
    Ok(last[0] == b'\n')
}

/// Sibling temp path: `status.json` -> `status.json.tmp`.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_contents_and_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("status.json");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        assert!(!temp.path().join("state").join("status.json.tmp").exists());
    }

    #[test]
    fn append_adds_lines_and_repairs_a_torn_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("history.jsonl");
        append_atomic(&path, b"one").expect("append");
        append_atomic(&path, b"two\n").expect("append");
        assert_eq!(fs::read_to_string(&path).expect("read"), "one\ntwo\n");

        fs::write(&path, "one\ntor").expect("tear");
        append_atomic(&path, b"three").expect("append");
        assert_eq!(fs::read_to_string(&path).expect("read"), "one\ntor\nthree\n");
        assert!(!temp.path().join("state").join("history.jsonl.tmp").exists());
    }
}
