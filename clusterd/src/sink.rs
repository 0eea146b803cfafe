//! Output sink
//!
//! Supervisor logs and captured worker stdout/stderr all land in one
//! size-rotated file, `<base-dir>/logs/output.log`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use eyre::{Context, Result};
use tracing::debug;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::OutputConfig;

/// zstd level used for rotated backups
const BACKUP_LEVEL: i32 = 3;

/// Append-only file that rotates once it would grow past `max_size`
///
/// The full file is compressed into `output.log.1.zst`; older backups shift
/// to `output.log.2.zst` and so on, dropping anything beyond `keep`.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    keep: usize,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_size: u64, keep: usize) -> Result<Self> {
        let path = path.into();
        debug!(?path, max_size, keep, "RotatingFile::open: called");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let file = open_append(&path).context(format!("Failed to open {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
            max_size,
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the n-th compressed backup
    pub fn backup_path(&self, n: usize) -> PathBuf {
        self.with_suffix(&format!(".{}.zst", n))
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        debug!(path = ?self.path, "RotatingFile::rotate: called");
        self.file.flush()?;

        if self.keep == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.backup_path(self.keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }

        // Move the full file aside first so writes resume on a fresh one
        let staged = self.with_suffix(".rotating");
        fs::rename(&self.path, &staged)?;
        self.file = open_append(&self.path)?;
        self.written = 0;

        compress_zstd(&staged, &self.backup_path(1))?;
        fs::remove_file(&staged)?;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A single oversized write still lands in a fresh file
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn compress_zstd(src: &Path, dest: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(src)?);
    let output = BufWriter::new(File::create(dest)?);

    let mut encoder = zstd::Encoder::new(output, BACKUP_LEVEL)?;
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()
}

/// Shared handle to the rotating output file
#[derive(Debug, Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<RotatingFile>>,
}

impl OutputSink {
    pub fn open(path: impl Into<PathBuf>, config: &OutputConfig) -> Result<Self> {
        let file = RotatingFile::open(path, config.max_size, config.keep)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// Append one line, adding the trailing newline
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut file = self.lock()?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.flush()
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, RotatingFile>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("output sink lock poisoned"))
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.lock()?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> MakeWriter<'a> for OutputSink {
    type Writer = OutputSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(max_size: u64, keep: usize) -> OutputConfig {
        OutputConfig { max_size, keep }
    }

    fn decompress(path: &Path) -> String {
        let bytes = zstd::decode_all(File::open(path).unwrap()).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("output.log");
        let sink = OutputSink::open(&path, &config(1024, 3)).unwrap();
        sink.write_line("hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_write_line_appends_to_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.log");
        fs::write(&path, "earlier\n").unwrap();

        let sink = OutputSink::open(&path, &config(1024, 3)).unwrap();
        sink.write_line("later").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "earlier\nlater\n");
    }

    #[test]
    fn test_rotation_shifts_backups() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.log");
        let sink = OutputSink::open(&path, &config(10, 2)).unwrap();

        // Each line is 6 bytes, so every write after the first rotates
        sink.write_line("first").unwrap();
        sink.write_line("secnd").unwrap();
        sink.write_line("third").unwrap();
        sink.write_line("forth").unwrap();

        let backup = |n: usize| temp.path().join(format!("output.log.{}.zst", n));
        assert_eq!(fs::read_to_string(&path).unwrap(), "forth\n");
        assert_eq!(decompress(&backup(1)), "third\n");
        assert_eq!(decompress(&backup(2)), "secnd\n");
        assert!(!backup(3).exists());
        assert!(!temp.path().join("output.log.1").exists());
        assert!(!temp.path().join("output.log.rotating").exists());
    }

    #[test]
    fn test_keep_zero_truncates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.log");
        let sink = OutputSink::open(&path, &config(8, 0)).unwrap();

        sink.write_line("aaaaa").unwrap();
        sink.write_line("bbbbb").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "bbbbb\n");
        assert!(!temp.path().join("output.log.1.zst").exists());
    }

    #[test]
    fn test_rotated_backup_is_compressed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.log");
        let sink = OutputSink::open(&path, &config(100, 3)).unwrap();
        let line = "worker 3 listening on port 4567 ".repeat(3);

        sink.write_line(&line).unwrap();
        sink.write_line("next").unwrap();

        let backup = temp.path().join("output.log.1.zst");
        let raw = fs::read(&backup).unwrap();
        assert_eq!(&raw[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
        assert!(raw.len() < line.len());
        assert_eq!(decompress(&backup), format!("{}\n", line));
    }

    #[test]
    fn test_clones_share_one_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.log");
        let sink = OutputSink::open(&path, &config(1024, 3)).unwrap();
        let mut other = sink.make_writer();

        sink.write_line("one").unwrap();
        other.write_all(b"two\n").unwrap();
        other.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
