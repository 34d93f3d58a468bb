//! Rotating file sink

use super::sink::{RecordFormat, Sink};
use crate::config::{FileSinkSettings, RotationSettings};
use crate::types::LogLevel;
use crate::{GatewayError, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// How archived files are compressed after rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCompression {
    /// Leave archives as written
    None,
    /// `.gz` via flate2
    Gzip,
    /// `.lz4` frame via lz4_flex
    Lz4,
}

impl ArchiveCompression {
    fn from_settings(settings: &RotationSettings) -> Self {
        if !settings.compression {
            return ArchiveCompression::None;
        }
        match settings.compression_algorithm.as_str() {
            "lz4" => ArchiveCompression::Lz4,
            _ => ArchiveCompression::Gzip,
        }
    }

    fn extension(&self) -> Option<&'static str> {
        match self {
            ArchiveCompression::None => None,
            ArchiveCompression::Gzip => Some("gz"),
            ArchiveCompression::Lz4 => Some("lz4"),
        }
    }
}

/// Archive retention applied after every rotation
#[derive(Debug, Clone)]
pub struct Retention {
    /// Archives kept, newest first (0 keeps all)
    pub keep_files: usize,
    /// Archives older than this are removed
    pub max_age: Option<Duration>,
    /// Compression applied to fresh archives
    pub compression: ArchiveCompression,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_files: 0,
            max_age: None,
            compression: ArchiveCompression::None,
        }
    }
}

impl Retention {
    /// Retention from rotation settings
    pub fn from_settings(settings: &RotationSettings) -> Self {
        let max_age = (settings.max_age_hours > 0)
            .then(|| Duration::from_secs(u64::from(settings.max_age_hours) * 3600));
        Self {
            keep_files: settings.keep_files as usize,
            max_age,
            compression: ArchiveCompression::from_settings(settings),
        }
    }
}

/// Ordering key of an archive: its timestamp, then its `.N` sequence
type ArchiveKey = (NaiveDateTime, u32);

struct ActiveFile {
    file: File,
    size: u64,
    /// Newest archive this sink has produced or found at open
    last_archive: Option<ArchiveKey>,
}

/// File sink whose backing file can be swapped out at runtime.
///
/// Writes and rotations serialize on one lock, so every line lands wholly in
/// either the pre-rotation file or the post-rotation file. Lines go straight
/// to the file without an intermediate buffer.
pub struct FileSink {
    name: String,
    path: PathBuf,
    format: RecordFormat,
    min_level: LogLevel,
    max_file_size: u64,
    keeper: Arc<ArchiveKeeper>,
    active: Mutex<ActiveFile>,
}

impl FileSink {
    /// Open (or create) `path` in append mode with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = FileSinkSettings {
            path: Some(path.as_ref().to_path_buf()),
            max_file_size: 0,
            ..Default::default()
        };
        Self::from_settings(&settings)
    }

    /// File sink from configuration
    pub fn from_settings(settings: &FileSinkSettings) -> Result<Self> {
        let path = settings.resolved_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        let last_archive = list_archives(&path)?.last().map(|a| a.key);

        Ok(Self {
            name: format!("file:{}", path.display()),
            keeper: Arc::new(ArchiveKeeper::new(
                path.clone(),
                Retention::from_settings(&settings.rotation),
            )),
            path,
            format: settings.format,
            min_level: settings.min_level,
            max_file_size: settings.max_file_size,
            active: Mutex::new(ActiveFile {
                file,
                size,
                last_archive,
            }),
        })
    }

    /// Replace the retention policy
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.keeper = Arc::new(ArchiveKeeper::new(self.path.clone(), retention));
        self
    }

    /// Path of the live log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the live file, including content present at open
    pub fn current_size(&self) -> u64 {
        self.active.lock().size
    }

    /// Every archive belonging to this sink, oldest first
    pub fn archives(&self) -> Result<Vec<PathBuf>> {
        Ok(list_archives(&self.path)?.into_iter().map(|a| a.path).collect())
    }

    fn rotate_locked(&self, active: &mut ActiveFile) -> Result<Option<PathBuf>> {
        let (archive, key) = self.next_archive_path(Utc::now(), active.last_archive);
        let archived = match fs::rename(&self.path, &archive) {
            Ok(()) => true,
            // Someone removed the live file; just start a new one.
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(GatewayError::Rotation(format!(
                    "cannot archive {} to {}: {}",
                    self.path.display(),
                    archive.display(),
                    e
                )))
            }
        };

        match open_append(&self.path) {
            Ok(file) => {
                active.file = file;
                active.size = 0;
                if archived {
                    active.last_archive = Some(key);
                }
                Ok(archived.then_some(archive))
            }
            Err(e) => {
                // Keep writing through the old handle under its original name.
                if archived {
                    if let Err(back) = fs::rename(&archive, &self.path) {
                        warn!(archive = %archive.display(), error = %back, "could not restore log file name");
                    }
                }
                Err(GatewayError::Rotation(format!(
                    "cannot reopen {}: {}",
                    self.path.display(),
                    e
                )))
            }
        }
    }

    /// Picks an unused archive name whose key sorts after `last`, so the
    /// newest archive is always the last one in name order.
    fn next_archive_path(&self, now: DateTime<Utc>, last: Option<ArchiveKey>) -> (PathBuf, ArchiveKey) {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let (stem, ext) = name_parts(&self.path);

        let stamp = now.naive_utc().trunc_subsecs(3);
        let (stamp, mut sequence) = match last {
            Some((last_stamp, last_sequence)) if stamp <= last_stamp => (last_stamp, last_sequence + 1),
            _ => (stamp, 0),
        };
        let formatted = stamp.format(ARCHIVE_TIME_FORMAT).to_string();

        loop {
            let base = if sequence == 0 {
                format!("{}-{}", stem, formatted)
            } else {
                format!("{}-{}.{}", stem, formatted, sequence)
            };
            let candidate = dir.join(match &ext {
                Some(ext) => format!("{}.{}", base, ext),
                None => base,
            });
            if !archive_slot_taken(&candidate) {
                return (candidate, (stamp, sequence));
            }
            sequence += 1;
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.keeper.finish(None);
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> RecordFormat {
        self.format
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let len = buf.len() as u64;

        let mut active = self.active.lock();
        let mut archived = None;
        if self.max_file_size > 0 && active.size > 0 && active.size + len > self.max_file_size {
            match self.rotate_locked(&mut active) {
                Ok(archive) => archived = archive,
                Err(e) => warn!(sink = %self.name, error = %e, "size-triggered rotation failed"),
            }
        }

        let written = active.file.write_all(buf.as_bytes());
        if written.is_ok() {
            active.size += len;
        }
        drop(active);

        if let Some(archive) = archived {
            self.keeper.defer(archive);
        }
        written.map_err(|e| GatewayError::Sink(format!("write to {} failed: {}", self.path.display(), e)))
    }

    fn flush(&self) -> Result<()> {
        self.active.lock().file.sync_data()?;
        self.keeper.finish(None);
        Ok(())
    }

    fn rotate(&self) -> Result<Option<PathBuf>> {
        let archive = {
            let mut active = self.active.lock();
            self.rotate_locked(&mut active)?
        };
        Ok(self.keeper.finish(archive))
    }
}

/// Compression and retention for freshly rotated archives.
///
/// Size-triggered rotations hand their archive over here so the writing
/// caller never compresses or prunes. Passes run one at a time.
struct ArchiveKeeper {
    live: PathBuf,
    retention: Retention,
    pending: Mutex<Vec<PathBuf>>,
    running: Mutex<()>,
}

impl ArchiveKeeper {
    fn new(live: PathBuf, retention: Retention) -> Self {
        Self {
            live,
            retention,
            pending: Mutex::new(Vec::new()),
            running: Mutex::new(()),
        }
    }

    /// Queue `archive` and finish it on the blocking pool, or inline when
    /// no tokio runtime is around.
    fn defer(self: &Arc<Self>, archive: PathBuf) {
        self.pending.lock().push(archive);
        match Handle::try_current() {
            Ok(handle) => {
                let keeper = Arc::clone(self);
                handle.spawn_blocking(move || {
                    keeper.finish(None);
                });
            }
            Err(_) => {
                self.finish(None);
            }
        }
    }

    /// Compress every queued archive plus `fresh`, then apply retention.
    /// Returns the final path of `fresh`.
    fn finish(&self, fresh: Option<PathBuf>) -> Option<PathBuf> {
        let _running = self.running.lock();
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() && fresh.is_none() {
            return None;
        }

        for archive in pending {
            self.compress(archive);
        }
        let fresh = fresh.map(|archive| self.compress(archive));

        if let Err(e) = self.apply_retention() {
            warn!(path = %self.live.display(), error = %e, "archive retention failed");
        }
        fresh
    }

    fn compress(&self, archive: PathBuf) -> PathBuf {
        match self.retention.compression {
            ArchiveCompression::None => archive,
            compression => match compress_archive(&archive, compression) {
                Ok(compressed) => compressed,
                Err(e) => {
                    warn!(archive = %archive.display(), error = %e, "archive compression failed");
                    archive
                }
            },
        }
    }

    fn apply_retention(&self) -> io::Result<()> {
        let mut archives = list_archives(&self.live)?;

        let cutoff = self
            .retention
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| Utc::now().naive_utc().checked_sub_signed(age));
        if let Some(cutoff) = cutoff {
            let (expired, fresh): (Vec<_>, Vec<_>) =
                archives.into_iter().partition(|a| a.key.0 < cutoff);
            for archive in expired {
                debug!(archive = %archive.path.display(), "removing expired archive");
                remove_archive(&archive.path)?;
            }
            archives = fresh;
        }

        let keep = self.retention.keep_files;
        if keep > 0 && archives.len() > keep {
            let excess = archives.len() - keep;
            for archive in archives.into_iter().take(excess) {
                debug!(archive = %archive.path.display(), "removing surplus archive");
                remove_archive(&archive.path)?;
            }
        }
        Ok(())
    }
}

struct Archive {
    path: PathBuf,
    key: ArchiveKey,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn name_parts(live: &Path) -> (String, Option<String>) {
    let stem = live
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    let ext = live.extension().map(|s| s.to_string_lossy().into_owned());
    (stem, ext)
}

/// Archives of the log file at `live`, oldest first
fn list_archives(live: &Path) -> io::Result<Vec<Archive>> {
    let dir = match live.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    let (stem, ext) = name_parts(live);
    let prefix = format!("{}-", stem);

    let mut archives = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = parse_archive_name(&name, &prefix, ext.as_deref()) {
            archives.push(Archive {
                path: entry.path(),
                key,
            });
        }
    }
    archives.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(archives)
}

/// Removes an archive; one that is already gone counts as removed.
fn remove_archive(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn archive_slot_taken(candidate: &Path) -> bool {
    if candidate.exists() {
        return true;
    }
    ["gz", "lz4"].iter().any(|ext| {
        let mut compressed = candidate.as_os_str().to_owned();
        compressed.push(".");
        compressed.push(ext);
        Path::new(&compressed).exists()
    })
}

/// Extracts the (timestamp, sequence) ordering key from an archive file name.
fn parse_archive_name(name: &str, prefix: &str, ext: Option<&str>) -> Option<ArchiveKey> {
    let rest = name.strip_prefix(prefix)?;
    let rest = rest
        .strip_suffix(".gz")
        .or_else(|| rest.strip_suffix(".lz4"))
        .unwrap_or(rest);
    let rest = match ext {
        Some(ext) => rest.strip_suffix(ext)?.strip_suffix('.')?,
        None => rest,
    };

    // The timestamp itself contains one '.' before the milliseconds.
    let (stamp, sequence) = match rest.match_indices('.').nth(1) {
        Some((idx, _)) => (&rest[..idx], rest[idx + 1..].parse().ok()?),
        None => (rest, 0),
    };
    let time = NaiveDateTime::parse_from_str(stamp, ARCHIVE_TIME_FORMAT).ok()?;
    Some((time, sequence))
}

#[cfg(feature = "compression")]
fn compress_archive(archive: &Path, compression: ArchiveCompression) -> io::Result<PathBuf> {
    let ext = match compression.extension() {
        Some(ext) => ext,
        None => return Ok(archive.to_path_buf()),
    };
    let mut target = archive.as_os_str().to_owned();
    target.push(".");
    target.push(ext);
    let target = PathBuf::from(target);

    let result = (|| -> io::Result<()> {
        let mut input = File::open(archive)?;
        let output = File::create(&target)?;
        match compression {
            ArchiveCompression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(output, flate2::Compression::default());
                io::copy(&mut input, &mut encoder)?;
                encoder.finish()?.sync_all()
            }
            ArchiveCompression::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
                io::copy(&mut input, &mut encoder)?;
                encoder
                    .finish()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                    .sync_all()
            }
            ArchiveCompression::None => Ok(()),
        }
    })();

    match result {
        Ok(()) => {
            fs::remove_file(archive)?;
            Ok(target)
        }
        Err(e) => {
            let _ = fs::remove_file(&target);
            Err(e)
        }
    }
}

#[cfg(not(feature = "compression"))]
fn compress_archive(archive: &Path, compression: ArchiveCompression) -> io::Result<PathBuf> {
    match compression.extension() {
        None => Ok(archive.to_path_buf()),
        Some(ext) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("built without the compression feature, cannot write .{}", ext),
        )),
    }
}
