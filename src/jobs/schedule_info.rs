//! Schedule-info sidecar.
//!
//! Stored alongside a job's config file as a hidden `.<jobname>` file,
//! tracking the last time each [`ArchiveType`] was executed. Readers accept
//! both the legacy bare-timestamp-only form and the current
//! `<timestamp> <archiveTypeName>` form; writers always emit both: the
//! overall maximum on line 1, then one line per archive type that has ever
//! run.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use log::warn;

use crate::catalog::{ArchiveType, ARCHIVE_TYPES};
use crate::error::JobError;

/// Last-executed timestamps per archive type, as read from or about to be
/// written to a sidecar file.
#[derive(Debug, Clone, Default)]
pub struct ScheduleInfo {
    last_executed: HashMap<ArchiveType, i64>,
}

impl ScheduleInfo {
    pub fn last_executed(&self, archive_type: ArchiveType) -> Option<i64> {
        self.last_executed.get(&archive_type).copied()
    }

    pub fn set_last_executed(&mut self, archive_type: ArchiveType, when: i64) {
        self.last_executed.insert(archive_type, when);
    }

    pub fn overall_max(&self) -> Option<i64> {
        self.last_executed.values().copied().max()
    }
}

/// Given `jobname`'s path, returns the sidecar path `.<jobname>` in the
/// same directory.
pub fn sidecar_path(job_file: &Path) -> std::path::PathBuf {
    let dir = job_file.parent().unwrap_or_else(|| Path::new("."));
    let name = job_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".{}", name))
}

/// Reads a sidecar file. A missing file is not an error: it simply means no
/// run has ever completed.
pub fn read(path: &Path) -> Result<ScheduleInfo, JobError> {
    let mut info = ScheduleInfo::default();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(info),
        Err(err) => return Err(JobError::Io(err)),
    };

    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let timestamp_str = match parts.next() {
            Some(t) => t,
            None => continue,
        };
        let timestamp: i64 = match timestamp_str.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("schedule info {:?}: invalid timestamp on line {}", path, line_no + 1);
                continue;
            }
        };

        match parts.next() {
            // Line 1 may be a bare timestamp -- backward compatibility
            // with sidecars written before per-archive-type tracking.
            None if line_no == 0 => {
                // Recorded against every type we later see explicitly; if
                // none follow, fall back to attributing it to FULL, the
                // type the legacy single-timestamp format always meant.
                info.last_executed.entry(ArchiveType::Full).or_insert(timestamp);
            }
            None => {
                warn!("schedule info {:?}: missing archive type on line {}", path, line_no + 1);
            }
            Some(name) => match name.parse::<ArchiveType>() {
                Ok(archive_type) => {
                    info.last_executed.insert(archive_type, timestamp);
                }
                Err(()) => {
                    warn!("schedule info {:?}: unknown archive type '{}' on line {}", path, name, line_no + 1);
                }
            },
        }
    }

    Ok(info)
}

/// Writes `info` to `path`: the overall maximum timestamp on line 1, then
/// one `<timestamp> <archiveTypeName>` line per type that has ever run, in
/// [`ARCHIVE_TYPES`] order.
pub fn write(path: &Path, info: &ScheduleInfo) -> Result<(), JobError> {
    let mut buffer = String::new();
    if let Some(max) = info.overall_max() {
        buffer.push_str(&max.to_string());
    } else {
        buffer.push('0');
    }
    buffer.push('\n');

    for archive_type in ARCHIVE_TYPES {
        if let Some(ts) = info.last_executed(archive_type) {
            buffer.push_str(&format!("{} {}\n", ts, archive_type.name()));
        }
    }

    let mut file = std::fs::File::create(path)?;
    file.write_all(buffer.as_bytes())?;
    Ok(())
}

/// Records that `archive_type` finished at `when`, re-reading and
/// re-writing the sidecar so concurrent types already recorded survive.
pub fn record_execution(job_file: &Path, archive_type: ArchiveType, when: i64) -> Result<(), JobError> {
    let path = sidecar_path(job_file);
    let mut info = read(&path)?;
    info.set_last_executed(archive_type, when);
    write(&path, &info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips_per_type_timestamps() {
        let dir = tempdir().unwrap();
        let job_file = dir.path().join("myjob");
        std::fs::write(&job_file, "").unwrap();

        record_execution(&job_file, ArchiveType::Full, 1_700_000_000).unwrap();
        record_execution(&job_file, ArchiveType::Incremental, 1_700_003_600).unwrap();
        record_execution(&job_file, ArchiveType::Full, 1_700_007_200).unwrap();

        let path = sidecar_path(&job_file);
        let info = read(&path).unwrap();
        assert_eq!(info.last_executed(ArchiveType::Full), Some(1_700_007_200));
        assert_eq!(info.last_executed(ArchiveType::Incremental), Some(1_700_003_600));

        let first_line = std::fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();
        assert_eq!(first_line, "1700007200");
    }

    #[test]
    fn legacy_bare_timestamp_first_line_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".legacy");
        std::fs::write(&path, "1650000000\n").unwrap();
        let info = read(&path).unwrap();
        assert_eq!(info.last_executed(ArchiveType::Full), Some(1_650_000_000));
    }

    #[test]
    fn missing_file_is_empty_not_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".nope");
        let info = read(&path).unwrap();
        assert_eq!(info.overall_max(), None);
    }
}
