//! Job configuration file format: an INI-like grammar with
//! a default section plus repeatable `[schedule]` and
//! `[persistence <archiveType>]` sections.
//!
//! Parsing is lenient at the whole-file level (an invalid line is skipped
//! with a logged error, per §7 "Local recovery") but the single-value
//! setter used by the round-trip rewrite path ([`set_value`]) is strict,
//! "ambient stack" note.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::warn;

use crate::catalog::ArchiveType;
use crate::error::JobError;

use super::persistence::PersistenceRule;
use super::schedule::{DateField, Schedule, WeekdaySet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptType {
    None,
    Symmetric,
    Asymmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptPasswordMode {
    Default,
    Ask,
    None,
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFileMode {
    Stop,
    Overwrite,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreEntryMode {
    Stop,
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveHost {
    pub name: String,
    pub port: u16,
    pub force_tls: bool,
}

/// The job's large options record.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub archive_type: ArchiveType,
    pub incremental_list_file: Option<String>,
    pub archive_part_size: Option<u64>,
    pub directory_strip: u32,
    pub destination: Option<String>,
    pub owner: Option<String>,
    pub pattern_type: Option<String>,
    pub compress_algorithm: Option<String>,
    pub crypt_algorithm: Option<String>,
    pub crypt_type: CryptType,
    pub crypt_password_mode: CryptPasswordMode,
    pub crypt_password: Option<String>,
    pub crypt_public_key: Option<String>,
    pub ftp_login_name: Option<String>,
    pub ftp_password: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_login_name: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_public_key: Option<String>,
    pub ssh_private_key: Option<String>,
    pub mounts: Vec<String>,
    pub max_storage_size: Option<u64>,
    pub volume_size: Option<u64>,
    pub ecc: bool,
    pub archive_file_mode: ArchiveFileMode,
    pub restore_entry_mode: RestoreEntryMode,
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    pub slave_pre_command: Option<String>,
    pub slave_post_command: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            archive_type: ArchiveType::Normal,
            incremental_list_file: None,
            archive_part_size: None,
            directory_strip: 0,
            destination: None,
            owner: None,
            pattern_type: None,
            compress_algorithm: None,
            crypt_algorithm: None,
            crypt_type: CryptType::None,
            crypt_password_mode: CryptPasswordMode::Default,
            crypt_password: None,
            crypt_public_key: None,
            ftp_login_name: None,
            ftp_password: None,
            ssh_port: None,
            ssh_login_name: None,
            ssh_password: None,
            ssh_public_key: None,
            ssh_private_key: None,
            mounts: Vec::new(),
            max_storage_size: None,
            volume_size: None,
            ecc: false,
            archive_file_mode: ArchiveFileMode::Stop,
            restore_entry_mode: RestoreEntryMode::Stop,
            pre_command: None,
            post_command: None,
            slave_pre_command: None,
            slave_post_command: None,
        }
    }
}

/// A persistent declarative backup job.
#[derive(Debug, Clone)]
pub struct Job {
    pub uuid: String,
    pub name: String,
    pub slave_host: Option<SlaveHost>,
    pub storage_uri: Option<String>,
    pub include_entries: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub options: JobOptions,
    pub schedules: Vec<Schedule>,
    pub persistence: Vec<PersistenceRule>,
    pub comment: Option<String>,
    /// Absent for a job constructed in memory and not yet written to disk.
    pub file_path: Option<PathBuf>,
    pub file_mtime: Option<SystemTime>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Job {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            slave_host: None,
            storage_uri: None,
            include_entries: Vec::new(),
            exclude_patterns: Vec::new(),
            options: JobOptions::default(),
            schedules: Vec::new(),
            persistence: Vec::new(),
            comment: None,
            file_path: None,
            file_mtime: None,
        }
    }
}

/// One entry in the deprecated-key rewrite table.
struct DeprecatedKey {
    old: &'static str,
    new: &'static str,
    transform: fn(&str) -> String,
}

fn identity(value: &str) -> String {
    value.to_string()
}

fn overwrite_archive_files_transform(value: &str) -> String {
    if parse_bool(value).unwrap_or(false) {
        "overwrite".to_string()
    } else {
        "stop".to_string()
    }
}

const DEPRECATED_KEYS: &[DeprecatedKey] = &[
    DeprecatedKey { old: "remote-host-name", new: "slave-host-name", transform: identity },
    DeprecatedKey { old: "remote-host-port", new: "slave-host-port", transform: identity },
    DeprecatedKey { old: "remote-host-force-ssl", new: "slave-host-force-tls", transform: identity },
    DeprecatedKey { old: "overwrite-archive-files", new: "archive-file-mode", transform: overwrite_archive_files_transform },
];

fn resolve_deprecated(key: &str) -> Option<&'static DeprecatedKey> {
    DEPRECATED_KEYS.iter().find(|k| k.old == key)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a byte count with optional `K/M/G/T` unit suffix.
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 1024u64),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some('T') | Some('t') => (&value[..value.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|v| v * multiplier)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Section {
    Default,
    Schedule,
    Persistence(ArchiveType),
}

struct ScheduleBuilder {
    uuid: Option<String>,
    parent_uuid: Option<String>,
    date: String,
    weekdays: String,
    time: String,
    archive_type: ArchiveType,
    interval: u64,
    custom_text: Option<String>,
    enabled: bool,
    no_storage: bool,
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        ScheduleBuilder {
            uuid: None,
            parent_uuid: None,
            date: "*-*-*".to_string(),
            weekdays: "*".to_string(),
            time: "*:*".to_string(),
            archive_type: ArchiveType::Normal,
            interval: 0,
            custom_text: None,
            enabled: true,
            no_storage: false,
        }
    }
}

fn parse_date_field(s: &str) -> DateField {
    if s == "*" {
        DateField::Any
    } else {
        s.parse().map(DateField::Value).unwrap_or(DateField::Any)
    }
}

fn parse_date_triplet(s: &str) -> (DateField, DateField, DateField) {
    let mut parts = s.splitn(3, '-');
    let year = parts.next().map(parse_date_field).unwrap_or(DateField::Any);
    let month = parts.next().map(parse_date_field).unwrap_or(DateField::Any);
    let day = parts.next().map(parse_date_field).unwrap_or(DateField::Any);
    (year, month, day)
}

fn parse_time_pair(s: &str) -> (DateField, DateField) {
    let mut parts = s.splitn(2, ':');
    let hour = parts.next().map(parse_date_field).unwrap_or(DateField::Any);
    let minute = parts.next().map(parse_date_field).unwrap_or(DateField::Any);
    (hour, minute)
}

fn parse_weekdays(s: &str) -> WeekdaySet {
    if s.trim() == "*" {
        return WeekdaySet::Any;
    }
    use chrono::Weekday;
    let mut mask = 0u8;
    for name in s.split(',') {
        let day = match name.trim().to_ascii_lowercase().as_str() {
            "mon" => Weekday::Mon,
            "tue" => Weekday::Tue,
            "wed" => Weekday::Wed,
            "thu" => Weekday::Thu,
            "fri" => Weekday::Fri,
            "sat" => Weekday::Sat,
            "sun" => Weekday::Sun,
            _ => continue,
        };
        mask |= WeekdaySet::bit_for(day);
    }
    WeekdaySet::Days(mask)
}

impl ScheduleBuilder {
    fn build(self) -> Schedule {
        let (year, month, day) = parse_date_triplet(&self.date);
        let (hour, minute) = parse_time_pair(&self.time);
        Schedule {
            uuid: self.uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            parent_uuid: self.parent_uuid,
            year,
            month,
            day,
            weekdays: parse_weekdays(&self.weekdays),
            hour,
            minute,
            archive_type: self.archive_type,
            interval: self.interval,
            custom_text: self.custom_text,
            enabled: self.enabled,
            no_storage: self.no_storage,
            last_executed: None,
        }
    }
}

struct PersistenceBuilder {
    archive_type: ArchiveType,
    min_keep: Option<u32>,
    max_keep: Option<u32>,
    max_age_days: Option<u32>,
}

fn parse_sentinel_u32(value: &str) -> Option<u32> {
    if value.trim() == "*" || value.eq_ignore_ascii_case("all") || value.eq_ignore_ascii_case("unlimited") || value.eq_ignore_ascii_case("forever") {
        None
    } else {
        value.trim().parse().ok()
    }
}

/// Parses a job configuration file, tolerating and logging recoverable
/// errors line-by-line.
pub fn parse(name: &str, contents: &str) -> Job {
    let mut job = Job::new(name);
    let mut section = Section::Default;
    let mut schedule_builder: Option<ScheduleBuilder> = None;
    let mut persistence_builder: Option<PersistenceBuilder> = None;

    let flush_schedule = |job: &mut Job, builder: Option<ScheduleBuilder>| {
        if let Some(b) = builder {
            super::schedule::insert_deduped(&mut job.schedules, b.build());
        }
    };
    let flush_persistence = |job: &mut Job, builder: Option<PersistenceBuilder>| {
        if let Some(b) = builder {
            super::persistence::insert_deduped(
                &mut job.persistence,
                PersistenceRule {
                    id: job.persistence.len() as i64 + 1,
                    archive_type: b.archive_type,
                    min_keep: b.min_keep,
                    max_keep: b.max_keep,
                    max_age_days: b.max_age_days,
                },
            );
        }
    };

    for (line_no, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            flush_schedule(&mut job, schedule_builder.take());
            flush_persistence(&mut job, persistence_builder.take());

            let header = line.trim_start_matches('[').trim_end_matches(']').trim();
            section = if header.eq_ignore_ascii_case("schedule") {
                schedule_builder = Some(ScheduleBuilder::default());
                Section::Schedule
            } else if header.eq_ignore_ascii_case("end") {
                Section::Default
            } else if let Some(rest) = header_prefix(header, "persistence") {
                match rest.parse::<ArchiveType>() {
                    Ok(archive_type) => {
                        persistence_builder = Some(PersistenceBuilder {
                            archive_type,
                            min_keep: None,
                            max_keep: None,
                            max_age_days: None,
                        });
                        Section::Persistence(archive_type)
                    }
                    Err(()) => {
                        warn!("job {:?} line {}: unknown archive type '{}'", name, line_no + 1, rest);
                        Section::Default
                    }
                }
            } else {
                warn!("job {:?} line {}: unknown section '[{}]'", name, line_no + 1, header);
                Section::Default
            };
            continue;
        }

        let (raw_key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => {
                warn!("job {:?} line {}: expected 'key = value'", name, line_no + 1);
                continue;
            }
        };

        let (key, value) = match resolve_deprecated(raw_key) {
            Some(dep) => {
                warn!("job {:?} line {}: deprecated key '{}', use '{}'", name, line_no + 1, dep.old, dep.new);
                (dep.new.to_string(), (dep.transform)(value))
            }
            None => (raw_key.to_string(), value.to_string()),
        };

        match &section {
            Section::Default => apply_default_key(&mut job, &key, &value, name, line_no),
            Section::Schedule => {
                if let Some(builder) = schedule_builder.as_mut() {
                    apply_schedule_key(builder, &key, &value, name, line_no);
                }
            }
            Section::Persistence(_) => {
                if let Some(builder) = persistence_builder.as_mut() {
                    apply_persistence_key(builder, &key, &value, name, line_no);
                }
            }
        }
    }

    flush_schedule(&mut job, schedule_builder.take());
    flush_persistence(&mut job, persistence_builder.take());

    job
}

fn header_prefix<'a>(header: &'a str, prefix: &str) -> Option<&'a str> {
    if header.len() > prefix.len() && header[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(header[prefix.len()..].trim())
    } else {
        None
    }
}

fn apply_default_key(job: &mut Job, key: &str, value: &str, name: &str, line_no: usize) {
    let opts = &mut job.options;
    match key {
        "UUID" => job.uuid = value.to_string(),
        "slave-host-name" => {
            let host = job.slave_host.get_or_insert(SlaveHost { name: String::new(), port: 9735, force_tls: false });
            host.name = value.to_string();
        }
        "slave-host-port" => {
            if let Ok(port) = value.parse() {
                job.slave_host.get_or_insert(SlaveHost { name: String::new(), port: 9735, force_tls: false }).port = port;
            } else {
                warn!("job {:?} line {}: invalid slave-host-port '{}'", name, line_no + 1, value);
            }
        }
        "slave-host-force-tls" => {
            if let Some(b) = parse_bool(value) {
                job.slave_host.get_or_insert(SlaveHost { name: String::new(), port: 9735, force_tls: false }).force_tls = b;
            }
        }
        "destination" => opts.destination = Some(value.to_string()),
        "owner" => opts.owner = Some(value.to_string()),
        "archive-type" => match value.parse() {
            Ok(t) => opts.archive_type = t,
            Err(()) => warn!("job {:?} line {}: invalid archive-type '{}'", name, line_no + 1, value),
        },
        "incremental-list-file" => opts.incremental_list_file = Some(value.to_string()),
        "archive-part-size" => match parse_byte_size(value) {
            Some(v) => opts.archive_part_size = Some(v),
            None => warn!("job {:?} line {}: invalid archive-part-size '{}'", name, line_no + 1, value),
        },
        "directory-strip" => match value.parse() {
            Ok(v) => opts.directory_strip = v,
            Err(_) => warn!("job {:?} line {}: invalid directory-strip '{}'", name, line_no + 1, value),
        },
        "pattern-type" => opts.pattern_type = Some(value.to_string()),
        "compress-algorithm" => opts.compress_algorithm = Some(value.to_string()),
        "crypt-algorithm" => opts.crypt_algorithm = Some(value.to_string()),
        "crypt-type" => {
            opts.crypt_type = match value.to_ascii_lowercase().as_str() {
                "none" => CryptType::None,
                "symmetric" => CryptType::Symmetric,
                "asymmetric" => CryptType::Asymmetric,
                _ => {
                    warn!("job {:?} line {}: invalid crypt-type '{}'", name, line_no + 1, value);
                    opts.crypt_type
                }
            }
        }
        "crypt-password-mode" => {
            opts.crypt_password_mode = match value.to_ascii_lowercase().as_str() {
                "default" => CryptPasswordMode::Default,
                "ask" => CryptPasswordMode::Ask,
                "none" => CryptPasswordMode::None,
                "config" => CryptPasswordMode::Config,
                _ => {
                    warn!("job {:?} line {}: invalid crypt-password-mode '{}'", name, line_no + 1, value);
                    opts.crypt_password_mode
                }
            }
        }
        "crypt-password" => opts.crypt_password = Some(value.to_string()),
        "crypt-public-key" => opts.crypt_public_key = Some(value.to_string()),
        "ftp-login-name" => opts.ftp_login_name = Some(value.to_string()),
        "ftp-password" => opts.ftp_password = Some(value.to_string()),
        "ssh-port" => opts.ssh_port = value.parse().ok(),
        "ssh-login-name" => opts.ssh_login_name = Some(value.to_string()),
        "ssh-password" => opts.ssh_password = Some(value.to_string()),
        "ssh-public-key" => opts.ssh_public_key = Some(value.to_string()),
        "ssh-private-key" => opts.ssh_private_key = Some(value.to_string()),
        "include-file" | "include-image" => job.include_entries.push(value.to_string()),
        "exclude" => job.exclude_patterns.push(value.to_string()),
        "mount" => opts.mounts.push(value.to_string()),
        "max-storage-size" => opts.max_storage_size = parse_byte_size(value),
        "volume-size" => opts.volume_size = parse_byte_size(value),
        "ecc" => opts.ecc = parse_bool(value).unwrap_or(false),
        "archive-file-mode" => {
            opts.archive_file_mode = match value.to_ascii_lowercase().as_str() {
                "stop" => ArchiveFileMode::Stop,
                "overwrite" => ArchiveFileMode::Overwrite,
                "append" => ArchiveFileMode::Append,
                _ => {
                    warn!("job {:?} line {}: invalid archive-file-mode '{}'", name, line_no + 1, value);
                    opts.archive_file_mode
                }
            }
        }
        "restore-entry-mode" => {
            opts.restore_entry_mode = match value.to_ascii_lowercase().as_str() {
                "stop" => RestoreEntryMode::Stop,
                "overwrite" => RestoreEntryMode::Overwrite,
                _ => {
                    warn!("job {:?} line {}: invalid restore-entry-mode '{}'", name, line_no + 1, value);
                    opts.restore_entry_mode
                }
            }
        }
        "pre-command" => opts.pre_command = Some(value.to_string()),
        "post-command" => opts.post_command = Some(value.to_string()),
        "slave-pre-command" => opts.slave_pre_command = Some(value.to_string()),
        "slave-post-command" => opts.slave_post_command = Some(value.to_string()),
        "comment" => job.comment = Some(value.to_string()),
        "archive-name" | "storage-uri" => job.storage_uri = Some(value.to_string()),
        _ => warn!("job {:?} line {}: unknown key '{}'", name, line_no + 1, key),
    }
}

fn apply_schedule_key(builder: &mut ScheduleBuilder, key: &str, value: &str, name: &str, line_no: usize) {
    match key {
        "UUID" => builder.uuid = Some(value.to_string()),
        "parentUUID" => builder.parent_uuid = Some(value.to_string()),
        "date" => builder.date = value.to_string(),
        "weekdays" => builder.weekdays = value.to_string(),
        "time" => builder.time = value.to_string(),
        "archive-type" => match value.parse() {
            Ok(t) => builder.archive_type = t,
            Err(()) => warn!("job {:?} line {}: invalid archive-type '{}'", name, line_no + 1, value),
        },
        "interval" => builder.interval = value.parse().unwrap_or(0),
        "text" => builder.custom_text = Some(value.to_string()),
        "enabled" => builder.enabled = parse_bool(value).unwrap_or(true),
        "no-storage" => builder.no_storage = parse_bool(value).unwrap_or(false),
        _ => warn!("job {:?} line {}: unknown schedule key '{}'", name, line_no + 1, key),
    }
}

fn apply_persistence_key(builder: &mut PersistenceBuilder, key: &str, value: &str, name: &str, line_no: usize) {
    match key {
        "min-keep" => builder.min_keep = parse_sentinel_u32(value),
        "max-keep" => builder.max_keep = parse_sentinel_u32(value),
        "max-age" => builder.max_age_days = parse_sentinel_u32(value),
        _ => warn!("job {:?} line {}: unknown persistence key '{}'", name, line_no + 1, key),
    }
}

/// Strict single-value setter used by the round-trip rewrite path (§7
/// ambient note): unlike [`parse`], an invalid value is a hard error
/// rather than a skipped line.
pub fn set_value(job: &mut Job, key: &str, value: &str) -> Result<(), JobError> {
    let (key, value) = match resolve_deprecated(key) {
        Some(dep) => (dep.new.to_string(), (dep.transform)(value)),
        None => (key.to_string(), value.to_string()),
    };

    // A handful of keys have a closed set of valid values; reject those up
    // front instead of silently keeping the previous value the way the
    // lenient whole-file loader does.
    match key.as_str() {
        "archive-type" if value.parse::<ArchiveType>().is_err() => {
            return Err(JobError::Parse { line: 0, message: format!("invalid archive-type '{}'", value) });
        }
        "crypt-type" if !matches!(value.to_ascii_lowercase().as_str(), "none" | "symmetric" | "asymmetric") => {
            return Err(JobError::Parse { line: 0, message: format!("invalid crypt-type '{}'", value) });
        }
        "archive-file-mode" if !matches!(value.to_ascii_lowercase().as_str(), "stop" | "overwrite" | "append") => {
            return Err(JobError::Parse { line: 0, message: format!("invalid archive-file-mode '{}'", value) });
        }
        "archive-part-size" | "max-storage-size" | "volume-size" if parse_byte_size(&value).is_none() => {
            return Err(JobError::Parse { line: 0, message: format!("invalid byte size '{}'", value) });
        }
        _ => {}
    }

    apply_default_key(job, &key, &value, &job.name.clone(), 0);
    Ok(())
}

/// Renders `job` back to its file-line representation. Line-preserving in
/// spirit: default-section scalar keys are emitted in the order listed
/// here (a superset of whatever was loaded, since unknown keys from the
/// original file are not round-tripped). Round-trip holds modulo key
/// ordering inside sections and deprecated-key normalization.
pub fn render(job: &Job) -> String {
    let mut out = String::new();
    let mut emit = |key: &str, value: &str| {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    };

    emit("UUID", &job.uuid);
    if let Some(host) = &job.slave_host {
        emit("slave-host-name", &host.name);
        emit("slave-host-port", &host.port.to_string());
        emit("slave-host-force-tls", if host.force_tls { "yes" } else { "no" });
    }
    if let Some(uri) = &job.storage_uri {
        emit("archive-name", uri);
    }
    emit("archive-type", job.options.archive_type.name());
    if let Some(v) = &job.options.incremental_list_file {
        emit("incremental-list-file", v);
    }
    if let Some(v) = job.options.archive_part_size {
        emit("archive-part-size", &v.to_string());
    }
    if job.options.directory_strip != 0 {
        emit("directory-strip", &job.options.directory_strip.to_string());
    }
    if let Some(v) = &job.options.destination {
        emit("destination", v);
    }
    if let Some(v) = &job.options.owner {
        emit("owner", v);
    }
    for entry in &job.include_entries {
        emit("include-file", entry);
    }
    for pattern in &job.exclude_patterns {
        emit("exclude", pattern);
    }
    for mount in &job.options.mounts {
        emit("mount", mount);
    }
    if let Some(v) = &job.comment {
        emit("comment", v);
    }

    for schedule in &job.schedules {
        out.push_str("[schedule]\n");
        out.push_str(&format!("UUID = {}\n", schedule.uuid));
        out.push_str(&format!("archive-type = {}\n", schedule.archive_type.name()));
        out.push_str(&format!("interval = {}\n", schedule.interval));
        out.push_str(&format!("enabled = {}\n", if schedule.enabled { "yes" } else { "no" }));
        if schedule.no_storage {
            out.push_str("no-storage = yes\n");
        }
        if let Some(text) = &schedule.custom_text {
            out.push_str(&format!("text = {}\n", text));
        }
        out.push_str("[end]\n");
    }

    for rule in &job.persistence {
        out.push_str(&format!("[persistence {}]\n", rule.archive_type.name()));
        out.push_str(&format!("min-keep = {}\n", rule.min_keep.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())));
        out.push_str(&format!("max-keep = {}\n", rule.max_keep.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())));
        out.push_str(&format!("max-age = {}\n", rule.max_age_days.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())));
        out.push_str("[end]\n");
    }

    out
}

#[cfg(unix)]
fn tighten_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn tighten_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Writes `job` back to its file, tightening permissions to owner
/// read/write.
pub fn write_file(path: &Path, job: &Job) -> Result<(), JobError> {
    std::fs::write(path, render(job))?;
    tighten_permissions(path)?;
    Ok(())
}

/// Loads every job file in `jobs_dir`: regular, readable files not
/// starting with `.`. Duplicate uuids across jobs
/// are warned about, not rejected.
pub fn discover(jobs_dir: &Path) -> Result<Vec<Job>, JobError> {
    let mut jobs = Vec::new();
    let entries = match std::fs::read_dir(jobs_dir) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
        Err(err) => return Err(JobError::Io(err)),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        let contents = std::fs::read_to_string(&path)?;
        let mut job = parse(&file_name, &contents);
        job.file_path = Some(path.clone());
        job.file_mtime = metadata.modified().ok();
        jobs.push(job);
    }

    let mut seen = HashMap::new();
    for job in &jobs {
        if let Some(existing) = seen.insert(job.uuid.clone(), job.name.clone()) {
            warn!("duplicate job uuid {} shared by '{}' and '{}'", job.uuid, existing, job.name);
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_fields() {
        let text = "UUID = abc-123\narchive-type = full\ndestination = /backup\ninclude-file = /home\nexclude = *.tmp\n";
        let job = parse("myjob", text);
        assert_eq!(job.uuid, "abc-123");
        assert_eq!(job.options.archive_type, ArchiveType::Full);
        assert_eq!(job.options.destination.as_deref(), Some("/backup"));
        assert_eq!(job.include_entries, vec!["/home".to_string()]);
        assert_eq!(job.exclude_patterns, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn deprecated_remote_host_name_maps_to_slave_host() {
        let text = "remote-host-name = worker1\n";
        let job = parse("myjob", text);
        assert_eq!(job.slave_host.unwrap().name, "worker1");
    }

    #[test]
    fn deprecated_overwrite_archive_files_maps_to_mode() {
        let text = "overwrite-archive-files = yes\n";
        let job = parse("myjob", text);
        assert_eq!(job.options.archive_file_mode, ArchiveFileMode::Overwrite);
    }

    #[test]
    fn schedule_sections_with_identical_content_are_deduped() {
        let text = "\
[schedule]
UUID = s1
archive-type = full
interval = 0
[end]
[schedule]
UUID = s2
archive-type = full
interval = 0
[end]
";
        let job = parse("myjob", text);
        assert_eq!(job.schedules.len(), 1);
    }

    #[test]
    fn persistence_section_sentinels_parse_as_none() {
        let text = "[persistence full]\nmin-keep = *\nmax-keep = 5\nmax-age = forever\n[end]\n";
        let job = parse("myjob", text);
        assert_eq!(job.persistence.len(), 1);
        let rule = &job.persistence[0];
        assert_eq!(rule.min_keep, None);
        assert_eq!(rule.max_keep, Some(5));
        assert_eq!(rule.max_age_days, None);
    }

    #[test]
    fn byte_size_units() {
        assert_eq!(parse_byte_size("10"), Some(10));
        assert_eq!(parse_byte_size("10K"), Some(10 * 1024));
        assert_eq!(parse_byte_size("2G"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn round_trip_preserves_semantic_content() {
        let text = "UUID = abc\narchive-type = incremental\ndestination = /backup\ninclude-file = /home\n";
        let job = parse("myjob", text);
        let rendered = render(&job);
        let reparsed = parse("myjob", &rendered);
        assert_eq!(job.uuid, reparsed.uuid);
        assert_eq!(job.options.archive_type, reparsed.options.archive_type);
        assert_eq!(job.options.destination, reparsed.options.destination);
        assert_eq!(job.include_entries, reparsed.include_entries);
    }

    #[test]
    fn invalid_line_is_skipped_not_fatal() {
        let text = "this is not valid\nUUID = abc\n";
        let job = parse("myjob", text);
        assert_eq!(job.uuid, "abc");
    }
}
