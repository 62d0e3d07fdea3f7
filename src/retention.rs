//! Retention manager.
//!
//! Keeps the raw and processed storage locations under one shared byte
//! budget. A sweep runs in two passes:
//!
//! 1. age pass: files older than `max_age` are deleted even when under budget
//! 2. budget pass: while the total exceeds `max_bytes`, delete in strategy
//!    order (`oldest_files` or `oldest_sessions`)
//!
//! Both passes honour the same protections:
//! - the newest `min_files` files of each location are kept
//! - raw files are deleted only when they arrived before the consumption
//!   watermark, the arrival time of the newest raw frame the processor has
//!   taken (see [`arrival_time`])
//! - in-progress `.partial` files are never touched
//!
//! Sweeps run on their own thread (`RetentionRunner`) and never block the
//! frame pipeline.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::sink::file::is_partial;

const DEFAULT_MIN_FILES: usize = 10;
const DEFAULT_INTERVAL_SECS: u64 = 300;
/// Empty directories younger than this may be about to receive a file.
const EMPTY_DIR_GRACE: Duration = Duration::from_secs(60);
const SHUTDOWN_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    /// Oldest files first, across all locations.
    #[default]
    OldestFiles,
    /// Files inside the oldest session sub-directories first; the newest
    /// session of each location is never touched.
    OldestSessions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageRole {
    Raw,
    Processed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionTarget {
    pub dir: PathBuf,
    pub role: StorageRole,
    /// Newest files that are always kept.
    #[serde(default = "default_min_files")]
    pub min_files: usize,
}

fn default_min_files() -> usize {
    DEFAULT_MIN_FILES
}

impl RetentionTarget {
    pub fn raw(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            role: StorageRole::Raw,
            min_files: DEFAULT_MIN_FILES,
        }
    }

    pub fn processed(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            role: StorageRole::Processed,
            min_files: DEFAULT_MIN_FILES,
        }
    }

    pub fn with_min_files(mut self, min_files: usize) -> Self {
        self.min_files = min_files;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub targets: Vec<RetentionTarget>,
    /// Shared budget across all targets.
    pub max_bytes: u64,
    pub max_age: Option<Duration>,
    pub strategy: RetentionStrategy,
    pub interval: Duration,
}

impl RetentionPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            targets: Vec::new(),
            max_bytes,
            max_age: None,
            strategy: RetentionStrategy::OldestFiles,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
        }
    }

    pub fn with_target(mut self, target: RetentionTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(anyhow!("retention max_bytes must be greater than zero"));
        }
        if self.interval.is_zero() {
            return Err(anyhow!("retention interval must be greater than zero"));
        }
        if self.targets.is_empty() {
            return Err(anyhow!("retention has no storage locations"));
        }
        Ok(())
    }
}

/// When a file landed in its directory: the later of its creation and
/// modification times. Copies that preserve an old mtime (`cp -p`, rsync)
/// still get a fresh creation time. Falls back to mtime where the
/// filesystem does not record creation.
pub fn arrival_time(meta: &std::fs::Metadata) -> SystemTime {
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    match meta.created() {
        Ok(created) => created.max(modified),
        Err(_) => modified,
    }
}

/// Arrival time of the newest raw frame taken by the processor.
/// Raw files that arrived at or after this instant are never deleted.
#[derive(Clone, Debug, Default)]
pub struct ConsumedWatermark {
    inner: Arc<Mutex<Option<SystemTime>>>,
}

impl ConsumedWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the watermark forward; earlier instants are ignored.
    pub fn advance(&self, consumed: SystemTime) {
        let mut mark = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if mark.map_or(true, |current| consumed > current) {
            *mark = Some(consumed);
        }
    }

    pub fn get(&self) -> Option<SystemTime> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocationReport {
    pub dir: PathBuf,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub bytes_remaining: u64,
    pub dirs_removed: usize,
    pub errors: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub locations: Vec<LocationReport>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub max_bytes: u64,
}

impl RetentionReport {
    pub fn files_deleted(&self) -> usize {
        self.locations.iter().map(|l| l.files_deleted).sum()
    }

    pub fn bytes_freed(&self) -> u64 {
        self.locations.iter().map(|l| l.bytes_freed).sum()
    }

    pub fn within_budget(&self) -> bool {
        self.bytes_after <= self.max_bytes
    }
}

#[derive(Clone, Debug)]
struct StoredFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
    arrived: SystemTime,
    location: usize,
    /// First-level sub-directory of the location, if any.
    session: Option<PathBuf>,
    deletable: bool,
    deleted: bool,
}

pub struct RetentionManager {
    policy: RetentionPolicy,
    watermark: ConsumedWatermark,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy, watermark: ConsumedWatermark) -> Self {
        Self { policy, watermark }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn watermark(&self) -> &ConsumedWatermark {
        &self.watermark
    }

    /// Runs one sweep as of `now`.
    pub fn sweep(&self, now: SystemTime) -> Result<RetentionReport> {
        let watermark = self.watermark.get();
        let mut files = Vec::new();
        let mut locations = Vec::with_capacity(self.policy.targets.len());
        for (index, target) in self.policy.targets.iter().enumerate() {
            locations.push(LocationReport {
                dir: target.dir.clone(),
                ..LocationReport::default()
            });
            if !target.dir.exists() {
                continue;
            }
            let mut found = Vec::new();
            collect_files(&target.dir, &target.dir, index, &mut found)?;
            mark_deletable(&mut found, target, watermark);
            files.extend(found);
        }

        let bytes_before: u64 = files.iter().map(|f| f.size).sum();
        let mut total = bytes_before;

        if let Some(max_age) = self.policy.max_age {
            if let Some(cutoff) = now.checked_sub(max_age) {
                for file in files.iter_mut() {
                    let location = file.location;
                    if file.deletable
                        && file.modified < cutoff
                        && delete_file(file, &mut locations[location])
                    {
                        total -= file.size;
                    }
                }
            }
        }

        if total > self.policy.max_bytes {
            log::info!(
                "retention: {} bytes stored, budget {}; pruning ({:?})",
                total,
                self.policy.max_bytes,
                self.policy.strategy
            );
            let order = match self.policy.strategy {
                RetentionStrategy::OldestFiles => oldest_files_order(&files),
                RetentionStrategy::OldestSessions => oldest_sessions_order(&files),
            };
            for index in order {
                if total <= self.policy.max_bytes {
                    break;
                }
                let file = &mut files[index];
                let location = file.location;
                if delete_file(file, &mut locations[location]) {
                    total -= file.size;
                }
            }
            if total > self.policy.max_bytes {
                log::warn!(
                    "retention: still {} bytes over budget after sweep (floors or unconsumed raw frames)",
                    total - self.policy.max_bytes
                );
            }
        }

        for file in files.iter().filter(|f| !f.deleted) {
            locations[file.location].bytes_remaining += file.size;
        }
        for (target, report) in self.policy.targets.iter().zip(locations.iter_mut()) {
            if target.dir.exists() {
                report.dirs_removed = remove_empty_dirs(&target.dir, &target.dir, now);
            }
        }

        Ok(RetentionReport {
            locations,
            bytes_before,
            bytes_after: total,
            max_bytes: self.policy.max_bytes,
        })
    }
}

fn collect_files(root: &Path, dir: &Path, location: usize, out: &mut Vec<StoredFile>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if dir != root && err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(anyhow!("retention: cannot read {}: {}", dir.display(), err)),
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("retention: skipping entry in {}: {}", dir.display(), err);
                continue;
            }
        };
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // deleted between listing and stat
            Err(_) => continue,
        };
        if meta.is_dir() {
            collect_files(root, &path, location, out)?;
            continue;
        }
        if !meta.is_file() || is_partial(&path) {
            continue;
        }
        let session = path
            .strip_prefix(root)
            .ok()
            .and_then(|rel| {
                let mut components = rel.components();
                let first = components.next()?;
                components.next().map(|_| root.join(first))
            });
        out.push(StoredFile {
            path,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            arrived: arrival_time(&meta),
            location,
            session,
            deletable: false,
            deleted: false,
        });
    }
    Ok(())
}

/// Applies the floor and, for raw storage, the consumption watermark.
fn mark_deletable(files: &mut [StoredFile], target: &RetentionTarget, watermark: Option<SystemTime>) {
    let mut newest_first: Vec<usize> = (0..files.len()).collect();
    newest_first.sort_by(|&a, &b| {
        files[b]
            .modified
            .cmp(&files[a].modified)
            .then_with(|| files[b].path.cmp(&files[a].path))
    });
    for (rank, &index) in newest_first.iter().enumerate() {
        let file = &mut files[index];
        let above_floor = rank >= target.min_files;
        let consumed = match target.role {
            StorageRole::Processed => true,
            StorageRole::Raw => watermark.is_some_and(|mark| file.arrived < mark),
        };
        file.deletable = above_floor && consumed;
    }
}

fn oldest_files_order(files: &[StoredFile]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..files.len())
        .filter(|&i| files[i].deletable && !files[i].deleted)
        .collect();
    order.sort_by(|&a, &b| {
        files[a]
            .modified
            .cmp(&files[b].modified)
            .then_with(|| files[a].path.cmp(&files[b].path))
    });
    order
}

fn oldest_sessions_order(files: &[StoredFile]) -> Vec<usize> {
    // session dir -> (location, dir mtime, member files)
    let mut sessions: BTreeMap<PathBuf, (usize, SystemTime, Vec<usize>)> = BTreeMap::new();
    for (index, file) in files.iter().enumerate() {
        let Some(session) = file.session.as_ref() else {
            continue;
        };
        let entry = sessions.entry(session.clone()).or_insert_with(|| {
            let modified = std::fs::metadata(session)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (file.location, modified, Vec::new())
        });
        entry.2.push(index);
    }

    let mut ordered: Vec<(PathBuf, usize, SystemTime, Vec<usize>)> = sessions
        .into_iter()
        .map(|(dir, (location, modified, members))| (dir, location, modified, members))
        .collect();
    ordered.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

    // newest session per location stays untouched
    let mut newest: BTreeMap<usize, PathBuf> = BTreeMap::new();
    for (dir, location, _, _) in &ordered {
        newest.insert(*location, dir.clone());
    }

    let mut order = Vec::new();
    for (dir, location, _, mut members) in ordered {
        if newest.get(&location) == Some(&dir) {
            continue;
        }
        members.retain(|&i| files[i].deletable && !files[i].deleted);
        members.sort_by(|&a, &b| {
            files[a]
                .modified
                .cmp(&files[b].modified)
                .then_with(|| files[a].path.cmp(&files[b].path))
        });
        order.extend(members);
    }
    order
}

fn delete_file(file: &mut StoredFile, report: &mut LocationReport) -> bool {
    if file.deleted {
        return false;
    }
    match std::fs::remove_file(&file.path) {
        Ok(()) => {
            file.deleted = true;
            report.files_deleted += 1;
            report.bytes_freed += file.size;
            log::info!("retention: deleted {} ({} bytes)", file.path.display(), file.size);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // already gone; it no longer counts against the budget
            file.deleted = true;
            true
        }
        Err(err) => {
            report.errors += 1;
            log::warn!("retention: cannot delete {}: {}", file.path.display(), err);
            false
        }
    }
}

/// Removes empty sub-directories below `root`, bottom-up. `root` itself stays.
fn remove_empty_dirs(root: &Path, dir: &Path, now: SystemTime) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            removed += remove_empty_dirs(root, &path, now);
        }
    }
    if dir == root {
        return removed;
    }
    let is_empty = std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
    let settled = std::fs::metadata(dir)
        .and_then(|m| m.modified())
        .is_ok_and(|modified| now.duration_since(modified).is_ok_and(|age| age >= EMPTY_DIR_GRACE));
    if is_empty && settled {
        match std::fs::remove_dir(dir) {
            Ok(()) => {
                log::debug!("retention: removed empty directory {}", dir.display());
                removed += 1;
            }
            Err(err) => log::debug!("retention: cannot remove {}: {}", dir.display(), err),
        }
    }
    removed
}

/// Periodic sweep thread.
pub struct RetentionRunner {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RetentionRunner {
    /// Sweeps every `policy.interval`, starting one interval after launch,
    /// and passes each report to `on_report`.
    pub fn start<F>(manager: RetentionManager, on_report: F) -> Result<Self>
    where
        F: Fn(RetentionReport) + Send + 'static,
    {
        manager.policy.validate()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || {
                let interval = manager.policy.interval;
                while sleep_unless_stopped(&thread_shutdown, interval) {
                    match manager.sweep(SystemTime::now()) {
                        Ok(report) => {
                            if report.files_deleted() > 0 {
                                log::info!(
                                    "retention: freed {} bytes in {} files; {} bytes remain",
                                    report.bytes_freed(),
                                    report.files_deleted(),
                                    report.bytes_after
                                );
                            }
                            on_report(report);
                        }
                        Err(err) => log::error!("retention: sweep failed: {:#}", err),
                    }
                }
            })?;
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("retention thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for RetentionRunner {
    fn drop(&mut self) {
        let _ = self.halt();
    }
}

fn sleep_unless_stopped(shutdown: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(SHUTDOWN_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !shutdown.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::UNIX_EPOCH;

    fn write_file(path: &Path, size: usize, age_secs: u64) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, vec![0u8; size])?;
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        File::options().write(true).open(path)?.set_modified(when)?;
        Ok(())
    }

    fn remaining(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    names.push(path.file_name().unwrap().to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        names
    }

    #[test]
    fn budget_pass_deletes_oldest_processed_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (i, age) in [500u64, 400, 300, 200, 100].iter().enumerate() {
            write_file(&dir.path().join(format!("f{}.png", i)), 100, *age)?;
        }
        let policy = RetentionPolicy::new(250)
            .with_target(RetentionTarget::processed(dir.path()).with_min_files(1));
        let report = RetentionManager::new(policy, ConsumedWatermark::new()).sweep(SystemTime::now())?;

        assert_eq!(report.bytes_before, 500);
        assert_eq!(report.bytes_after, 200);
        assert!(report.within_budget());
        assert_eq!(report.files_deleted(), 3);
        assert_eq!(remaining(dir.path()), vec!["f3.png", "f4.png"]);
        Ok(())
    }

    #[test]
    fn floor_wins_over_budget() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..4u64 {
            write_file(&dir.path().join(format!("f{}.png", i)), 100, 100 - i)?;
        }
        let policy = RetentionPolicy::new(50)
            .with_target(RetentionTarget::processed(dir.path()).with_min_files(3));
        let report = RetentionManager::new(policy, ConsumedWatermark::new()).sweep(SystemTime::now())?;
        assert_eq!(report.files_deleted(), 1);
        assert!(!report.within_budget());
        assert_eq!(remaining(dir.path()), vec!["f1.png", "f2.png", "f3.png"]);
        Ok(())
    }

    #[test]
    fn raw_files_wait_for_the_watermark() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join("old.png"), 100, 300)?;
        std::thread::sleep(Duration::from_millis(20));
        write_file(&dir.path().join("consumed.png"), 100, 200)?;
        std::thread::sleep(Duration::from_millis(20));
        write_file(&dir.path().join("pending.png"), 100, 100)?;
        let policy = RetentionPolicy::new(1)
            .with_target(RetentionTarget::raw(dir.path()).with_min_files(0));
        let watermark = ConsumedWatermark::new();
        let manager = RetentionManager::new(policy, watermark.clone());

        // nothing consumed yet: nothing raw may go
        let report = manager.sweep(SystemTime::now())?;
        assert_eq!(report.files_deleted(), 0);

        let consumed_at = arrival_time(&fs::metadata(dir.path().join("consumed.png"))?);
        watermark.advance(consumed_at);
        watermark.advance(UNIX_EPOCH);
        assert_eq!(watermark.get(), Some(consumed_at));

        manager.sweep(SystemTime::now())?;
        assert_eq!(remaining(dir.path()), vec!["consumed.png", "pending.png"]);
        Ok(())
    }

    #[test]
    fn copied_file_with_old_mtime_survives_until_consumed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join("consumed.png"), 100, 0)?;
        let consumed = fs::metadata(dir.path().join("consumed.png"))?;
        if consumed.created().is_err() {
            // no creation time on this filesystem; arrival falls back to mtime
            return Ok(());
        }
        let watermark = ConsumedWatermark::new();
        watermark.advance(arrival_time(&consumed));

        std::thread::sleep(Duration::from_millis(20));
        // dropped later, as `cp -p` would, carrying an hour-old mtime
        write_file(&dir.path().join("copied.png"), 100, 3600)?;
        let copied = fs::metadata(dir.path().join("copied.png"))?;
        assert!(copied.modified()? < watermark.get().unwrap());
        assert!(arrival_time(&copied) >= watermark.get().unwrap());

        let policy = RetentionPolicy::new(1)
            .with_target(RetentionTarget::raw(dir.path()).with_min_files(0));
        let report = RetentionManager::new(policy, watermark).sweep(SystemTime::now())?;
        assert_eq!(report.files_deleted(), 0);
        assert_eq!(remaining(dir.path()), vec!["consumed.png", "copied.png"]);
        Ok(())
    }

    #[test]
    fn partial_files_are_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join(".frame.png.partial"), 1000, 1000)?;
        write_file(&dir.path().join("frame.png"), 10, 10)?;
        let policy = RetentionPolicy::new(5)
            .with_target(RetentionTarget::processed(dir.path()).with_min_files(0));
        let report = RetentionManager::new(policy, ConsumedWatermark::new()).sweep(SystemTime::now())?;
        assert_eq!(report.bytes_before, 10);
        assert!(dir.path().join(".frame.png.partial").exists());
        assert!(!dir.path().join("frame.png").exists());
        Ok(())
    }

    #[test]
    fn age_pass_runs_under_budget() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join("ancient.png"), 10, 10 * 86_400)?;
        write_file(&dir.path().join("fresh.png"), 10, 60)?;
        let mut policy = RetentionPolicy::new(u64::MAX)
            .with_target(RetentionTarget::processed(dir.path()).with_min_files(0));
        policy.max_age = Some(Duration::from_secs(86_400));
        RetentionManager::new(policy, ConsumedWatermark::new()).sweep(SystemTime::now())?;
        assert_eq!(remaining(dir.path()), vec!["fresh.png"]);
        Ok(())
    }

    #[test]
    fn oldest_sessions_spares_the_newest_session() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join("20240101/a.png"), 100, 3000)?;
        write_file(&dir.path().join("20240102/b.png"), 100, 2000)?;
        write_file(&dir.path().join("20240103/c.png"), 100, 1000)?;
        let set_dir_time = |name: &str, age: u64| -> Result<()> {
            let when = SystemTime::now() - Duration::from_secs(age);
            File::open(dir.path().join(name))?.set_modified(when)?;
            Ok(())
        };
        set_dir_time("20240101", 3000)?;
        set_dir_time("20240102", 2000)?;
        set_dir_time("20240103", 1000)?;

        let mut policy = RetentionPolicy::new(50)
            .with_target(RetentionTarget::processed(dir.path()).with_min_files(0));
        policy.strategy = RetentionStrategy::OldestSessions;
        let report = RetentionManager::new(policy, ConsumedWatermark::new()).sweep(SystemTime::now())?;

        assert_eq!(report.files_deleted(), 2);
        assert_eq!(remaining(dir.path()), vec!["c.png"]);
        Ok(())
    }

    #[test]
    fn shared_budget_spans_locations() -> Result<()> {
        let raw = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        write_file(&raw.path().join("r0.png"), 100, 400)?;
        write_file(&raw.path().join("r1.png"), 100, 100)?;
        write_file(&out.path().join("p0.png"), 100, 300)?;
        write_file(&out.path().join("p1.png"), 100, 50)?;

        let watermark = ConsumedWatermark::new();
        watermark.advance(SystemTime::now());
        let policy = RetentionPolicy::new(200)
            .with_target(RetentionTarget::raw(raw.path()).with_min_files(0))
            .with_target(RetentionTarget::processed(out.path()).with_min_files(0));
        let report = RetentionManager::new(policy, watermark).sweep(SystemTime::now())?;

        assert_eq!(report.locations.len(), 2);
        assert_eq!(report.locations[0].files_deleted, 1);
        assert_eq!(report.locations[1].files_deleted, 1);
        assert_eq!(remaining(raw.path()), vec!["r1.png"]);
        assert_eq!(remaining(out.path()), vec!["p1.png"]);
        Ok(())
    }

    #[test]
    fn validation_rejects_zero_budget() {
        let policy = RetentionPolicy::new(0).with_target(RetentionTarget::raw("/tmp"));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn runner_reports_and_stops() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_file(&dir.path().join("a.png"), 10, 10)?;
        let mut policy = RetentionPolicy::new(1_000)
            .with_target(RetentionTarget::processed(dir.path()));
        policy.interval = Duration::from_millis(20);
        let (tx, rx) = std::sync::mpsc::channel();
        let runner = RetentionRunner::start(RetentionManager::new(policy, ConsumedWatermark::new()), move |report| {
            let _ = tx.send(report);
        })?;
        let report = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(report.bytes_after, 10);
        runner.stop()?;
        Ok(())
    }
}
