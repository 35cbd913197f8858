// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Crash-safe configuration & job persistence. Every write lands in a
// temporary sibling file first and is `rename`d into place, so a crash
// mid-write never leaves a torn `printers.conf`/`jobs.cache`/spool file —
// the rename is atomic on the same filesystem. Dirty-bit values match the
// classic CUPS scheduler's `CUPSD_DIRTY_*` flag weights so the bits keep
// their familiar numbering even though nothing outside this crate reads
// them directly.

use std::fs;
use std::path::{Path, PathBuf};

use presswerk_core::error::{Result, SchedulerError};
use presswerk_core::types::{Class, Job, Printer, Subscription};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};

pub const DIRTY_PRINTERS: u32 = 1;
pub const DIRTY_CLASSES: u32 = 2;
pub const DIRTY_REMOTE: u32 = 4;
pub const DIRTY_PRINTCAP: u32 = 8;
pub const DIRTY_JOBS: u32 = 16;
pub const DIRTY_SUBSCRIPTIONS: u32 = 32;

/// Accumulates dirty bits between flush cycles. Mirrors the scheduler's
/// batching of many small mutations into one periodic write per file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyBits(u32);

impl DirtyBits {
    pub fn mark(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn is_dirty(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }
}

/// Write `value` as JSON to `path` via a temporary sibling + atomic rename.
/// The temp file lives in the same directory as `path` so the rename stays
/// within one filesystem.
#[instrument(skip(value))]
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SchedulerError::SpoolIo(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("presswerk"),
        )
        .suffix(".tmp")
        .tempfile_in(dir)?;

    serde_json::to_writer_pretty(&mut tmp, value)?;
    use std::io::Write;
    tmp.flush()?;

    tmp.persist(path)
        .map_err(|e| SchedulerError::SpoolIo(format!("rename into {}: {}", path.display(), e.error)))?;
    debug!(path = %path.display(), "atomic write committed");
    Ok(())
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Groups the five on-disk artifacts under one state directory, mirroring
/// the scheduler's `ServerRoot`/`RequestRoot`/`CacheDir` split collapsed
/// into a single configurable root for this implementation.
pub struct PersistStore {
    state_dir: PathBuf,
    spool_dir: PathBuf,
}

impl PersistStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let spool_dir = state_dir.join("spool");
        Self { state_dir, spool_dir }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(&self.spool_dir)?;
        Ok(())
    }

    fn printers_path(&self) -> PathBuf {
        self.state_dir.join("printers.conf")
    }

    fn classes_path(&self) -> PathBuf {
        self.state_dir.join("classes.conf")
    }

    fn subscriptions_path(&self) -> PathBuf {
        self.state_dir.join("subscriptions.conf")
    }

    fn jobs_cache_path(&self) -> PathBuf {
        self.state_dir.join("jobs.cache")
    }

    pub fn control_file_path(&self, job_id: i32) -> PathBuf {
        self.spool_dir.join(format!("c{job_id:05}"))
    }

    pub fn document_file_path(&self, job_id: i32, file_index: usize) -> PathBuf {
        self.spool_dir.join(format!("d{job_id:05}-{file_index:03}"))
    }

    pub fn save_printers(&self, printers: &[Printer]) -> Result<()> {
        atomic_write_json(&self.printers_path(), &printers.to_vec())
    }

    pub fn load_printers(&self) -> Result<Vec<Printer>> {
        read_json_or_default(&self.printers_path())
    }

    pub fn save_classes(&self, classes: &[Class]) -> Result<()> {
        // Implicit classes are derived at runtime and never persisted.
        let persisted: Vec<&Class> = classes.iter().filter(|c| !c.implicit).collect();
        atomic_write_json(&self.classes_path(), &persisted)
    }

    pub fn load_classes(&self) -> Result<Vec<Class>> {
        read_json_or_default(&self.classes_path())
    }

    pub fn save_subscriptions(&self, subscriptions: &[Subscription]) -> Result<()> {
        atomic_write_json(&self.subscriptions_path(), &subscriptions.to_vec())
    }

    pub fn load_subscriptions(&self) -> Result<Vec<Subscription>> {
        read_json_or_default(&self.subscriptions_path())
    }

    pub fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
        atomic_write_json(&self.jobs_cache_path(), &jobs.to_vec())
    }

    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        read_json_or_default(&self.jobs_cache_path())
    }

    /// Write a job's control file — the subset of job state the original
    /// scheduler recovers after a crash, one `c<NNNNN>` file per job.
    pub fn save_control_file(&self, job: &Job) -> Result<()> {
        atomic_write_json(&self.control_file_path(job.id), job)
    }

    pub fn remove_control_file(&self, job_id: i32) -> Result<()> {
        let path = self.control_file_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy `source` into the spool as this job's `file_index`'th document,
    /// staging through a temp sibling so a crash mid-copy never leaves a
    /// partial document file visible under its final name.
    pub fn stage_document(&self, job_id: i32, file_index: usize, source: &Path) -> Result<PathBuf> {
        let dest = self.document_file_path(job_id, file_index);
        let dir = dest
            .parent()
            .ok_or_else(|| SchedulerError::SpoolIo("spool directory missing".into()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("doc")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let mut src = fs::File::open(source)?;
        std::io::copy(&mut src, tmp.as_file_mut())?;
        tmp.persist(&dest)
            .map_err(|e| SchedulerError::SpoolIo(format!("stage document {job_id}/{file_index}: {}", e.error)))?;
        Ok(dest)
    }

    pub fn remove_document(&self, job_id: i32, file_index: usize) -> Result<()> {
        let path = self.document_file_path(job_id, file_index);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presswerk_core::types::DestinationType;
    use tempfile::tempdir;

    #[test]
    fn printers_round_trip() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let printers = vec![Printer::new("P", "socket://127.0.0.1:9100")];
        store.save_printers(&printers).unwrap();
        let loaded = store.load_printers().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "P");
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        let loaded = store.load_jobs().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn classes_round_trip_drops_implicit() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let mut implicit = Class::new("Implicit");
        implicit.implicit = true;
        let explicit = Class::new("Explicit");
        store.save_classes(&[implicit, explicit]).unwrap();

        let loaded = store.load_classes().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Explicit");
    }

    #[test]
    fn control_file_round_trip() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let job = Job::new(42, "alice", "P", DestinationType::Printer);
        store.save_control_file(&job).unwrap();
        assert!(store.control_file_path(42).exists());

        store.remove_control_file(42).unwrap();
        assert!(!store.control_file_path(42).exists());
    }

    #[test]
    fn remove_missing_control_file_is_ok() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.ensure_dirs().unwrap();
        assert!(store.remove_control_file(999).is_ok());
    }

    #[test]
    fn stage_document_copies_into_spool() {
        let dir = tempdir().unwrap();
        let store = PersistStore::new(dir.path());
        store.ensure_dirs().unwrap();

        let src_dir = tempdir().unwrap();
        let src_path = src_dir.path().join("input.pdf");
        fs::write(&src_path, b"%PDF-1.4 test").unwrap();

        let staged = store.stage_document(7, 0, &src_path).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"%PDF-1.4 test");
    }

    #[test]
    fn dirty_bits_track_independently() {
        let mut bits = DirtyBits::default();
        assert!(!bits.any());
        bits.mark(DIRTY_PRINTERS);
        bits.mark(DIRTY_JOBS);
        assert!(bits.is_dirty(DIRTY_PRINTERS));
        assert!(bits.is_dirty(DIRTY_JOBS));
        assert!(!bits.is_dirty(DIRTY_CLASSES));
        bits.clear(DIRTY_PRINTERS);
        assert!(!bits.is_dirty(DIRTY_PRINTERS));
        assert!(bits.any());
        bits.clear_all();
        assert!(!bits.any());
    }
}
