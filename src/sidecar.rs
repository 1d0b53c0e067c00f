//! Atomic artifact writers: sidecars, manifest, report, review queue, and
//! the process-wide run index (spec §4.7 "Artifacts", §5 "Shared
//! resources").
//!
//! Every writer follows the teacher's `convert::convert_to_file` idiom —
//! write to a uniquely-suffixed temp file in the same directory, then
//! rename into place — so a reader never observes a partially written
//! file and two runs writing concurrently never collide (spec §8
//! invariant 5: "run isolation").

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{PageError, Phase};
use crate::model::{Manifest, PageSidecar, Report, ReviewQueueFile, RunIndex, RunRecord};

/// Formats a `SystemTime` as a UTC `YYYY-MM-DDThh:mm:ssZ` string.
///
/// No date/time crate sits in the teacher's dependency tree, and nothing
/// here needs more than second precision or calendar correctness over the
/// Gregorian era, so this uses Howard Hinnant's `civil_from_days`
/// algorithm over a Unix timestamp rather than pulling in `chrono` for
/// one formatting call.
pub fn format_timestamp(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

pub fn now_iso8601() -> String {
    format_timestamp(SystemTime::now())
}

/// Generates a run id from the current time plus a per-process counter,
/// used when the caller doesn't supply one explicitly (spec §6
/// `runPipeline`'s `runId?`).
pub fn generate_run_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{nanos:x}-{seq:04x}")
}

/// Writes `value` as canonical JSON (stable key order via the type's own
/// field order, LF line endings, no trailing newline byte differences
/// across platforms) to `path`, via a uniquely-suffixed temp file in the
/// same directory followed by a rename.
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact"),
        std::process::id()
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, body.as_bytes())?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Writes `image` as a PNG to `path` via the same temp-file+rename idiom
/// as `write_json_atomic`, for normalized/preview/overlay rasters.
pub fn write_png_atomic(path: &Path, image: &image::DynamicImage) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact"),
        std::process::id()
    );
    let tmp_path = path.with_file_name(tmp_name);
    image
        .save_with_format(&tmp_path, image::ImageFormat::Png)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn to_page_error(phase: Phase, page_id: Option<&str>, source: io::Error) -> PageError {
    match page_id {
        Some(id) => PageError::for_page(phase, id, format!("write failed: {source}")),
        None => PageError::run_scoped(phase, format!("write failed: {source}")),
    }
}

pub fn sidecar_path(run_dir: &Path, page_id: &str) -> PathBuf {
    run_dir.join("sidecars").join(format!("{page_id}.json"))
}

pub fn normalized_path(run_dir: &Path, page_id: &str) -> PathBuf {
    run_dir.join("normalized").join(format!("{page_id}.png"))
}

pub fn preview_path(run_dir: &Path, page_id: &str, kind: &str) -> PathBuf {
    run_dir.join("previews").join(format!("{page_id}-{kind}.png"))
}

pub fn overlay_path(run_dir: &Path, page_id: &str) -> PathBuf {
    run_dir.join("overlays").join(format!("{page_id}-overlay.png"))
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join("manifest.json")
}

pub fn report_path(run_dir: &Path) -> PathBuf {
    run_dir.join("report.json")
}

pub fn review_queue_path(run_dir: &Path) -> PathBuf {
    run_dir.join("review-queue.json")
}

pub fn run_index_path(output_dir: &Path) -> PathBuf {
    output_dir.join("run-index.json")
}

pub fn write_sidecar(run_dir: &Path, sidecar: &PageSidecar) -> Result<PathBuf, PageError> {
    let path = sidecar_path(run_dir, &sidecar.page_id);
    write_json_atomic(&path, sidecar).map_err(|e| to_page_error(Phase::Sidecar, Some(&sidecar.page_id), e))?;
    Ok(path)
}

pub fn write_manifest(run_dir: &Path, manifest: &Manifest) -> Result<PathBuf, PageError> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, manifest).map_err(|e| to_page_error(Phase::Manifest, None, e))?;
    Ok(path)
}

pub fn write_report(run_dir: &Path, report: &Report) -> Result<PathBuf, PageError> {
    let path = report_path(run_dir);
    write_json_atomic(&path, report).map_err(|e| to_page_error(Phase::Manifest, None, e))?;
    Ok(path)
}

pub fn write_review_queue(run_dir: &Path, queue: &ReviewQueueFile) -> Result<PathBuf, PageError> {
    let path = review_queue_path(run_dir);
    write_json_atomic(&path, queue).map_err(|e| to_page_error(Phase::ReviewQueue, None, e))?;
    Ok(path)
}

/// Reads the run-index file, tolerating a missing file (treated as empty).
fn read_run_index(path: &Path) -> RunIndex {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

/// Acquires a directory-based advisory lock (`mkdir` is atomic on every
/// platform the teacher targets), retrying briefly before giving up —
/// there is no `fs2`/`fd-lock` dependency in the teacher's stack, and a
/// single output directory is normally driven by one process at a time.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(output_dir: &Path) -> io::Result<Self> {
        let path = output_dir.join(".run-index.lock");
        std::fs::create_dir_all(output_dir)?;
        for _ in 0..200 {
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out waiting for run-index lock"))
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}

/// Appends or replaces `record` in `run-index.json` under a short-lived
/// advisory lock, then writes it back atomically (spec §5 "The run-index
/// update is atomic (write temp, rename)").
pub fn upsert_run_index(output_dir: &Path, record: RunRecord) -> Result<(), PageError> {
    let path = run_index_path(output_dir);
    let lock = IndexLock::acquire(output_dir).map_err(|e| to_page_error(Phase::RunIndex, None, e))?;

    let mut index = read_run_index(&path);
    if let Some(existing) = index.runs.iter_mut().find(|r| r.run_id == record.run_id) {
        *existing = record;
    } else {
        index.runs.push(record);
    }
    write_json_atomic(&path, &index).map_err(|e| to_page_error(Phase::RunIndex, None, e))?;

    drop(lock);
    Ok(())
}

/// Deletes a page's prior normalized file and preview files, used during
/// cleanup-of-stale-outputs when a checksum changed or a page id vanished
/// (spec §4.7 "Cleanup of stale outputs").
pub fn remove_page_outputs(normalized_file: &Path, preview_files: &[PathBuf]) {
    let _ = std::fs::remove_file(normalized_file);
    for preview in preview_files {
        let _ = std::fs::remove_file(preview);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;

    #[test]
    fn timestamp_formats_known_epoch_second() {
        // 2021-01-01T00:00:00Z == 1609459200
        let time = UNIX_EPOCH + std::time::Duration::from_secs(1_609_459_200);
        assert_eq!(format_timestamp(time), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn run_ids_are_unique_across_calls() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            version: 1,
            run_id: "run-1".into(),
            project_id: "book".into(),
            status: RunStatus::Completed,
            generated_at: now_iso8601(),
            pages: vec![],
            errors: vec![],
        };
        let path = write_manifest(dir.path(), &manifest).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let back: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.run_id, "run-1");
        assert!(!raw.contains('\r'));
    }

    #[test]
    fn upsert_run_index_replaces_existing_entry_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let make = |review_count: usize| RunRecord {
            run_id: "run-a".into(),
            run_dir: dir.path().join("runs/run-a"),
            project_id: "book".into(),
            generated_at: now_iso8601(),
            status: RunStatus::Running,
            review_count,
            report_path: dir.path().join("runs/run-a/report.json"),
            started_at: now_iso8601(),
            updated_at: now_iso8601(),
        };

        upsert_run_index(dir.path(), make(0)).unwrap();
        upsert_run_index(dir.path(), make(3)).unwrap();

        let index = read_run_index(&run_index_path(dir.path()));
        assert_eq!(index.runs.len(), 1);
        assert_eq!(index.runs[0].review_count, 3);
    }
}
