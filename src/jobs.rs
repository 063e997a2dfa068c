use crate::credentials::CredentialStore;
use crate::db;
use crate::format;
use crate::history::{self, HistoryEntry};
use crate::metadata;
use crate::options::DownloadOptions;
use crate::parser::{self, LineEvent};
use crate::paths::AppPaths;
use crate::process::{self, OutputLine};
use crate::tools;
use crate::{EngineError, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const MAX_MAX_CONCURRENT_DOWNLOADS: usize = 10;

const META_KEY_MAX_CONCURRENCY: &str = "max_concurrent_downloads";

const ADMISSION_POLL_INTERVAL_MS: u64 = 250;
const CANCEL_POLL_INTERVAL_MS: u64 = 200;
const DOWNLOADER_PROBE_INTERVAL_MS: u64 = 5_000;
const JOB_LOG_RETENTION_DAYS: u64 = 14;
// The row log is a display buffer, not the archive; it keeps only the
// newest chunk so a chatty download cannot grow the database without bound.
const ROW_LOG_CAP_CHARS: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    FetchingMetadata,
    Downloading,
    Finalizing,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::FetchingMetadata => "fetching_metadata",
            JobStatus::Downloading => "downloading",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn from_str(s: &str) -> Option<JobStatus> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "fetching_metadata" => Some(JobStatus::FetchingMetadata),
            "downloading" => Some(JobStatus::Downloading),
            "finalizing" => Some(JobStatus::Finalizing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }

    /// A worker thread currently owns this job.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::FetchingMetadata | JobStatus::Downloading | JobStatus::Finalizing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

/// Projection of one download row, as handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub title: String,
    pub duration: Option<String>,
    pub options: DownloadOptions,
    pub status: JobStatus,
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub output_path: Option<PathBuf>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub log: String,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

impl Job {
    /// Rebuilds the job view a history entry was recorded from, so a past
    /// download can be redisplayed exactly as it ended. Identity, options,
    /// terminal status, progress, output path and error all carry over;
    /// transient fields (speed, eta) were never recorded and stay empty.
    pub fn from_history(entry: &HistoryEntry) -> Job {
        Job {
            id: entry.id.clone(),
            url: entry.url.clone(),
            title: entry
                .title
                .clone()
                .unwrap_or_else(|| entry.url.clone()),
            duration: None,
            options: entry.options.clone(),
            status: JobStatus::from_str(&entry.status).unwrap_or(JobStatus::Failed),
            progress: entry.progress,
            speed: None,
            eta: None,
            output_path: entry.output_path.clone(),
            error_kind: entry.error_kind.clone(),
            error: entry.error.clone(),
            log: entry.log.clone(),
            created_at_ms: entry.created_at_ms,
            started_at_ms: None,
            finished_at_ms: entry.finished_at_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

/// Initial engine settings. Applied once on startup; the live
/// max-concurrency preference persisted by [`set_max_concurrency`] always
/// wins over the configured default on later runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            history_capacity: history::HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerHandle {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
}

impl RunnerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn active_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

/// Starts the admission loop on a background thread. Jobs left mid-flight
/// by a previous process are failed and written to history first, so the
/// queue never resumes work it cannot account for.
pub fn start_runner(paths: AppPaths, config: EngineConfig) -> Result<RunnerHandle> {
    paths.ensure_dirs()?;
    let conn = db::open(&paths)?;
    db::migrate(&conn)?;

    if db::get_meta(&conn, META_KEY_MAX_CONCURRENCY)?.is_none() {
        db::set_meta(
            &conn,
            META_KEY_MAX_CONCURRENCY,
            &config
                .max_concurrency
                .clamp(1, MAX_MAX_CONCURRENT_DOWNLOADS)
                .to_string(),
        )?;
    }
    history::seed_capacity(&conn, config.history_capacity)?;

    recover_interrupted_jobs(&conn)?;

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicUsize::new(0));

    let prune_paths = paths.clone();
    thread::spawn(move || {
        let _ = prune_job_logs(&prune_paths);
    });

    let stop_thread = stop.clone();
    let running_thread = running.clone();
    thread::spawn(move || runner_loop(paths, stop_thread, running_thread));

    Ok(RunnerHandle { stop, running })
}

fn recover_interrupted_jobs(conn: &rusqlite::Connection) -> Result<usize> {
    let ids = active_job_ids(conn)?;
    if ids.is_empty() {
        return Ok(0);
    }

    let now = now_ms();
    for id in &ids {
        conn.execute(
            "UPDATE download
             SET status=?1, speed=NULL, eta=NULL, error=?2, error_kind=?3, finished_at_ms=?4
             WHERE id=?5 AND status IN (?6, ?7, ?8)",
            params![
                JobStatus::Failed.as_str(),
                "interrupted by app shutdown",
                "process_exit",
                now,
                id,
                JobStatus::FetchingMetadata.as_str(),
                JobStatus::Downloading.as_str(),
                JobStatus::Finalizing.as_str()
            ],
        )?;
        if let Some(job) = get_conn(conn, id)? {
            history::upsert(conn, history_entry_from(&job))?;
        }
    }
    Ok(ids.len())
}

fn active_job_ids(conn: &rusqlite::Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM download WHERE status IN (?1, ?2, ?3) ORDER BY created_at_ms ASC",
    )?;
    let ids = stmt
        .query_map(
            params![
                JobStatus::FetchingMetadata.as_str(),
                JobStatus::Downloading.as_str(),
                JobStatus::Finalizing.as_str()
            ],
            |row| row.get(0),
        )?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

fn runner_loop(paths: AppPaths, stop: Arc<AtomicBool>, running: Arc<AtomicUsize>) {
    // Locating the downloader can spawn a PATH probe process, so it runs on
    // its own slower cadence instead of once per admission cycle.
    let mut downloader_available = tools::locate_ytdlp(&paths).is_some();
    let mut last_downloader_probe = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if last_downloader_probe.elapsed() >= Duration::from_millis(DOWNLOADER_PROBE_INTERVAL_MS)
        {
            downloader_available = tools::locate_ytdlp(&paths).is_some();
            last_downloader_probe = Instant::now();
        }

        // No admissions at all until the downloader can be located.
        if !downloader_available {
            thread::sleep(Duration::from_millis(ADMISSION_POLL_INTERVAL_MS));
            continue;
        }

        let max_concurrency = match get_max_concurrency(&paths) {
            Ok(v) => v,
            Err(_) => DEFAULT_MAX_CONCURRENT_DOWNLOADS,
        };
        let available = max_concurrency.saturating_sub(running.load(Ordering::SeqCst));
        if available == 0 {
            thread::sleep(Duration::from_millis(ADMISSION_POLL_INTERVAL_MS));
            continue;
        }

        let queued = match fetch_queued_ids(&paths, available) {
            Ok(v) => v,
            Err(_) => {
                thread::sleep(Duration::from_millis(400));
                continue;
            }
        };

        if queued.is_empty() {
            thread::sleep(Duration::from_millis(ADMISSION_POLL_INTERVAL_MS));
            continue;
        }

        for job_id in queued {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let claimed = match claim_job(&paths, &job_id) {
                Ok(v) => v,
                Err(_) => false,
            };
            if !claimed {
                continue;
            }

            running.fetch_add(1, Ordering::SeqCst);
            let paths_worker = paths.clone();
            let running_worker = running.clone();
            thread::spawn(move || {
                let result = execute_download(&paths_worker, &job_id);
                if let Err(e) = result {
                    let _ = mark_failed(&paths_worker, &job_id, &e);
                }
                running_worker.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

fn fetch_queued_ids(paths: &AppPaths, limit: usize) -> Result<Vec<String>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT id FROM download WHERE status=?1 ORDER BY created_at_ms ASC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![JobStatus::Queued.as_str(), limit as i64], |row| {
            row.get(0)
        })?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

fn claim_job(paths: &AppPaths, job_id: &str) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let updated = conn.execute(
        "UPDATE download SET status=?1, started_at_ms=?2 WHERE id=?3 AND status=?4",
        params![
            JobStatus::FetchingMetadata.as_str(),
            now_ms(),
            job_id,
            JobStatus::Queued.as_str()
        ],
    )?;
    Ok(updated == 1)
}

fn execute_download(paths: &AppPaths, job_id: &str) -> Result<()> {
    if is_stopped(paths, job_id)? {
        return finalize_stopped(paths, job_id);
    }

    log_line(paths, job_id, "info", "job_started", serde_json::json!({}))?;

    let Some(job) = get(paths, job_id)? else {
        return Ok(());
    };
    let options = job.options.clone();

    let credential = match options.credential_ref.as_deref() {
        Some(name) => CredentialStore::new(paths.clone()).lookup(name)?,
        None => None,
    };

    let cancel_paths = paths.clone();
    let cancel_id = job_id.to_string();
    let stop_check = move || is_stopped(&cancel_paths, &cancel_id).unwrap_or(false);

    match metadata::fetch_with_cancel(paths, &job.url, credential.as_ref(), &stop_check) {
        Ok(info) => {
            set_title_and_duration(paths, job_id, &info.title, info.duration_display().as_deref())?;
            log_line(
                paths,
                job_id,
                "info",
                "metadata_fetched",
                serde_json::json!({ "title": info.title }),
            )?;
        }
        Err(err) => {
            if is_stopped(paths, job_id)? {
                return finalize_stopped(paths, job_id);
            }
            return Err(err);
        }
    }

    if !transition(paths, job_id, JobStatus::FetchingMetadata, JobStatus::Downloading)? {
        // A stop request landed during the metadata phase.
        return finalize_stopped(paths, job_id);
    }

    let save_folder = match &options.save_folder {
        Some(dir) => dir.clone(),
        None => paths.effective_download_dir()?,
    };
    std::fs::create_dir_all(&save_folder)?;
    std::fs::create_dir_all(paths.temp_dir())?;

    let ytdlp = tools::locate_ytdlp(paths).ok_or(EngineError::ExecutableNotFound)?;
    let args = format::build_download_args(
        &job.url,
        &options,
        credential.as_ref(),
        &tools::ffmpeg_location(paths),
        &paths.temp_dir(),
        &save_folder,
    );

    log_line(paths, job_id, "info", "download_started", serde_json::json!({}))?;

    let mut cmd = crate::cmd::command(&ytdlp);
    cmd.args(&args);
    let mut child = match process::spawn_streaming(&mut cmd) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExecutableNotFound)
        }
        Err(e) => return Err(EngineError::Io(e)),
    };

    let mut last_error_line: Option<String> = None;
    let mut stopped = false;
    let mut last_cancel_check = Instant::now();

    loop {
        match child.recv_line_timeout(Duration::from_millis(CANCEL_POLL_INTERVAL_MS)) {
            Ok(OutputLine::Stdout(line)) => match parser::parse_line(&line) {
                Some(LineEvent::Progress {
                    percent,
                    speed,
                    eta,
                }) => {
                    update_progress(paths, job_id, percent, speed.as_deref(), eta.as_deref())?;
                }
                Some(LineEvent::Destination(path)) => {
                    set_output_path(paths, job_id, &path)?;
                    append_log(paths, job_id, &line)?;
                }
                None => append_log(paths, job_id, &line)?,
            },
            Ok(OutputLine::Stderr(line)) => {
                append_log(paths, job_id, &format!("[ERROR] {line}"))?;
                last_error_line = Some(line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_cancel_check.elapsed() >= Duration::from_millis(CANCEL_POLL_INTERVAL_MS) {
            last_cancel_check = Instant::now();
            if is_stopped(paths, job_id).unwrap_or(false) {
                child.kill();
                stopped = true;
                break;
            }
        }
    }

    let status = child.wait()?;

    if stopped || is_stopped(paths, job_id)? {
        log_line(paths, job_id, "info", "job_stopped", serde_json::json!({}))?;
        return finalize_stopped(paths, job_id);
    }

    if status.success() {
        transition(paths, job_id, JobStatus::Downloading, JobStatus::Finalizing)?;
        finalize_completed(paths, job_id)?;
        log_line(paths, job_id, "info", "job_done", serde_json::json!({}))?;
        Ok(())
    } else {
        let detail = last_error_line
            .unwrap_or_else(|| format!("downloader exited with status {status}"));
        Err(classify_failure(status.code(), &detail))
    }
}

/// Maps a failed run to the error taxonomy from the downloader's own last
/// error line. String matching against tool output, revalidate on upgrades.
fn classify_failure(code: Option<i32>, detail: &str) -> EngineError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("http error 429") || lower.contains("rate-limit") {
        EngineError::RateLimited {
            output: detail.to_string(),
        }
    } else if lower.contains("subtitle") {
        EngineError::Subtitle(detail.to_string())
    } else {
        EngineError::ProcessExit {
            code,
            output: detail.to_string(),
        }
    }
}

/// Queues a new download. The URL doubles as the title until metadata
/// arrives.
pub fn submit(paths: &AppPaths, url: &str, options: &DownloadOptions) -> Result<Job> {
    let url = url.trim();
    if url.is_empty() {
        return Err(EngineError::InvalidRequest(
            "download url must not be empty".to_string(),
        ));
    }

    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let id = Uuid::new_v4().to_string();
    insert_job_row(&conn, &id, url, url, options)?;
    log_line(
        paths,
        &id,
        "info",
        "job_submitted",
        serde_json::json!({ "url": url }),
    )?;

    get_conn(&conn, &id)?.ok_or_else(|| {
        EngineError::InvalidRequest(format!("job {id} missing immediately after insert"))
    })
}

/// Queues one job per URL, preserving the given order. Blank entries are
/// skipped rather than failing the whole batch.
pub fn submit_batch(paths: &AppPaths, urls: &[String], options: &DownloadOptions) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    for url in urls {
        if url.trim().is_empty() {
            continue;
        }
        jobs.push(submit(paths, url, options)?);
    }
    Ok(jobs)
}

fn insert_job_row(
    conn: &rusqlite::Connection,
    id: &str,
    url: &str,
    title: &str,
    options: &DownloadOptions,
) -> Result<()> {
    let options_json = serde_json::to_string(options)?;
    conn.execute(
        "INSERT INTO download (
           id, url, title, duration, options_json, status, progress, speed, eta,
           output_path, error_kind, error, log, created_at_ms, started_at_ms, finished_at_ms
         ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, 0.0, NULL, NULL, NULL, NULL, NULL, '', ?6, NULL, NULL)",
        params![
            id,
            url,
            title,
            options_json,
            JobStatus::Queued.as_str(),
            now_ms()
        ],
    )?;
    Ok(())
}

/// Requests termination. The status flips immediately; the owning worker
/// notices on its next cancel poll and kills the subprocess best effort.
/// Queued jobs become terminal without ever starting.
pub fn stop(paths: &AppPaths, job_id: &str) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let updated = conn.execute(
        "UPDATE download SET status=?1, speed=NULL, eta=NULL, finished_at_ms=?2
         WHERE id=?3 AND status IN (?4, ?5, ?6, ?7)",
        params![
            JobStatus::Stopped.as_str(),
            now_ms(),
            job_id,
            JobStatus::Queued.as_str(),
            JobStatus::FetchingMetadata.as_str(),
            JobStatus::Downloading.as_str(),
            JobStatus::Finalizing.as_str()
        ],
    )?;
    if updated == 1 {
        if let Some(job) = get_conn(&conn, job_id)? {
            history::upsert(&conn, history_entry_from(&job))?;
        }
        log_line(paths, job_id, "info", "stop_requested", serde_json::json!({}))?;
    }
    Ok(updated == 1)
}

pub fn stop_all(paths: &AppPaths) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT id FROM download WHERE status IN (?1, ?2, ?3, ?4) ORDER BY created_at_ms ASC",
    )?;
    let ids = stmt
        .query_map(
            params![
                JobStatus::Queued.as_str(),
                JobStatus::FetchingMetadata.as_str(),
                JobStatus::Downloading.as_str(),
                JobStatus::Finalizing.as_str()
            ],
            |row| row.get(0),
        )?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    drop(stmt);

    let mut stopped = 0;
    for id in ids {
        if stop(paths, &id)? {
            stopped += 1;
        }
    }
    Ok(stopped)
}

/// Requeues a failed or stopped job from scratch: progress, timestamps, log
/// and error state all reset, options and id kept.
pub fn retry(paths: &AppPaths, job_id: &str) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let updated = conn.execute(
        "UPDATE download
         SET status=?1, progress=0.0, speed=NULL, eta=NULL, output_path=NULL,
             error_kind=NULL, error=NULL, log='', started_at_ms=NULL, finished_at_ms=NULL
         WHERE id=?2 AND status IN (?3, ?4)",
        params![
            JobStatus::Queued.as_str(),
            job_id,
            JobStatus::Failed.as_str(),
            JobStatus::Stopped.as_str()
        ],
    )?;
    if updated == 1 {
        log_line(paths, job_id, "info", "job_retried", serde_json::json!({}))?;
    }
    Ok(updated == 1)
}

pub fn retry_all_failed(paths: &AppPaths) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn
        .prepare("SELECT id FROM download WHERE status=?1 ORDER BY created_at_ms ASC")?;
    let ids = stmt
        .query_map(params![JobStatus::Failed.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    drop(stmt);

    let mut retried = 0;
    for id in ids {
        if retry(paths, &id)? {
            retried += 1;
        }
    }
    Ok(retried)
}

/// Deletes the row, its history entry, and its log file. Active jobs are
/// stopped first so no worker keeps writing to a row that no longer exists;
/// the history upsert that stop performs is erased along with the rest.
pub fn remove(paths: &AppPaths, job_id: &str) -> Result<bool> {
    let _ = stop(paths, job_id)?;

    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let deleted = conn.execute("DELETE FROM download WHERE id=?1", params![job_id])?;
    history::remove_by_id(&conn, job_id)?;
    let _ = std::fs::remove_file(paths.job_log_path(job_id));
    Ok(deleted == 1)
}

/// Bulk removal of rows no worker owns: terminal buckets and the queue
/// itself. Clearing queued jobs needs no stop, they have no process yet.
/// Active statuses are refused, those rows belong to a running worker.
pub fn clear_by_status(paths: &AppPaths, status: JobStatus) -> Result<usize> {
    if status.is_active() {
        return Err(EngineError::InvalidRequest(format!(
            "cannot bulk-clear jobs a worker still owns ({})",
            status.as_str()
        )));
    }

    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare("SELECT id FROM download WHERE status=?1")?;
    let ids = stmt
        .query_map(params![status.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    drop(stmt);

    for id in &ids {
        let _ = std::fs::remove_file(paths.job_log_path(id));
    }
    let deleted = conn.execute(
        "DELETE FROM download WHERE status=?1",
        params![status.as_str()],
    )?;
    Ok(deleted)
}

/// Rehydrates a history entry into a fresh queued job under its original
/// id, replacing any row that id still has.
pub fn resubmit_from_history(paths: &AppPaths, history_id: &str) -> Result<Job> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let entry = history::find_by_id(&conn, history_id)?.ok_or_else(|| {
        EngineError::InvalidRequest(format!("no history entry with id {history_id}"))
    })?;

    conn.execute("DELETE FROM download WHERE id=?1", params![entry.id])?;
    let title = entry.title.as_deref().unwrap_or(&entry.url);
    insert_job_row(&conn, &entry.id, &entry.url, title, &entry.options)?;
    log_line(
        paths,
        &entry.id,
        "info",
        "job_resubmitted",
        serde_json::json!({ "url": entry.url }),
    )?;

    get_conn(&conn, &entry.id)?.ok_or_else(|| {
        EngineError::InvalidRequest(format!("job {history_id} missing immediately after insert"))
    })
}

const JOB_COLUMNS: &str = "id, url, title, duration, options_json, status, progress, speed, eta, \
                           output_path, error_kind, error, log, created_at_ms, started_at_ms, finished_at_ms";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let options_json: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let output_path: Option<String> = row.get(9)?;

    Ok(Job {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        duration: row.get(3)?,
        options: serde_json::from_str(&options_json).unwrap_or_default(),
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed),
        progress: row.get(6)?,
        speed: row.get(7)?,
        eta: row.get(8)?,
        output_path: output_path.map(PathBuf::from),
        error_kind: row.get(10)?,
        error: row.get(11)?,
        log: row.get(12)?,
        created_at_ms: row.get(13)?,
        started_at_ms: row.get(14)?,
        finished_at_ms: row.get(15)?,
    })
}

pub fn get(paths: &AppPaths, job_id: &str) -> Result<Option<Job>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    get_conn(&conn, job_id)
}

fn get_conn(conn: &rusqlite::Connection, job_id: &str) -> Result<Option<Job>> {
    use crate::db::OptionalRowExt;
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM download WHERE id=?1"),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

/// Newest first, the order the queue view renders.
pub fn list(paths: &AppPaths) -> Result<Vec<Job>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM download ORDER BY created_at_ms DESC"
    ))?;
    let jobs = stmt
        .query_map([], job_from_row)?
        .collect::<rusqlite::Result<Vec<Job>>>()?;
    Ok(jobs)
}

pub fn list_by_status(paths: &AppPaths, status: JobStatus) -> Result<Vec<Job>> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM download WHERE status=?1 ORDER BY created_at_ms DESC"
    ))?;
    let jobs = stmt
        .query_map(params![status.as_str()], job_from_row)?
        .collect::<rusqlite::Result<Vec<Job>>>()?;
    Ok(jobs)
}

pub fn counts(paths: &AppPaths) -> Result<JobCounts> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM download GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts = JobCounts::default();
    for (status, count) in rows {
        let count = count.max(0) as usize;
        match JobStatus::from_str(&status) {
            Some(JobStatus::Queued) => counts.queued += count,
            Some(JobStatus::FetchingMetadata)
            | Some(JobStatus::Downloading)
            | Some(JobStatus::Finalizing) => counts.active += count,
            Some(JobStatus::Completed) => counts.completed += count,
            Some(JobStatus::Failed) | None => counts.failed += count,
            Some(JobStatus::Stopped) => counts.stopped += count,
        }
    }
    Ok(counts)
}

pub fn get_max_concurrency(paths: &AppPaths) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;

    match db::get_meta(&conn, META_KEY_MAX_CONCURRENCY)? {
        Some(v) => match v.trim().parse::<usize>() {
            Ok(parsed) => Ok(parsed.clamp(1, MAX_MAX_CONCURRENT_DOWNLOADS)),
            Err(_) => Ok(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
        },
        None => Ok(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
    }
}

/// Live setting; the admission loop reads it each cycle, so a change takes
/// effect without a restart. Running jobs are never interrupted by a lower
/// cap, the queue just stops admitting until the count drains below it.
pub fn set_max_concurrency(paths: &AppPaths, value: usize) -> Result<usize> {
    let clamped = value.clamp(1, MAX_MAX_CONCURRENT_DOWNLOADS);
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    db::set_meta(&conn, META_KEY_MAX_CONCURRENCY, &clamped.to_string())?;
    Ok(clamped)
}

fn transition(paths: &AppPaths, job_id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let updated = conn.execute(
        "UPDATE download SET status=?1 WHERE id=?2 AND status=?3",
        params![to.as_str(), job_id, from.as_str()],
    )?;
    Ok(updated == 1)
}

fn is_stopped(paths: &AppPaths, job_id: &str) -> Result<bool> {
    use crate::db::OptionalRowExt;
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM download WHERE id=?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?;
    // A deleted row counts as stopped so the worker lets go of it.
    Ok(match status {
        Some(s) => s == JobStatus::Stopped.as_str(),
        None => true,
    })
}

/// Progress only moves forward while downloading; a late or duplicate
/// update can never walk the bar backwards.
fn update_progress(
    paths: &AppPaths,
    job_id: &str,
    progress: f64,
    speed: Option<&str>,
    eta: Option<&str>,
) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download SET progress=MAX(progress, ?1), speed=?2, eta=?3
         WHERE id=?4 AND status=?5",
        params![
            progress.clamp(0.0, 1.0),
            speed,
            eta,
            job_id,
            JobStatus::Downloading.as_str()
        ],
    )?;
    Ok(())
}

fn set_output_path(paths: &AppPaths, job_id: &str, path: &Path) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download SET output_path=?1 WHERE id=?2",
        params![path.to_string_lossy().to_string(), job_id],
    )?;
    Ok(())
}

fn set_title_and_duration(
    paths: &AppPaths,
    job_id: &str,
    title: &str,
    duration: Option<&str>,
) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download SET title=?1, duration=?2 WHERE id=?3",
        params![title, duration, job_id],
    )?;
    Ok(())
}

fn append_log(paths: &AppPaths, job_id: &str, line: &str) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download SET log=substr(log || ?1 || char(10), -?2) WHERE id=?3",
        params![line, ROW_LOG_CAP_CHARS as i64, job_id],
    )?;
    Ok(())
}

fn finalize_completed(paths: &AppPaths, job_id: &str) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download
         SET status=?1, progress=1.0, speed=NULL, eta=NULL, error=NULL, error_kind=NULL,
             finished_at_ms=?2
         WHERE id=?3 AND status=?4",
        params![
            JobStatus::Completed.as_str(),
            now_ms(),
            job_id,
            JobStatus::Finalizing.as_str()
        ],
    )?;
    if let Some(job) = get_conn(&conn, job_id)? {
        history::upsert(&conn, history_entry_from(&job))?;
    }
    Ok(())
}

fn finalize_stopped(paths: &AppPaths, job_id: &str) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    conn.execute(
        "UPDATE download SET status=?1, speed=NULL, eta=NULL, finished_at_ms=?2
         WHERE id=?3 AND status IN (?4, ?5, ?6)",
        params![
            JobStatus::Stopped.as_str(),
            now_ms(),
            job_id,
            JobStatus::FetchingMetadata.as_str(),
            JobStatus::Downloading.as_str(),
            JobStatus::Finalizing.as_str()
        ],
    )?;
    if let Some(job) = get_conn(&conn, job_id)? {
        history::upsert(&conn, history_entry_from(&job))?;
    }
    Ok(())
}

fn mark_failed(paths: &AppPaths, job_id: &str, err: &EngineError) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let updated = conn.execute(
        "UPDATE download
         SET status=?1, speed=NULL, eta=NULL, error=?2, error_kind=?3, finished_at_ms=?4
         WHERE id=?5 AND status IN (?6, ?7, ?8)",
        params![
            JobStatus::Failed.as_str(),
            err.to_string(),
            err.kind(),
            now_ms(),
            job_id,
            JobStatus::FetchingMetadata.as_str(),
            JobStatus::Downloading.as_str(),
            JobStatus::Finalizing.as_str()
        ],
    )?;
    if updated == 1 {
        if let Some(job) = get_conn(&conn, job_id)? {
            history::upsert(&conn, history_entry_from(&job))?;
        }
        log_line(
            paths,
            job_id,
            "error",
            "job_failed",
            serde_json::json!({ "kind": err.kind(), "error": err.to_string() }),
        )?;
    }
    Ok(())
}

fn history_entry_from(job: &Job) -> HistoryEntry {
    HistoryEntry {
        id: job.id.clone(),
        url: job.url.clone(),
        title: Some(job.title.clone()),
        options: job.options.clone(),
        status: job.status.as_str().to_string(),
        progress: job.progress,
        output_path: job.output_path.clone(),
        error_kind: job.error_kind.clone(),
        error: job.error.clone(),
        log: job.log.clone(),
        created_at_ms: job.created_at_ms,
        finished_at_ms: job.finished_at_ms,
    }
}

fn log_line(
    paths: &AppPaths,
    job_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    use std::io::Write;

    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "job_id": job_id,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    std::fs::create_dir_all(paths.job_logs_dir())?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.job_log_path(job_id))?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

fn prune_job_logs(paths: &AppPaths) -> std::io::Result<usize> {
    let dir = paths.job_logs_dir();
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = Duration::from_secs(JOB_LOG_RETENTION_DAYS * 24 * 60 * 60);
    let mut removed = 0;
    for entry in std::fs::read_dir(&dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let Ok(age) = modified.elapsed() else { continue };
        if age >= cutoff && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
