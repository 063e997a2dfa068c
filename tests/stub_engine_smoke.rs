#![cfg(unix)]

use mediadeck_engine::jobs::{self, Job, JobStatus};
use mediadeck_engine::options::DownloadOptions;
use mediadeck_engine::paths::AppPaths;
use std::time::{Duration, Instant};

// A stand-in downloader so the whole pipeline runs without network access.
// It answers the metadata probe with a fixed JSON document and otherwise
// plays back a short progress script; URLs containing "slow" stall so stop
// requests have something to interrupt.
const STUB_DOWNLOADER: &str = r#"#!/bin/sh
for a in "$@"; do
  case "$a" in
    --dump-json)
      printf '%s\n' '{"id":"stub-id-0001","title":"Stub video","duration":12}'
      exit 0
      ;;
  esac
done
url=""
for a in "$@"; do url="$a"; done
echo "[download] Destination: /tmp/stub-output.mp4"
echo " 25.0% 1.0MiB/s 00:09"
case "$url" in
  *slow*) sleep 30 ;;
  *) sleep 0.2 ;;
esac
echo "100% 2.0MiB/s 00:00"
exit 0
"#;

fn engine_in_tempdir() -> (tempfile::TempDir, AppPaths) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    paths.ensure_dirs().expect("ensure dirs");

    let bin = paths.ytdlp_bin_path();
    std::fs::create_dir_all(bin.parent().expect("parent")).expect("tools dir");
    std::fs::write(&bin, STUB_DOWNLOADER).expect("write stub");
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");

    (dir, paths)
}

fn wait_for_job(
    paths: &AppPaths,
    job_id: &str,
    timeout: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let started = Instant::now();
    loop {
        let job = jobs::get(paths, job_id)
            .expect("get job")
            .expect("job row present");
        if pred(&job) {
            return job;
        }
        if started.elapsed() > timeout {
            panic!(
                "job {job_id} did not reach expected state in {timeout:?}; last status {:?}",
                job.status
            );
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn stub_download_runs_to_completion_with_metadata_and_history() {
    let (_dir, paths) = engine_in_tempdir();
    let handle = jobs::start_runner(paths.clone(), jobs::EngineConfig::default()).expect("start runner");

    let job = jobs::submit(&paths, "https://example.com/clip", &DownloadOptions::default())
        .expect("submit");

    let done = wait_for_job(&paths, &job.id, Duration::from_secs(30), |j| {
        j.status.is_terminal()
    });
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.title, "Stub video");
    assert_eq!(done.duration.as_deref(), Some("0:12"));
    assert_eq!(done.progress, 1.0);
    assert_eq!(
        done.output_path.as_deref(),
        Some(std::path::Path::new("/tmp/stub-output.mp4"))
    );
    assert!(done.error.is_none());
    assert!(done.finished_at_ms.is_some());

    let conn = mediadeck_engine::db::open(&paths).expect("open db");
    let entry = mediadeck_engine::history::find_by_id(&conn, &job.id)
        .expect("history lookup")
        .expect("history entry");
    assert_eq!(entry.status, "completed");
    assert_eq!(entry.title.as_deref(), Some("Stub video"));

    handle.stop();
}

#[test]
fn batch_of_five_is_admitted_in_submission_order_under_the_cap() {
    let (_dir, paths) = engine_in_tempdir();
    jobs::set_max_concurrency(&paths, 2).expect("set cap");
    let handle = jobs::start_runner(paths.clone(), jobs::EngineConfig::default()).expect("start runner");

    let urls: Vec<String> = (0..5)
        .map(|i| format!("https://example.com/clip-{i}"))
        .collect();
    let submitted = jobs::submit_batch(&paths, &urls, &DownloadOptions::default())
        .expect("submit batch");
    assert_eq!(submitted.len(), 5);

    for job in &submitted {
        let done = wait_for_job(&paths, &job.id, Duration::from_secs(60), |j| {
            j.status.is_terminal()
        });
        assert_eq!(done.status, JobStatus::Completed, "job {}", job.id);
    }

    // Admission follows submission order, so start timestamps are ordered
    // the same way the batch was queued.
    let started: Vec<i64> = submitted
        .iter()
        .map(|job| {
            jobs::get(&paths, &job.id)
                .expect("get")
                .expect("row")
                .started_at_ms
                .expect("started")
        })
        .collect();
    let mut sorted = started.clone();
    sorted.sort_unstable();
    assert_eq!(started, sorted);

    let counts = jobs::counts(&paths).expect("counts");
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.queued, 0);
    assert_eq!(counts.active, 0);

    handle.stop();
}

#[test]
fn stop_interrupts_an_in_flight_download_and_retry_requeues_it() {
    let (_dir, paths) = engine_in_tempdir();
    let handle = jobs::start_runner(paths.clone(), jobs::EngineConfig::default()).expect("start runner");

    let job = jobs::submit(
        &paths,
        "https://example.com/slow-clip",
        &DownloadOptions::default(),
    )
    .expect("submit");

    wait_for_job(&paths, &job.id, Duration::from_secs(30), |j| {
        j.status == JobStatus::Downloading
    });

    assert!(jobs::stop(&paths, &job.id).expect("stop"));
    let stopped = wait_for_job(&paths, &job.id, Duration::from_secs(5), |j| {
        j.status.is_terminal()
    });
    assert_eq!(stopped.status, JobStatus::Stopped);

    let conn = mediadeck_engine::db::open(&paths).expect("open db");
    let entry = mediadeck_engine::history::find_by_id(&conn, &job.id)
        .expect("history lookup")
        .expect("history entry");
    assert_eq!(entry.status, "stopped");

    assert!(jobs::retry(&paths, &job.id).expect("retry"));
    let retried = jobs::get(&paths, &job.id).expect("get").expect("row");
    assert!(!retried.status.is_terminal());
    assert!(retried.error.is_none());

    // Put it back to rest before the runner winds down.
    jobs::stop_all(&paths).expect("stop all");
    handle.stop();
}
