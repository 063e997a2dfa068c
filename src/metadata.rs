use crate::credentials::Credential;
use crate::paths::AppPaths;
use crate::process::{self, RunError};
use crate::{tools, EngineError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const SINGLE_FETCH_TIMEOUT_SECS: u64 = 300;
const PLAYLIST_FETCH_TIMEOUT_SECS: u64 = 900;

/// One downloadable format variant advertised by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatVariant {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub vbr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<i64>,
    #[serde(default)]
    pub filesize_approx: Option<i64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

impl FormatVariant {
    pub fn is_video_only(&self) -> bool {
        matches!(self.acodec.as_deref(), None | Some("none"))
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self.vcodec.as_deref(), None | Some("none"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleTrack {
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub title: String,
}

/// Decoded metadata for one media item, field names matching the
/// downloader's JSON dump. Manual subtitles and auto-generated captions are
/// kept in separate maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescription {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub formats: Option<Vec<FormatVariant>>,
    #[serde(default)]
    pub subtitles: Option<std::collections::HashMap<String, Vec<SubtitleTrack>>>,
    #[serde(default)]
    pub automatic_captions: Option<std::collections::HashMap<String, Vec<SubtitleTrack>>>,
    #[serde(default)]
    pub chapters: Option<Vec<Chapter>>,
    #[serde(default)]
    pub playlist: Option<String>,
    #[serde(default)]
    pub playlist_index: Option<i64>,
    #[serde(default)]
    pub playlist_count: Option<i64>,
    #[serde(default)]
    pub n_entries: Option<i64>,
}

impl MediaDescription {
    /// Duration as `h:mm:ss` / `m:ss` for display, if known.
    pub fn duration_display(&self) -> Option<String> {
        let total = self.duration? as i64;
        let hours = total / 3600;
        let minutes = (total % 3600) / 60;
        let seconds = total % 60;
        if hours > 0 {
            Some(format!("{hours}:{minutes:02}:{seconds:02}"))
        } else {
            Some(format!("{minutes}:{seconds:02}"))
        }
    }

    /// Thumbnail URL, with the YouTube predictable-thumbnail fallback for
    /// 11-character video ids when the dump carries none.
    pub fn thumbnail_url(&self) -> Option<String> {
        if let Some(t) = self.thumbnail.as_deref() {
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
        if self.id.len() == 11 {
            return Some(format!("https://i.ytimg.com/vi/{}/mqdefault.jpg", self.id));
        }
        None
    }

    /// Item count for playlist aggregates. `playlist_count` is the
    /// authoritative field; `n_entries` and `view_count` are compatibility
    /// shims for dumps that omit it and carry no correctness guarantee.
    pub fn playlist_item_count(&self) -> Option<i64> {
        self.playlist_count.or(self.n_entries).or(self.view_count)
    }
}

/// A URL whose shape indicates playlist membership, used to pick the
/// playlist-summary fallback when the single-item fetch fails.
pub fn is_playlist_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if parsed.path().contains("/playlist") {
        return true;
    }
    parsed
        .query_pairs()
        .any(|(key, value)| key == "list" && !value.is_empty())
}

fn credential_args(credential: Option<&Credential>) -> Vec<String> {
    match credential {
        Some(c) => vec![
            "--username".to_string(),
            c.username.clone(),
            "--password".to_string(),
            c.password.clone(),
        ],
        None => Vec::new(),
    }
}

fn run_metadata_command(
    paths: &AppPaths,
    args: &[String],
    timeout_secs: u64,
    should_cancel: &dyn Fn() -> bool,
) -> Result<String> {
    let ytdlp = tools::locate_ytdlp(paths).ok_or(EngineError::ExecutableNotFound)?;
    let mut cmd = crate::cmd::command(&ytdlp);
    cmd.args(args);

    let output = match process::run_buffered(&mut cmd, timeout_secs, should_cancel) {
        Ok(output) => output,
        Err(RunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExecutableNotFound);
        }
        Err(RunError::Spawn(e)) | Err(RunError::Wait(e)) => return Err(EngineError::Io(e)),
        Err(RunError::TimedOut(limit)) => {
            return Err(EngineError::ProcessExit {
                code: None,
                output: format!("metadata fetch timed out after {limit}s"),
            });
        }
        Err(RunError::Canceled) => {
            return Err(EngineError::ProcessExit {
                code: None,
                output: "metadata fetch canceled".to_string(),
            });
        }
    };

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(EngineError::ProcessExit {
            code: output.status.code(),
            output: combined,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn decode_description(raw: &str) -> Result<MediaDescription> {
    serde_json::from_str(raw.trim()).map_err(|e| EngineError::OutputDecode {
        reason: e.to_string(),
        raw: raw.to_string(),
    })
}

/// Fetches metadata for a single item. When the single-item fetch fails and
/// the URL indicates playlist membership, retries in playlist-summary mode
/// and returns an aggregate record (title/uploader preserved, per-item
/// duration and formats absent).
pub fn fetch(
    paths: &AppPaths,
    url: &str,
    credential: Option<&Credential>,
) -> Result<MediaDescription> {
    fetch_with_cancel(paths, url, credential, &|| false)
}

/// [`fetch`] with an external abort hook, polled while the subprocess runs.
/// Used by the job worker so a stop request interrupts the metadata phase.
pub fn fetch_with_cancel(
    paths: &AppPaths,
    url: &str,
    credential: Option<&Credential>,
    should_cancel: &dyn Fn() -> bool,
) -> Result<MediaDescription> {
    let mut args = vec![
        "--dump-json".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    args.extend(credential_args(credential));
    args.push(url.to_string());

    match run_metadata_command(paths, &args, SINGLE_FETCH_TIMEOUT_SECS, should_cancel) {
        Ok(raw) => decode_description(&raw),
        Err(EngineError::ExecutableNotFound) => Err(EngineError::ExecutableNotFound),
        Err(first_err) if is_playlist_url(url) => {
            let mut fallback_args = vec![
                "--dump-single-json".to_string(),
                "--flat-playlist".to_string(),
                "--no-warnings".to_string(),
            ];
            fallback_args.extend(credential_args(credential));
            fallback_args.push(url.to_string());

            match run_metadata_command(
                paths,
                &fallback_args,
                PLAYLIST_FETCH_TIMEOUT_SECS,
                should_cancel,
            ) {
                Ok(raw) => decode_description(&raw),
                Err(_) => Err(first_err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Enumerates every entry of a playlist for selective download, one JSON
/// object per output line. Lines that fail to decode are skipped.
pub fn fetch_playlist_items(
    paths: &AppPaths,
    url: &str,
    credential: Option<&Credential>,
) -> Result<Vec<MediaDescription>> {
    let mut args = vec![
        "--dump-json".to_string(),
        "--flat-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    args.extend(credential_args(credential));
    args.push(url.to_string());

    let raw = run_metadata_command(paths, &args, PLAYLIST_FETCH_TIMEOUT_SECS, &|| false)?;
    Ok(decode_playlist_lines(&raw))
}

fn decode_playlist_lines(raw: &str) -> Vec<MediaDescription> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<MediaDescription>(line).ok())
        .collect()
}
