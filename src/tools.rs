use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

const YTDLP_RELEASE_BASE: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
const MIN_YTDLP_SIZE_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct DownloaderStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub bundled_path: String,
    pub resolved_path: String,
    pub version: Option<String>,
}

/// Resolves the downloader binary, preferring the bundled copy over one on
/// PATH. Returns `None` when neither responds to a version probe; callers
/// map that to [`EngineError::ExecutableNotFound`].
pub fn locate_ytdlp(paths: &AppPaths) -> Option<PathBuf> {
    let bundled = paths.ytdlp_bin_path();
    if bundled.exists() {
        return Some(bundled);
    }
    let on_path = PathBuf::from("yt-dlp");
    if tool_version_first_line(&on_path, "--version").is_some() {
        return Some(on_path);
    }
    None
}

pub fn ytdlp_version(paths: &AppPaths) -> Option<String> {
    let bin = locate_ytdlp(paths)?;
    tool_version_first_line(&bin, "--version")
}

pub fn downloader_status(paths: &AppPaths) -> DownloaderStatus {
    let bundled = paths.ytdlp_bin_path();
    let bundled_installed = bundled.exists();
    let resolved = locate_ytdlp(paths);
    let version = resolved
        .as_ref()
        .and_then(|bin| tool_version_first_line(bin, "--version"));

    DownloaderStatus {
        available: version.is_some(),
        bundled_installed,
        bundled_path: bundled.to_string_lossy().to_string(),
        resolved_path: resolved
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        version,
    }
}

/// Downloads the latest release binary into the tools directory and records
/// its checksum alongside. The download lands in a temp file first and is
/// only moved into place after a plausibility size check.
pub fn ensure_ytdlp(paths: &AppPaths) -> Result<DownloaderStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ytdlp_bin_path();
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let url = format!("{YTDLP_RELEASE_BASE}/{}", ytdlp_asset_name());
    let tmp_path = destination.with_extension("download");

    let resp = ureq::get(&url)
        .call()
        .map_err(|e| EngineError::Provision(format!("yt-dlp download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(EngineError::Provision(format!(
            "yt-dlp download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }

    let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if downloaded_size < MIN_YTDLP_SIZE_BYTES {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(EngineError::Provision(
            "downloaded yt-dlp is unexpectedly small".to_string(),
        ));
    }

    mark_executable(&tmp_path)?;

    if destination.exists() {
        let _ = std::fs::remove_file(&destination);
    }
    if std::fs::rename(&tmp_path, &destination).is_err() {
        std::fs::copy(&tmp_path, &destination)?;
        let _ = std::fs::remove_file(&tmp_path);
    }

    record_checksum(&destination)?;

    Ok(downloader_status(paths))
}

/// Compares the binary against its recorded checksum. `Ok(None)` when no
/// checksum was recorded (binary provisioned out of band).
pub fn verify_ytdlp_checksum(paths: &AppPaths) -> Result<Option<bool>> {
    let bin = paths.ytdlp_bin_path();
    let sidecar = checksum_sidecar_path(&bin);
    if !bin.exists() || !sidecar.exists() {
        return Ok(None);
    }
    let recorded = std::fs::read_to_string(&sidecar)?;
    let actual = hex::encode(sha256_file(&bin)?);
    Ok(Some(recorded.trim().eq_ignore_ascii_case(&actual)))
}

fn ytdlp_asset_name() -> &'static str {
    if cfg!(windows) {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

fn checksum_sidecar_path(bin: &Path) -> PathBuf {
    let mut name = bin
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".sha256");
    bin.with_file_name(name)
}

fn record_checksum(bin: &Path) -> Result<()> {
    let digest = hex::encode(sha256_file(bin)?);
    std::fs::write(checksum_sidecar_path(bin), format!("{digest}\n"))?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    use sha2::Digest;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    loop {
        let n = std::io::Read::read(&mut file, buf.as_mut_slice())?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegStatus {
    pub installed: bool,
    pub ffmpeg_path: String,
    pub version: Option<String>,
}

pub fn ffmpeg_status(paths: &AppPaths) -> FfmpegStatus {
    let ffmpeg_path = paths.ffmpeg_bin_path();
    let installed = ffmpeg_path.exists();
    let version = if installed {
        tool_version_first_line(&ffmpeg_path, "-version")
    } else {
        tool_version_first_line(Path::new("ffmpeg"), "-version")
    };

    FfmpegStatus {
        installed,
        ffmpeg_path: ffmpeg_path.to_string_lossy().to_string(),
        version,
    }
}

pub fn ensure_ffmpeg(paths: &AppPaths) -> Result<FfmpegStatus> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| EngineError::Provision(e.to_string()))?;
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| EngineError::Provision(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| EngineError::Provision(e.to_string()))?;

    Ok(ffmpeg_status(paths))
}

/// Value for the downloader's `--ffmpeg-location` flag. The bundled
/// directory when provisioned, otherwise the bare program name so PATH
/// resolution applies.
pub fn ffmpeg_location(paths: &AppPaths) -> PathBuf {
    if paths.ffmpeg_bin_path().exists() {
        paths.ffmpeg_dir()
    } else {
        PathBuf::from("ffmpeg")
    }
}

fn tool_version_first_line(program: impl AsRef<std::ffi::OsStr>, arg: &str) -> Option<String> {
    let output = crate::cmd::command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}
