use crate::credentials::Credential;
use crate::options::{AudioQuality, DownloadOptions};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Progress template handed to the downloader. Combined with `--newline`
/// this yields exactly one `percent speed eta` line per update, which is
/// what [`crate::parser::parse_line`] expects.
pub const PROGRESS_TEMPLATE: &str =
    "%(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s";

fn filename_strip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|\x00-\x1f]"#).expect("valid regex"))
}

/// Reduces a user-supplied filename to something safe to embed in an output
/// template. Returns `None` when nothing usable remains.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let cleaned = filename_strip_regex().replace_all(raw, "");
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Assembles the full downloader argument vector for one job.
///
/// Pure and deterministic: identical inputs produce an identical vector.
/// No option validation happens here; contradictory combinations are the
/// caller's responsibility.
pub fn build_download_args(
    url: &str,
    options: &DownloadOptions,
    credential: Option<&Credential>,
    ffmpeg_location: &Path,
    temp_dir: &Path,
    save_folder: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push("--ffmpeg-location".to_string());
    args.push(ffmpeg_location.to_string_lossy().to_string());
    args.push("--paths".to_string());
    args.push(format!("temp:{}", temp_dir.to_string_lossy()));

    let stem = options
        .custom_filename
        .as_deref()
        .and_then(sanitize_filename)
        .unwrap_or_else(|| "%(title)s".to_string());
    args.push("-o".to_string());
    args.push(
        save_folder
            .join(format!("{stem}.%(ext)s"))
            .to_string_lossy()
            .to_string(),
    );

    if options.file_type.is_video() {
        let selector = options
            .video_resolution
            .map(|r| r.ytdlp_value())
            .unwrap_or("bestvideo");
        args.push("-f".to_string());
        args.push(format!("{selector}+bestaudio/best"));
        args.push("--merge-output-format".to_string());
        args.push(options.file_type.extension().to_string());
    } else {
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(options.file_type.extension().to_string());
        args.push("--audio-quality".to_string());
        args.push(
            options
                .audio_quality
                .unwrap_or(AudioQuality::Best)
                .ytdlp_value()
                .to_string(),
        );
    }

    if options.download_subtitles && !options.subtitle_languages.is_empty() {
        args.push("--write-subs".to_string());
        args.push("--sub-langs".to_string());
        args.push(options.subtitle_languages.join(","));
        if let Some(sub_format) = options.subtitle_format.as_deref() {
            if !sub_format.trim().is_empty() {
                args.push("--sub-format".to_string());
                args.push(sub_format.trim().to_string());
            }
        }
        if options.embed_subtitles && options.file_type.is_video() {
            args.push("--embed-subs".to_string());
        }
    }

    if options.download_thumbnail {
        args.push("--write-thumbnail".to_string());
    }
    if options.embed_thumbnail {
        args.push("--embed-thumbnail".to_string());
    }
    if options.embed_metadata {
        args.push("--embed-metadata".to_string());
    }
    if options.split_chapters {
        args.push("--split-chapters".to_string());
    }
    if options.sponsorblock_remove {
        args.push("--sponsorblock-remove".to_string());
        args.push("all".to_string());
    }

    if let Some(range) = options.time_range.as_ref() {
        args.push("--download-sections".to_string());
        args.push(format!("*{}-{}", range.start, range.end));
    }

    if let Some(credential) = credential {
        args.push("--username".to_string());
        args.push(credential.username.clone());
        args.push("--password".to_string());
        args.push(credential.password.clone());
    }

    args.push("--newline".to_string());
    args.push("--progress-template".to_string());
    args.push(PROGRESS_TEMPLATE.to_string());

    args.push(url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MediaFileType, TimeRange, VideoResolution};
    use std::path::PathBuf;

    fn ffmpeg() -> PathBuf {
        PathBuf::from("/opt/tools/ffmpeg")
    }

    fn tmp() -> PathBuf {
        PathBuf::from("/tmp/stage")
    }

    fn out() -> PathBuf {
        PathBuf::from("/home/u/downloads")
    }

    fn build(options: &DownloadOptions) -> Vec<String> {
        build_download_args(
            "https://example.com/watch?v=abc",
            options,
            None,
            &ffmpeg(),
            &tmp(),
            &out(),
        )
    }

    #[test]
    fn identical_inputs_produce_identical_vectors() {
        let options = DownloadOptions {
            file_type: MediaFileType::Mkv,
            video_resolution: Some(VideoResolution::R720p),
            download_subtitles: true,
            subtitle_languages: vec!["en".to_string()],
            embed_subtitles: true,
            split_chapters: true,
            ..DownloadOptions::default()
        };
        let first = build(&options);
        let second = build(&options);
        let third = build(&options);
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn video_target_selects_resolution_ceiling_and_merge_format() {
        let options = DownloadOptions {
            file_type: MediaFileType::Mp4,
            video_resolution: Some(VideoResolution::R1080p),
            ..DownloadOptions::default()
        };
        let args = build(&options);
        let f_pos = args.iter().position(|a| a == "-f").expect("-f");
        assert_eq!(args[f_pos + 1], "bestvideo[height<=1080]+bestaudio/best");
        let merge_pos = args
            .iter()
            .position(|a| a == "--merge-output-format")
            .expect("merge flag");
        assert_eq!(args[merge_pos + 1], "mp4");
        assert!(!args.contains(&"-x".to_string()));
    }

    #[test]
    fn video_target_without_ceiling_falls_back_to_best() {
        let options = DownloadOptions {
            file_type: MediaFileType::Webm,
            video_resolution: None,
            ..DownloadOptions::default()
        };
        let args = build(&options);
        let f_pos = args.iter().position(|a| a == "-f").expect("-f");
        assert_eq!(args[f_pos + 1], "bestvideo+bestaudio/best");
    }

    #[test]
    fn audio_target_extracts_with_bitrate_tier() {
        let options = DownloadOptions {
            file_type: MediaFileType::Mp3,
            audio_quality: Some(crate::options::AudioQuality::Kbps192),
            ..DownloadOptions::default()
        };
        let args = build(&options);
        assert!(args.contains(&"-x".to_string()));
        let fmt_pos = args.iter().position(|a| a == "--audio-format").expect("fmt");
        assert_eq!(args[fmt_pos + 1], "mp3");
        let q_pos = args.iter().position(|a| a == "--audio-quality").expect("quality");
        assert_eq!(args[q_pos + 1], "192K");
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn audio_best_tier_maps_to_zero() {
        let options = DownloadOptions {
            file_type: MediaFileType::Flac,
            audio_quality: None,
            ..DownloadOptions::default()
        };
        let args = build(&options);
        let q_pos = args.iter().position(|a| a == "--audio-quality").expect("quality");
        assert_eq!(args[q_pos + 1], "0");
    }

    #[test]
    fn subtitles_require_request_and_languages() {
        let requested_no_langs = DownloadOptions {
            download_subtitles: true,
            subtitle_languages: Vec::new(),
            ..DownloadOptions::default()
        };
        assert!(!build(&requested_no_langs).contains(&"--write-subs".to_string()));

        let langs_not_requested = DownloadOptions {
            download_subtitles: false,
            subtitle_languages: vec!["en".to_string()],
            ..DownloadOptions::default()
        };
        assert!(!build(&langs_not_requested).contains(&"--write-subs".to_string()));

        let requested = DownloadOptions {
            download_subtitles: true,
            subtitle_languages: vec!["en".to_string(), "tr".to_string()],
            ..DownloadOptions::default()
        };
        let args = build(&requested);
        let langs_pos = args.iter().position(|a| a == "--sub-langs").expect("langs");
        assert_eq!(args[langs_pos + 1], "en,tr");
    }

    #[test]
    fn subtitle_embedding_only_applies_to_video_targets() {
        let audio = DownloadOptions {
            file_type: MediaFileType::Opus,
            download_subtitles: true,
            subtitle_languages: vec!["en".to_string()],
            embed_subtitles: true,
            ..DownloadOptions::default()
        };
        assert!(!build(&audio).contains(&"--embed-subs".to_string()));

        let video = DownloadOptions {
            file_type: MediaFileType::Mkv,
            ..audio
        };
        assert!(build(&video).contains(&"--embed-subs".to_string()));
    }

    #[test]
    fn independent_flags_append_only_when_set() {
        let bare = DownloadOptions {
            embed_thumbnail: false,
            embed_metadata: false,
            ..DownloadOptions::default()
        };
        let args = build(&bare);
        for flag in [
            "--write-thumbnail",
            "--embed-thumbnail",
            "--embed-metadata",
            "--split-chapters",
            "--sponsorblock-remove",
            "--download-sections",
            "--username",
        ] {
            assert!(!args.contains(&flag.to_string()), "unexpected {flag}");
        }

        let full = DownloadOptions {
            download_thumbnail: true,
            embed_thumbnail: true,
            embed_metadata: true,
            split_chapters: true,
            sponsorblock_remove: true,
            time_range: Some(TimeRange {
                start: "00:01:00".to_string(),
                end: "00:02:00".to_string(),
            }),
            ..DownloadOptions::default()
        };
        let args = build(&full);
        assert!(args.contains(&"--write-thumbnail".to_string()));
        assert!(args.contains(&"--sponsorblock-remove".to_string()));
        let sec_pos = args
            .iter()
            .position(|a| a == "--download-sections")
            .expect("sections");
        assert_eq!(args[sec_pos + 1], "*00:01:00-00:02:00");
    }

    #[test]
    fn credential_flags_use_resolved_secret() {
        let credential = Credential {
            name: "portal".to_string(),
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        };
        let args = build_download_args(
            "https://example.com/v",
            &DownloadOptions::default(),
            Some(&credential),
            &ffmpeg(),
            &tmp(),
            &out(),
        );
        let user_pos = args.iter().position(|a| a == "--username").expect("user");
        assert_eq!(args[user_pos + 1], "alice");
        let pass_pos = args.iter().position(|a| a == "--password").expect("pass");
        assert_eq!(args[pass_pos + 1], "s3cret");
    }

    #[test]
    fn custom_filename_is_sanitized_into_output_template() {
        let options = DownloadOptions {
            custom_filename: Some("my: video / final?".to_string()),
            ..DownloadOptions::default()
        };
        let args = build(&options);
        let o_pos = args.iter().position(|a| a == "-o").expect("-o");
        assert_eq!(args[o_pos + 1], "/home/u/downloads/my video  final.%(ext)s");
    }

    #[test]
    fn empty_custom_filename_falls_back_to_title_template() {
        let options = DownloadOptions {
            custom_filename: Some("???".to_string()),
            ..DownloadOptions::default()
        };
        let args = build(&options);
        let o_pos = args.iter().position(|a| a == "-o").expect("-o");
        assert_eq!(args[o_pos + 1], "/home/u/downloads/%(title)s.%(ext)s");
    }

    #[test]
    fn progress_reporting_flags_are_always_present_and_last_before_url() {
        let args = build(&DownloadOptions::default());
        let len = args.len();
        assert_eq!(args[len - 4], "--newline");
        assert_eq!(args[len - 3], "--progress-template");
        assert_eq!(args[len - 2], PROGRESS_TEMPLATE);
        assert_eq!(args[len - 1], "https://example.com/watch?v=abc");
    }

    #[test]
    fn sanitize_filename_strips_reserved_characters() {
        assert_eq!(
            sanitize_filename(r#"a<b>c:d"e/f\g|h?i*j"#).as_deref(),
            Some("abcdefghij")
        );
        assert_eq!(sanitize_filename("  .. "), None);
        assert_eq!(sanitize_filename(""), None);
    }
}
