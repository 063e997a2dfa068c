use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Target container for the finished file. Video containers are produced by
/// merge/remux, audio containers by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFileType {
    Mp4,
    Webm,
    Mkv,
    Mp3,
    Opus,
    Flac,
    Wav,
    M4a,
}

impl MediaFileType {
    pub fn is_video(self) -> bool {
        matches!(self, MediaFileType::Mp4 | MediaFileType::Webm | MediaFileType::Mkv)
    }

    pub fn is_audio(self) -> bool {
        !self.is_video()
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaFileType::Mp4 => "mp4",
            MediaFileType::Webm => "webm",
            MediaFileType::Mkv => "mkv",
            MediaFileType::Mp3 => "mp3",
            MediaFileType::Opus => "opus",
            MediaFileType::Flac => "flac",
            MediaFileType::Wav => "wav",
            MediaFileType::M4a => "m4a",
        }
    }

    pub fn video_types() -> &'static [MediaFileType] {
        &[MediaFileType::Mp4, MediaFileType::Webm, MediaFileType::Mkv]
    }

    pub fn audio_types() -> &'static [MediaFileType] {
        &[
            MediaFileType::Mp3,
            MediaFileType::Opus,
            MediaFileType::Flac,
            MediaFileType::Wav,
            MediaFileType::M4a,
        ]
    }
}

/// Resolution ceiling for video selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoResolution {
    Best,
    R2160p,
    R1440p,
    R1080p,
    R720p,
    R480p,
    R360p,
    R240p,
    Worst,
}

impl VideoResolution {
    /// The yt-dlp format selector for this ceiling.
    pub fn ytdlp_value(self) -> &'static str {
        match self {
            VideoResolution::Best => "bestvideo",
            VideoResolution::R2160p => "bestvideo[height<=2160]",
            VideoResolution::R1440p => "bestvideo[height<=1440]",
            VideoResolution::R1080p => "bestvideo[height<=1080]",
            VideoResolution::R720p => "bestvideo[height<=720]",
            VideoResolution::R480p => "bestvideo[height<=480]",
            VideoResolution::R360p => "bestvideo[height<=360]",
            VideoResolution::R240p => "bestvideo[height<=240]",
            VideoResolution::Worst => "worstvideo",
        }
    }
}

/// Audio bitrate tier. `Best` maps to yt-dlp's "0" (highest VBR quality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioQuality {
    Best,
    Kbps320,
    Kbps256,
    Kbps192,
    Kbps128,
}

impl AudioQuality {
    pub fn ytdlp_value(self) -> &'static str {
        match self {
            AudioQuality::Best => "0",
            AudioQuality::Kbps320 => "320K",
            AudioQuality::Kbps256 => "256K",
            AudioQuality::Kbps192 => "192K",
            AudioQuality::Kbps128 => "128K",
        }
    }
}

/// Optional clip trim, passed to the downloader as a download section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// Immutable option snapshot for one download job. Serialized as-is into the
/// job row and into history entries; the credential is carried only as a
/// store reference, never as a secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOptions {
    pub file_type: MediaFileType,
    #[serde(default)]
    pub video_resolution: Option<VideoResolution>,
    #[serde(default)]
    pub audio_quality: Option<AudioQuality>,
    #[serde(default)]
    pub download_subtitles: bool,
    #[serde(default)]
    pub subtitle_languages: Vec<String>,
    #[serde(default)]
    pub embed_subtitles: bool,
    #[serde(default)]
    pub subtitle_format: Option<String>,
    #[serde(default)]
    pub download_thumbnail: bool,
    #[serde(default)]
    pub embed_thumbnail: bool,
    #[serde(default)]
    pub embed_metadata: bool,
    #[serde(default)]
    pub split_chapters: bool,
    #[serde(default)]
    pub sponsorblock_remove: bool,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub custom_filename: Option<String>,
    /// Name of a credential in the credential store, resolved at run time.
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Overrides the engine-wide download directory for this job.
    #[serde(default)]
    pub save_folder: Option<PathBuf>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            file_type: MediaFileType::Mp4,
            video_resolution: None,
            audio_quality: None,
            download_subtitles: false,
            subtitle_languages: Vec::new(),
            embed_subtitles: false,
            subtitle_format: None,
            download_thumbnail: false,
            embed_thumbnail: true,
            embed_metadata: true,
            split_chapters: false,
            sponsorblock_remove: false,
            time_range: None,
            custom_filename: None,
            credential_ref: None,
            save_folder: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_classification_matches_extension_groups() {
        for t in MediaFileType::video_types() {
            assert!(t.is_video());
            assert!(!t.is_audio());
        }
        for t in MediaFileType::audio_types() {
            assert!(t.is_audio());
        }
        assert_eq!(MediaFileType::Mkv.extension(), "mkv");
        assert_eq!(MediaFileType::M4a.extension(), "m4a");
    }

    #[test]
    fn options_snapshot_round_trips_through_json() {
        let options = DownloadOptions {
            file_type: MediaFileType::Mkv,
            video_resolution: Some(VideoResolution::R1080p),
            download_subtitles: true,
            subtitle_languages: vec!["en".to_string(), "de".to_string()],
            embed_subtitles: true,
            time_range: Some(TimeRange {
                start: "00:10".to_string(),
                end: "01:30".to_string(),
            }),
            credential_ref: Some("campus-portal".to_string()),
            ..DownloadOptions::default()
        };

        let json = serde_json::to_string(&options).expect("encode");
        let decoded: DownloadOptions = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, options);
    }

    #[test]
    fn missing_optional_fields_default_when_decoding() {
        let decoded: DownloadOptions =
            serde_json::from_str(r#"{"file_type":"mp3"}"#).expect("decode");
        assert_eq!(decoded.file_type, MediaFileType::Mp3);
        assert!(decoded.subtitle_languages.is_empty());
        assert!(decoded.time_range.is_none());
    }
}
