use std::path::PathBuf;

/// Marker strings for the lines yt-dlp prints when it opens or merges an
/// output file. These track the tool's current log phrasing and must be
/// revalidated when the tool is updated; they are not a stable protocol.
pub const DESTINATION_MARKER: &str = "[download] Destination:";
pub const MERGER_MARKER: &str = "[Merger] Merging formats into";

/// Structured signal extracted from one line of downloader output.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Progress {
        /// Fraction in [0.0, 1.0].
        percent: f64,
        speed: Option<String>,
        eta: Option<String>,
    },
    /// Path the tool is writing to. Later events override earlier ones; the
    /// last destination observed before exit is the job's output path.
    Destination(PathBuf),
}

/// Extracts zero or one structured event from a single output line.
///
/// Lines that carry no recognized signal return `None`; callers still append
/// them to the raw job log. Malformed progress tokens degrade to `None`
/// rather than erroring, because the progress template is only a display
/// heuristic.
pub fn parse_line(line: &str) -> Option<LineEvent> {
    if let Some(rest) = line.split_once(DESTINATION_MARKER).map(|(_, r)| r) {
        let path = rest.trim();
        if !path.is_empty() {
            return Some(LineEvent::Destination(PathBuf::from(path)));
        }
        return None;
    }

    if let Some(rest) = line.split_once(MERGER_MARKER).map(|(_, r)| r) {
        // The merger line quotes the path: Merging formats into "out.mp4"
        let mut quoted = rest.splitn(3, '"');
        let _ = quoted.next();
        if let Some(path) = quoted.next() {
            if !path.is_empty() {
                return Some(LineEvent::Destination(PathBuf::from(path)));
            }
        }
        return None;
    }

    if line.contains('%') {
        let mut tokens = line.trim().split_whitespace();
        let first = tokens.next()?;
        let percent_str = first.strip_suffix('%')?;
        let percent: f64 = percent_str.trim().parse().ok()?;
        let speed = tokens.next().map(|s| s.to_string());
        let eta = tokens.next().map(|s| s.to_string());
        return Some(LineEvent::Progress {
            percent: percent / 100.0,
            speed,
            eta,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_speed_eta_line_parses() {
        let event = parse_line("45.2% 1.2MiB/s 00:31").expect("event");
        assert_eq!(
            event,
            LineEvent::Progress {
                percent: 0.452,
                speed: Some("1.2MiB/s".to_string()),
                eta: Some("00:31".to_string()),
            }
        );
    }

    #[test]
    fn percent_line_with_missing_tokens_degrades() {
        let event = parse_line("  12.5%  ").expect("event");
        assert_eq!(
            event,
            LineEvent::Progress {
                percent: 0.125,
                speed: None,
                eta: None,
            }
        );
    }

    #[test]
    fn malformed_percent_token_is_ignored() {
        assert_eq!(parse_line("resuming at N/A% done"), None);
        assert_eq!(parse_line("% alone"), None);
    }

    #[test]
    fn destination_line_yields_trimmed_path() {
        let event = parse_line("[download] Destination: /tmp/video.mp4").expect("event");
        assert_eq!(
            event,
            LineEvent::Destination(PathBuf::from("/tmp/video.mp4"))
        );
    }

    #[test]
    fn merger_line_yields_quoted_path() {
        let event =
            parse_line(r#"[Merger] Merging formats into "/tmp/video final.mkv""#).expect("event");
        assert_eq!(
            event,
            LineEvent::Destination(PathBuf::from("/tmp/video final.mkv"))
        );
    }

    #[test]
    fn unrecognized_line_yields_no_event() {
        assert_eq!(parse_line("[info] Downloading 1 format(s): 137+140"), None);
        assert_eq!(parse_line(""), None);
    }
}
