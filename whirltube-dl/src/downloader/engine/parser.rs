//! Parser for yt-dlp output produced with our print hooks and progress template.
//!
//! The engine is asked to prefix every machine-readable line with [`MARKER`]
//! followed by a JSON object whose `type` field names the event. Everything
//! else the engine prints is diagnostic chatter and is ignored, except lines
//! carrying the engine's explicit `ERROR: ` prefix.

use std::borrow::Cow;

use serde::Deserialize;

/// Marker preceding every machine-readable line.
pub const MARKER: &str = "WTJSON:";

/// Tag prepended to lines read from the engine's stderr.
pub const STDERR_TAG: &str = "stderr:";

const ERROR_PREFIX: &str = "ERROR: ";

/// Progress template expanded by the engine on every download tick.
const PROGRESS_TEMPLATE: &str = concat!(
    r#"{"type":"downloading","eta":%(progress.eta)s,"#,
    r#""downloaded_bytes":%(progress.downloaded_bytes)s,"#,
    r#""total_bytes":%(progress.total_bytes)s,"#,
    r#""total_bytes_estimate":%(progress.total_bytes_estimate)s,"#,
    r#""elapsed":%(progress.elapsed)s,"speed":%(progress.speed)s,"#,
    r#""playlist_count":%(info.playlist_count)s,"#,
    r#""playlist_index":%(info.playlist_index)s}"#,
);

/// `--print` hooks as `(stage, payload)` pairs.
const PRINT_HOOKS: [(&str, &str); 4] = [
    ("before_dl", r#"{"type": "pre_download"}"#),
    ("after_video", r#"{"type": "end_of_video"}"#),
    ("playlist", r#"{"type": "end_of_playlist"}"#),
    ("after_move", r#"{"type": "after_move", "filepath": %(filepath)j}"#),
];

/// Engine arguments that make it emit the lines [`parse_line`] understands.
///
/// `--print` implies quiet simulation, so the list ends with flags undoing both.
pub fn engine_hook_args() -> Vec<String> {
    let mut args = Vec::with_capacity(PRINT_HOOKS.len() * 2 + 5);
    for (stage, payload) in PRINT_HOOKS {
        args.push("--print".to_string());
        args.push(format!("{stage}:{MARKER}{payload}"));
    }
    args.push("--progress-template".to_string());
    args.push(format!("download:{MARKER}{PROGRESS_TEMPLATE}"));
    args.extend(["--newline", "--no-simulate", "--no-quiet"].map(String::from));
    args
}

/// Payload of a `downloading` tick.
///
/// Every field may be absent: the engine prints `NA` for values it does not
/// know yet.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DownloadingPayload {
    pub eta: Option<f64>,
    pub downloaded_bytes: Option<f64>,
    pub total_bytes: Option<f64>,
    pub total_bytes_estimate: Option<f64>,
    pub elapsed: Option<f64>,
    pub speed: Option<f64>,
    pub playlist_count: Option<u64>,
    pub playlist_index: Option<u64>,
}

impl DownloadingPayload {
    pub fn downloaded(&self) -> u64 {
        self.downloaded_bytes.map(as_count).unwrap_or(0)
    }

    /// Exact total when known, otherwise the estimate. Zero means unknown.
    pub fn total(&self) -> Option<u64> {
        self.total_bytes
            .or(self.total_bytes_estimate)
            .map(as_count)
            .filter(|total| *total > 0)
    }

    pub fn eta_secs(&self) -> Option<u64> {
        self.eta.map(as_count)
    }
}

fn as_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// Typed event decoded from a marker line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PreDownload,
    Downloading(DownloadingPayload),
    EndOfVideo,
    EndOfPlaylist,
    /// Final location of the output file after post-processing.
    AfterMove {
        #[serde(default)]
        filepath: Option<String>,
    },
}

/// Result of parsing one output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Events(Vec<ProgressEvent>),
    /// The engine reported a fatal error.
    Error(String),
    /// Diagnostic or unrecognized line.
    Nothing,
}

/// Parse one line of engine output.
///
/// Lines read from stderr are expected to carry the [`STDERR_TAG`] prefix.
/// The function is pure: the same line always yields the same outcome.
pub fn parse_line(line: &str) -> ParseOutcome {
    let record = line.strip_prefix(STDERR_TAG).unwrap_or(line);

    if let Some(message) = record.strip_prefix(ERROR_PREFIX) {
        return ParseOutcome::Error(message.trim().to_string());
    }

    let Some(idx) = record.find(MARKER) else {
        return ParseOutcome::Nothing;
    };

    let json = record[idx + MARKER.len()..].trim();
    match serde_json::from_str::<ProgressEvent>(&normalize_na(json)) {
        Ok(event) => ParseOutcome::Events(vec![event]),
        Err(_) => ParseOutcome::Nothing,
    }
}

/// Replace bare `NA` tokens outside JSON strings with `null`.
fn normalize_na(json: &str) -> Cow<'_, str> {
    if !json.contains("NA") {
        return Cow::Borrowed(json);
    }

    let bytes = json.as_bytes();
    let mut out = String::with_capacity(json.len() + 8);
    let mut copied = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == b'N'
            && bytes.get(i + 1) == Some(&b'A')
            && !is_word_byte(i.checked_sub(1).map(|p| bytes[p]))
            && !is_word_byte(bytes.get(i + 2).copied())
        {
            out.push_str(&json[copied..i]);
            out.push_str("null");
            i += 2;
            copied = i;
            continue;
        }
        i += 1;
    }

    out.push_str(&json[copied..]);
    Cow::Owned(out)
}

fn is_word_byte(b: Option<u8>) -> bool {
    b.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_event(line: &str) -> ProgressEvent {
        match parse_line(line) {
            ParseOutcome::Events(mut events) => {
                assert_eq!(events.len(), 1);
                events.remove(0)
            }
            other => panic!("expected one event, got {other:?}"),
        }
    }

    #[test]
    fn downloading_event_with_numeric_fields() {
        let line = format!(
            r#"{MARKER}{{"type":"downloading","eta":12,"downloaded_bytes":1024,"total_bytes":2048}}"#
        );
        let ProgressEvent::Downloading(payload) = single_event(&line) else {
            panic!("not a downloading event");
        };
        assert_eq!(payload.eta_secs(), Some(12));
        assert_eq!(payload.downloaded(), 1024);
        assert_eq!(payload.total(), Some(2048));
    }

    #[test]
    fn na_eta_becomes_missing() {
        let line = format!(
            r#"{MARKER}{{"type":"downloading","eta":NA,"downloaded_bytes":4096,"total_bytes":8192,"speed":NA}}"#
        );
        let ProgressEvent::Downloading(payload) = single_event(&line) else {
            panic!("not a downloading event");
        };
        assert_eq!(payload.eta, None);
        assert_eq!(payload.speed, None);
        assert_eq!(payload.downloaded(), 4096);
        assert_eq!(payload.total(), Some(8192));
    }

    #[test]
    fn full_progress_template_expansion() {
        let line = format!(
            r#"{MARKER}{{"type":"downloading","eta":NA,"downloaded_bytes":1048576.0,"total_bytes":NA,"total_bytes_estimate":4194304.5,"elapsed":1.25,"speed":524288.0,"playlist_count":NA,"playlist_index":NA}}"#
        );
        let ProgressEvent::Downloading(payload) = single_event(&line) else {
            panic!("not a downloading event");
        };
        assert_eq!(payload.downloaded(), 1_048_576);
        assert_eq!(payload.total(), Some(4_194_304));
        assert_eq!(payload.speed, Some(524288.0));
        assert_eq!(payload.playlist_index, None);
    }

    #[test]
    fn zero_total_is_unknown() {
        let payload = DownloadingPayload {
            total_bytes: Some(0.0),
            ..Default::default()
        };
        assert_eq!(payload.total(), None);
    }

    #[test]
    fn na_inside_strings_is_preserved() {
        let line = format!(r#"{MARKER}{{"type":"after_move","filepath":"/v/NATURE NA.mp4"}}"#);
        assert_eq!(
            single_event(&line),
            ProgressEvent::AfterMove {
                filepath: Some("/v/NATURE NA.mp4".to_string())
            }
        );
    }

    #[test]
    fn marker_events() {
        assert_eq!(
            single_event(&format!(r#"{MARKER}{{"type": "pre_download"}}"#)),
            ProgressEvent::PreDownload
        );
        assert_eq!(
            single_event(&format!(r#"{MARKER}{{"type": "end_of_video"}}"#)),
            ProgressEvent::EndOfVideo
        );
        assert_eq!(
            single_event(&format!(r#"{MARKER}{{"type": "end_of_playlist"}}"#)),
            ProgressEvent::EndOfPlaylist
        );
    }

    #[test]
    fn marker_on_stderr_is_parsed() {
        let line = format!(r#"{STDERR_TAG}{MARKER}{{"type":"end_of_video"}}"#);
        assert_eq!(single_event(&line), ProgressEvent::EndOfVideo);
    }

    #[test]
    fn error_prefixes() {
        assert_eq!(
            parse_line("ERROR: boom2"),
            ParseOutcome::Error("boom2".to_string())
        );
        assert_eq!(
            parse_line("stderr:ERROR: [youtube] abc: Video unavailable\n"),
            ParseOutcome::Error("[youtube] abc: Video unavailable".to_string())
        );
    }

    #[test]
    fn diagnostics_are_ignored() {
        assert_eq!(parse_line("some random output"), ParseOutcome::Nothing);
        assert_eq!(
            parse_line("stderr:WARNING: [youtube] Falling back to generic n function"),
            ParseOutcome::Nothing
        );
        assert_eq!(
            parse_line("stderr:[download] Destination: clip.mp4"),
            ParseOutcome::Nothing
        );
        assert_eq!(parse_line(""), ParseOutcome::Nothing);
    }

    #[test]
    fn malformed_marker_payloads_are_ignored() {
        for payload in [
            "not json",
            "[1, 2, 3]",
            r#"{"eta": 5}"#,
            r#"{"type": "unknown_kind"}"#,
            "",
        ] {
            assert_eq!(
                parse_line(&format!("{MARKER}{payload}")),
                ParseOutcome::Nothing,
                "{payload}"
            );
        }
    }

    #[test]
    fn parsing_is_deterministic() {
        let line = format!(r#"{MARKER}{{"type":"downloading","downloaded_bytes":10}}"#);
        assert_eq!(parse_line(&line), parse_line(&line));
    }

    #[test]
    fn hook_args_carry_marker() {
        let args = engine_hook_args();
        assert_eq!(args.iter().filter(|a| *a == "--print").count(), 4);
        let template_idx = args.iter().position(|a| a == "--progress-template").unwrap();
        assert!(args[template_idx + 1].starts_with(&format!("download:{MARKER}")));
        assert_eq!(args.last().map(String::as_str), Some("--no-quiet"));
    }

    #[test]
    fn expanded_template_round_trips_through_parser() {
        // Simulate the engine substituting NA for every field.
        let expanded = PROGRESS_TEMPLATE
            .split("%(")
            .enumerate()
            .map(|(i, part)| {
                if i == 0 {
                    part.to_string()
                } else {
                    let (_, rest) = part.split_once(")s").unwrap();
                    format!("NA{rest}")
                }
            })
            .collect::<String>();

        let event = single_event(&format!("{MARKER}{expanded}"));
        assert_eq!(event, ProgressEvent::Downloading(DownloadingPayload::default()));
    }

    #[test]
    fn normalize_only_touches_bare_tokens() {
        assert_eq!(normalize_na(r#"{"a":NA}"#), r#"{"a":null}"#);
        assert_eq!(normalize_na(r#"{"a":NAN}"#), r#"{"a":NAN}"#);
        assert_eq!(normalize_na(r#"{"a":"NA"}"#), r#"{"a":"NA"}"#);
        assert_eq!(normalize_na(r#"{"a":"x\"NA","b":NA}"#), r#"{"a":"x\"NA","b":null}"#);
    }
}
