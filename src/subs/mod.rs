use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use quick_xml::{Reader as XmlReader, events::Event};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TimedTextSettings;

/// Result type used by the transcript helpers.
pub type SubsResult<T> = Result<T, SubsError>;

/// Error raised while parsing or rendering transcript artifacts.
#[derive(Debug)]
pub struct SubsError {
    message: String,
}

impl SubsError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SubsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SubsError {}

/// Timed-JSON transcript: parallel cue arrays, milliseconds.
///
/// This is the canonical stored format; SRT is the interchange format for
/// upload and download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubCues {
    pub start: Vec<u64>,
    pub end: Vec<u64>,
    pub text: Vec<String>,
}

impl SubCues {
    pub fn push(&mut self, start: u64, end: u64, text: String) {
        self.start.push(start);
        self.end.push(end);
        self.text.push(text);
    }

    pub fn len(&self) -> usize {
        self.start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
    }

    /// Cues retimed for a different playback speed. A 0.75-speed variant of a
    /// 1.0-speed source stretches timings by 1.0 / 0.75.
    pub fn scaled(&self, ratio: f64) -> SubCues {
        let scale = |ms: &u64| (*ms as f64 * ratio).round() as u64;
        SubCues {
            start: self.start.iter().map(scale).collect(),
            end: self.end.iter().map(scale).collect(),
            text: self.text.clone(),
        }
    }
}

/// Storage name of a transcript artifact for a given sub id.
pub fn sub_asset_name(sub_id: &str) -> String {
    format!("subs_{sub_id}.srt.sjson")
}

/// Lowercase, alphanumeric runs joined by single dashes.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

fn parse_timestamp(raw: &str) -> SubsResult<u64> {
    // HH:MM:SS,mmm
    let (clock, millis) = raw
        .trim()
        .split_once(',')
        .ok_or_else(|| SubsError::new(format!("malformed SRT timestamp `{raw}`")))?;
    let mut clock_parts = clock.split(':');
    let (Some(hours), Some(minutes), Some(seconds), None) = (
        clock_parts.next(),
        clock_parts.next(),
        clock_parts.next(),
        clock_parts.next(),
    ) else {
        return Err(SubsError::new(format!("malformed SRT timestamp `{raw}`")));
    };

    let parse = |part: &str| {
        part.parse::<u64>()
            .map_err(|_| SubsError::new(format!("malformed SRT timestamp `{raw}`")))
    };

    Ok(parse(hours)? * 3_600_000
        + parse(minutes)? * 60_000
        + parse(seconds)? * 1_000
        + parse(millis)?)
}

fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Parse SRT source into timed-JSON cues, retiming by `speed_ratio`
/// (1.0 keeps source timings).
pub fn srt_to_sjson(source: &str, speed_ratio: f64) -> SubsResult<SubCues> {
    let normalized = source.replace("\r\n", "\n");
    let mut cues = SubCues::default();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty()).peekable();

        // Optional numeric counter line before the time range.
        if let Some(first) = lines.peek() {
            if first.trim().parse::<u64>().is_ok() {
                lines.next();
            }
        }

        let Some(time_line) = lines.next() else {
            continue;
        };
        let (from, to) = time_line
            .split_once("-->")
            .ok_or_else(|| SubsError::new(format!("malformed SRT cue `{time_line}`")))?;

        let start = parse_timestamp(from)?;
        let end = parse_timestamp(to)?;
        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(start, end, text);
    }

    if cues.is_empty() {
        return Err(SubsError::new("SRT source contains no cues"));
    }

    Ok(cues.scaled(speed_ratio))
}

/// Render timed-JSON cues back to SRT.
pub fn sjson_to_srt(cues: &SubCues) -> SubsResult<String> {
    if cues.is_empty() {
        return Err(SubsError::new("transcript has no cues"));
    }
    if cues.start.len() != cues.end.len() || cues.start.len() != cues.text.len() {
        return Err(SubsError::new("transcript cue arrays are out of sync"));
    }

    let mut out = String::new();
    for (index, ((start, end), text)) in cues
        .start
        .iter()
        .zip(cues.end.iter())
        .zip(cues.text.iter())
        .enumerate()
    {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(*start),
            format_timestamp(*end),
            text
        ));
    }
    Ok(out)
}

/// Parse a third-party timed-text XML document
/// (`<transcript><text start="1.2" dur="3.4">...</text></transcript>`).
pub fn parse_timedtext_xml(xml: &str) -> SubsResult<SubCues> {
    let mut reader = XmlReader::from_str(xml);
    let mut buf = Vec::new();
    let mut cues = SubCues::default();
    let mut current: Option<(u64, u64, String)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"text" => {
                let mut start_ms = None;
                let mut dur_ms = 0u64;
                for attr in e.attributes() {
                    let attr =
                        attr.map_err(|err| SubsError::new(format!("bad timed-text attribute: {err}")))?;
                    let value = attr
                        .unescape_value()
                        .map_err(|err| SubsError::new(format!("bad timed-text attribute: {err}")))?;
                    let seconds = value.trim().parse::<f64>().ok();
                    match attr.key.as_ref() {
                        b"start" => start_ms = seconds.map(|s| (s * 1000.0).round() as u64),
                        b"dur" => dur_ms = seconds.map(|s| (s * 1000.0).round() as u64).unwrap_or(0),
                        _ => {}
                    }
                }
                let start = start_ms
                    .ok_or_else(|| SubsError::new("timed-text cue without a start attribute"))?;
                current = Some((start, start + dur_ms, String::new()));
            }
            Ok(Event::Text(e)) => {
                if let Some((_, _, text)) = current.as_mut() {
                    let value = e
                        .unescape()
                        .map_err(|err| SubsError::new(format!("bad timed-text body: {err}")))?;
                    text.push_str(&value);
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"text" => {
                if let Some((start, end, text)) = current.take() {
                    cues.push(start, end, text.trim().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(SubsError::new(format!("failed to parse timed-text XML: {err}"))),
            _ => {}
        }
        buf.clear();
    }

    if cues.is_empty() {
        return Err(SubsError::new("timed-text document contains no cues"));
    }
    Ok(cues)
}

/// Client for the third-party timed-text endpoint. Probes are best-effort;
/// fetches are used when replacing local transcripts with hosted ones.
#[derive(Clone)]
pub struct TimedTextClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TimedTextClient {
    pub fn new(settings: &TimedTextSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("failed to build timed-text HTTP client")?;

        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
        })
    }

    async fn get(&self, video_id: &str) -> reqwest::Result<reqwest::Response> {
        self.http
            .get(&self.endpoint)
            .query(&[("lang", "en"), ("v", video_id)])
            .send()
            .await
    }

    /// Whether the host serves a transcript for `video_id`. Any transport or
    /// status failure reads as "not available".
    pub async fn is_available(&self, video_id: &str) -> bool {
        match self.get(video_id).await {
            Ok(response) if response.status().is_success() => {
                matches!(response.text().await, Ok(body) if !body.is_empty())
            }
            Ok(_) => false,
            Err(err) => {
                debug!(%video_id, %err, "timed-text availability probe failed");
                false
            }
        }
    }

    pub async fn fetch_cues(&self, video_id: &str) -> SubsResult<SubCues> {
        let response = self
            .get(video_id)
            .await
            .map_err(|err| SubsError::new(format!("timed-text request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(SubsError::new(format!(
                "timed-text host answered {} for `{video_id}`",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| SubsError::new(format!("timed-text body read failed: {err}")))?;
        parse_timedtext_xml(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SRT: &str = "1\n00:00:01,250 --> 00:00:03,100\nHello there\n\n2\n00:00:04,000 --> 00:00:06,500\nSecond cue\nwith two lines\n";

    #[test]
    fn srt_parses_cues_and_timings() {
        let cues = srt_to_sjson(SAMPLE_SRT, 1.0).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues.start, vec![1250, 4000]);
        assert_eq!(cues.end, vec![3100, 6500]);
        assert_eq!(cues.text[1], "Second cue\nwith two lines");
    }

    #[test]
    fn srt_without_counter_lines_still_parses() {
        let source = "00:00:00,000 --> 00:00:02,000\nNo counter\n";
        let cues = srt_to_sjson(source, 1.0).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues.text[0], "No counter");
    }

    #[test]
    fn srt_round_trips() {
        let cues = srt_to_sjson(SAMPLE_SRT, 1.0).unwrap();
        let rendered = sjson_to_srt(&cues).unwrap();
        let reparsed = srt_to_sjson(&rendered, 1.0).unwrap();
        assert_eq!(reparsed, cues);
    }

    #[test]
    fn scaling_stretches_timings() {
        let cues = srt_to_sjson(SAMPLE_SRT, 1.0).unwrap();
        let slower = cues.scaled(1.0 / 0.75);
        assert_eq!(slower.start[0], 1667);
        assert_eq!(slower.end[1], 8667);
        assert_eq!(slower.text, cues.text);
    }

    #[test]
    fn malformed_timestamp_is_an_error() {
        let source = "1\n00:00:01 --> 00:00:03,000\nBroken\n";
        assert!(srt_to_sjson(source, 1.0).is_err());
    }

    #[test]
    fn empty_source_is_an_error() {
        assert!(srt_to_sjson("", 1.0).is_err());
        assert!(sjson_to_srt(&SubCues::default()).is_err());
    }

    #[test]
    fn timestamps_format_as_srt_clock() {
        assert_eq!(format_timestamp(3_723_456), "01:02:03,456");
        assert_eq!(parse_timestamp("01:02:03,456").unwrap(), 3_723_456);
    }

    #[test]
    fn slugify_flattens_to_dashed_lowercase() {
        assert_eq!(slugify("Intro Video (v2)"), "intro-video-v2");
        assert_eq!(slugify("OEoXaMPEzfM"), "oeoxampezfm");
        assert_eq!(slugify("  --  "), "");
    }

    #[test]
    fn timedtext_xml_parses_into_cues() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<transcript>
  <text start="9.75" dur="3.5">Hello &amp; welcome</text>
  <text start="14" dur="2">Second line</text>
</transcript>"#;
        let cues = parse_timedtext_xml(xml).unwrap();
        assert_eq!(cues.start, vec![9750, 14000]);
        assert_eq!(cues.end, vec![13250, 16000]);
        assert_eq!(cues.text[0], "Hello & welcome");
    }

    #[test]
    fn timedtext_without_cues_is_an_error() {
        assert!(parse_timedtext_xml("<transcript></transcript>").is_err());
    }

    #[test]
    fn asset_names_follow_sub_id() {
        assert_eq!(sub_asset_name("intro"), "subs_intro.srt.sjson");
    }
}
