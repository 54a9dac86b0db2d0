//! Live playlist rendering and parsing
//!
//! HLS v3 with a sliding window. `EXTINF` durations are printed with six
//! fractional digits; the parser recognizes them by prefix and fixed line
//! length, matching the writer's output exactly.

use std::time::Duration;

use crate::error::{Error, Result};

/// One entry in the playlist window.
#[derive(Debug, Clone)]
pub struct PlaylistSegment {
    pub index: u64,
    pub duration: Duration,
    pub filename: String,
}

/// Render the live playlist.
pub fn render(media_sequence: u64, segments: &[PlaylistSegment]) -> String {
    let target_duration = segments
        .iter()
        .map(|s| s.duration.as_secs_f64().ceil() as u64)
        .max()
        .unwrap_or(1);

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str("#EXT-X-ALLOW-CACHE:NO\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
    for segment in segments {
        out.push_str(&format!("#EXTINF:{:.6},\n", segment.duration.as_secs_f64()));
        out.push_str(&segment.filename);
        out.push('\n');
    }
    out
}

/// Extract `EXTINF` duration strings ("4.250" style). An entry is
/// recognized by its prefix and fixed 17-byte line form.
pub fn parse_durations(m3u8: &str) -> Vec<String> {
    m3u8.trim()
        .lines()
        .filter(|line| line.len() == 17 && &line[..8] == "#EXTINF:")
        .map(|line| line[8..13].to_string())
        .collect()
}

/// Combined duration of the last `n_segments` playlist entries.
pub fn sum_last_durations(m3u8: &str, n_segments: usize) -> Result<Duration> {
    let durations = parse_durations(m3u8);
    if durations.len() < n_segments {
        return Err(Error::Internal(format!(
            "not enough segments: {} < {n_segments}",
            durations.len()
        )));
    }

    let mut total_ms: u64 = 0;
    for i in (1..=n_segments).rev() {
        let entry = &durations[durations.len() - i];
        let ms: u64 = entry
            .replace('.', "")
            .parse()
            .map_err(|_| Error::Internal(format!("could not parse duration: {entry}")))?;
        total_ms += ms;
    }
    Ok(Duration::from_millis(total_ms))
}
