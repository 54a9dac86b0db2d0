//! Minimal SDP handling
//!
//! The server only needs enough SDP to enumerate tracks and their control
//! attributes; the publisher's session description is otherwise passed back
//! to readers verbatim.

use crate::error::{Error, Result};

/// One `m=` media section.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    /// "video" or "audio"
    pub media: String,
    /// RTP payload type from the m= line
    pub payload_type: u8,
    /// `a=control:` value, if present
    pub control: Option<String>,
    /// `a=rtpmap:` value, if present (e.g. "96 H264/90000")
    pub rtpmap: Option<String>,
}

impl MediaTrack {
    pub fn is_h264(&self) -> bool {
        self.media == "video"
            && self
                .rtpmap
                .as_deref()
                .map(|m| m.to_ascii_uppercase().contains("H264"))
                .unwrap_or(false)
    }
}

/// Parsed session description.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub tracks: Vec<MediaTrack>,
}

impl SessionDescription {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|_| Error::Protocol("SDP is not valid UTF-8".to_string()))?;

        let mut tracks: Vec<MediaTrack> = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(m) = line.strip_prefix("m=") {
                // "video 0 RTP/AVP 96"
                let mut fields = m.split_whitespace();
                let media = fields
                    .next()
                    .ok_or_else(|| Error::Protocol("empty m= line".to_string()))?
                    .to_string();
                let payload_type = fields
                    .nth(2)
                    .and_then(|pt| pt.parse().ok())
                    .ok_or_else(|| Error::Protocol(format!("invalid m= line: {line}")))?;
                tracks.push(MediaTrack {
                    media,
                    payload_type,
                    control: None,
                    rtpmap: None,
                });
            } else if let Some(control) = line.strip_prefix("a=control:") {
                if let Some(track) = tracks.last_mut() {
                    track.control = Some(control.to_string());
                }
            } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                if let Some(track) = tracks.last_mut() {
                    track.rtpmap = Some(rtpmap.to_string());
                }
            }
        }

        if tracks.is_empty() {
            return Err(Error::Protocol("SDP contains no media sections".to_string()));
        }
        Ok(Self { tracks })
    }

    /// Resolve a SETUP URL to a track index by its control attribute.
    /// Falls back to a `trackID=N` suffix, then to track 0.
    pub fn track_for_setup_url(&self, url: &str) -> usize {
        for (i, track) in self.tracks.iter().enumerate() {
            if let Some(control) = &track.control {
                if url.ends_with(control.as_str()) {
                    return i;
                }
            }
        }
        if let Some(idx) = url.rfind("trackID=") {
            if let Ok(n) = url[idx + "trackID=".len()..].parse::<usize>() {
                if n < self.tracks.len() {
                    return n;
                }
            }
        }
        0
    }
}
