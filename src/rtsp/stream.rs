//! Per-path stream state
//!
//! A registered path owns the publisher's session description, the reader
//! set, and a broadcast feed of H264 access units for in-process consumers
//! (HLS muxer, recorder). Reader delivery is non-blocking: a reader that
//! cannot keep up loses packets, its congestion is never propagated to the
//! publisher or to other readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use crate::rtsp::sdp::SessionDescription;

const READER_QUEUE_LEN: usize = 256;
const AU_FEED_LEN: usize = 64;

/// Raw RTP packet as received from the publisher, tagged with its track.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub track: usize,
    pub data: Vec<u8>,
}

/// One H264 access unit in Annex-B form, with its 90 kHz RTP timestamp
/// mapped to a stream-relative presentation time.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub keyframe: bool,
    pub pts: Duration,
}

/// Handle delivering packets to one reader session.
pub struct ReaderHandle {
    pub tx: mpsc::Sender<Arc<RtpPacket>>,
}

/// State of one registered path.
pub struct PathEntry {
    pub name: String,
    /// Current publisher, if any. `(session_token, raw SDP, parsed SDP)`.
    publisher: RwLock<Option<Publisher>>,
    readers: Mutex<HashMap<u64, ReaderHandle>>,
    next_reader_id: AtomicU64,
    au_tx: broadcast::Sender<Arc<AccessUnit>>,
    depack: Mutex<H264Depacketizer>,
}

pub struct Publisher {
    pub session_token: String,
    pub raw_sdp: Vec<u8>,
    pub sdp: SessionDescription,
}

impl PathEntry {
    pub fn new(name: &str) -> Self {
        let (au_tx, _) = broadcast::channel(AU_FEED_LEN);
        Self {
            name: name.to_string(),
            publisher: RwLock::new(None),
            readers: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(0),
            au_tx,
            depack: Mutex::new(H264Depacketizer::new()),
        }
    }

    /// Install a publisher. Fails when the path already has a live one.
    pub async fn set_publisher(&self, publisher: Publisher) -> bool {
        let mut guard = self.publisher.write().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(publisher);
        true
    }

    /// Remove the publisher iff it is owned by `session_token`. Readers stay
    /// connected and simply receive no data until the next publisher.
    pub async fn clear_publisher(&self, session_token: &str) {
        let mut guard = self.publisher.write().await;
        if guard
            .as_ref()
            .map(|p| p.session_token == session_token)
            .unwrap_or(false)
        {
            *guard = None;
            self.depack.lock().await.reset();
        }
    }

    pub async fn publisher_sdp(&self) -> Option<(Vec<u8>, SessionDescription)> {
        self.publisher
            .read()
            .await
            .as_ref()
            .map(|p| (p.raw_sdp.clone(), p.sdp.clone()))
    }

    pub async fn has_publisher(&self) -> bool {
        self.publisher.read().await.is_some()
    }

    /// Register a reader; returns its id and the receive side of its queue.
    pub async fn add_reader(&self) -> (u64, mpsc::Receiver<Arc<RtpPacket>>) {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(READER_QUEUE_LEN);
        self.readers.lock().await.insert(id, ReaderHandle { tx });
        (id, rx)
    }

    pub async fn remove_reader(&self, id: u64) {
        self.readers.lock().await.remove(&id);
    }

    /// Subscribe to the access-unit feed. Survives publisher churn.
    pub fn subscribe_au(&self) -> broadcast::Receiver<Arc<AccessUnit>> {
        self.au_tx.subscribe()
    }

    /// Ingest one RTP packet from the publisher: fan out to readers and,
    /// for the video track, feed the depacketizer.
    pub async fn handle_rtp(&self, packet: RtpPacket, video_track: Option<usize>) {
        let packet = Arc::new(packet);

        {
            let mut readers = self.readers.lock().await;
            readers.retain(|_, handle| match handle.tx.try_send(packet.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true, // drop packet, keep reader
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        if Some(packet.track) == video_track {
            let au = self.depack.lock().await.push(&packet.data);
            if let Some(au) = au {
                let _ = self.au_tx.send(Arc::new(au));
            }
        }
    }
}

/// Payload of an RTP packet, skipping the fixed header, CSRCs and any
/// header extension. Returns None for malformed packets.
pub fn rtp_payload(rtp: &[u8]) -> Option<&[u8]> {
    if rtp.len() < 12 || rtp[0] >> 6 != 2 {
        return None;
    }
    let csrc_count = (rtp[0] & 0x0f) as usize;
    let has_extension = rtp[0] & 0x10 != 0;

    let mut offset = 12 + csrc_count * 4;
    if has_extension {
        if rtp.len() < offset + 4 {
            return None;
        }
        let ext_len = u16::from_be_bytes([rtp[offset + 2], rtp[offset + 3]]) as usize;
        offset += 4 + ext_len * 4;
    }
    if rtp.len() <= offset {
        return None;
    }
    Some(&rtp[offset..])
}

/// RFC 6184 H264 depacketizer: single NAL units, STAP-A aggregates and
/// FU-A fragments. Access-unit boundaries come from the RTP marker bit.
pub struct H264Depacketizer {
    nals: Vec<Vec<u8>>,
    fragment: Vec<u8>,
    first_timestamp: Option<u32>,
    current_timestamp: u32,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            nals: Vec::new(),
            fragment: Vec::new(),
            first_timestamp: None,
            current_timestamp: 0,
        }
    }

    pub fn reset(&mut self) {
        self.nals.clear();
        self.fragment.clear();
        self.first_timestamp = None;
    }

    /// Push one RTP packet; returns a complete access unit when the marker
    /// bit closes it.
    pub fn push(&mut self, rtp: &[u8]) -> Option<AccessUnit> {
        let payload = rtp_payload(rtp)?;
        let marker = rtp[1] & 0x80 != 0;
        let timestamp = u32::from_be_bytes([rtp[4], rtp[5], rtp[6], rtp[7]]);

        self.current_timestamp = timestamp;
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(timestamp);
        }

        match payload[0] & 0x1f {
            1..=23 => self.nals.push(payload.to_vec()),
            24 => {
                // STAP-A: 2-byte size prefixed NAL units.
                let mut rest = &payload[1..];
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    rest = &rest[2..];
                    if rest.len() < size {
                        break;
                    }
                    self.nals.push(rest[..size].to_vec());
                    rest = &rest[size..];
                }
            }
            28 => {
                // FU-A: indicator, header with S/E bits, fragment payload.
                if payload.len() < 2 {
                    return None;
                }
                let start = payload[1] & 0x80 != 0;
                let end = payload[1] & 0x40 != 0;
                if start {
                    let nal_header = (payload[0] & 0xe0) | (payload[1] & 0x1f);
                    self.fragment = vec![nal_header];
                }
                self.fragment.extend_from_slice(&payload[2..]);
                if end && !self.fragment.is_empty() {
                    self.nals.push(std::mem::take(&mut self.fragment));
                }
            }
            _ => {}
        }

        if !marker || self.nals.is_empty() {
            return None;
        }

        let nals = std::mem::take(&mut self.nals);
        let keyframe = nals.iter().any(|n| n[0] & 0x1f == 5);
        let mut data = Vec::new();
        for nal in &nals {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(nal);
        }

        let elapsed = timestamp.wrapping_sub(self.first_timestamp.unwrap_or(timestamp));
        let pts = Duration::from_micros(u64::from(elapsed) * 1_000_000 / 90_000);

        Some(AccessUnit {
            data,
            keyframe,
            pts,
        })
    }
}
