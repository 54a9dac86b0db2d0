//! Minimal MPEG-TS packetization
//!
//! Single-program stream: PAT, PMT and one H264 elementary stream. Enough
//! structure for hls.js and ffmpeg to consume the segments; no audio mux.

use std::time::Duration;

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x100;
const STREAM_TYPE_H264: u8 = 0x1b;

/// MPEG-2 CRC32 (poly 0x04C11DB7, no reflection, init all-ones).
fn crc32_mpeg(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04c1_1db7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Stateful packetizer; continuity counters persist across segments.
pub struct TsMuxer {
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            cc_pat: 0,
            cc_pmt: 0,
            cc_video: 0,
        }
    }

    /// PAT + PMT packets; every segment starts with these so each file is
    /// independently decodable.
    pub fn segment_header(&mut self) -> Vec<u8> {
        let pat_cc = mut_cc(&mut self.cc_pat);
        let pmt_cc = mut_cc(&mut self.cc_pmt);
        let mut out = Vec::with_capacity(TS_PACKET_SIZE * 2);
        out.extend_from_slice(&psi_packet(0, &pat_section(), pat_cc));
        out.extend_from_slice(&psi_packet(PMT_PID, &pmt_section(), pmt_cc));
        out
    }

    /// Packetize one access unit (Annex-B) as a PES packet on the video PID.
    pub fn write_au(&mut self, data: &[u8], pts: Duration, keyframe: bool) -> Vec<u8> {
        let pes = pes_header(pts, data.len());
        let mut payload = Vec::with_capacity(pes.len() + data.len());
        payload.extend_from_slice(&pes);
        payload.extend_from_slice(data);

        let mut out = Vec::new();
        let mut remaining = &payload[..];
        let mut first = true;
        while !remaining.is_empty() {
            let mut pkt = Vec::with_capacity(TS_PACKET_SIZE);
            pkt.push(SYNC_BYTE);
            pkt.push(if first { 0x40 } else { 0x00 } | ((VIDEO_PID >> 8) as u8 & 0x1f));
            pkt.push(VIDEO_PID as u8);

            let cc = mut_cc(&mut self.cc_video);

            // Adaptation field carries the PCR on the first packet of a
            // keyframe AU, and stuffing whenever the payload is short.
            let mut adaptation: Vec<u8> = Vec::new();
            if first && keyframe {
                let base = pts.as_nanos() as u64 * 90_000 / 1_000_000_000;
                adaptation.push(0x10); // PCR flag
                adaptation.push((base >> 25) as u8);
                adaptation.push((base >> 17) as u8);
                adaptation.push((base >> 9) as u8);
                adaptation.push((base >> 1) as u8);
                adaptation.push(((base as u8 & 0x01) << 7) | 0x7e);
                adaptation.push(0x00);
            }

            let no_af_capacity = TS_PACKET_SIZE - 4;
            if adaptation.is_empty() && remaining.len() >= no_af_capacity {
                pkt.push(0x10 | cc);
                pkt.extend_from_slice(&remaining[..no_af_capacity]);
                remaining = &remaining[no_af_capacity..];
            } else {
                if adaptation.is_empty() {
                    adaptation.push(0x00);
                }
                let capacity = TS_PACKET_SIZE - 4 - 1 - adaptation.len();
                let take = remaining.len().min(capacity);
                let stuffing = capacity - take;
                pkt.push(0x30 | cc);
                pkt.push((adaptation.len() + stuffing) as u8);
                pkt.extend_from_slice(&adaptation);
                pkt.resize(pkt.len() + stuffing, 0xff);
                pkt.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
            }
            debug_assert_eq!(pkt.len(), TS_PACKET_SIZE);
            out.extend_from_slice(&pkt);
            first = false;
        }
        out
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn mut_cc(cc: &mut u8) -> u8 {
    let current = *cc;
    *cc = (*cc + 1) & 0x0f;
    current
}

fn psi_packet(pid: u16, section: &[u8], cc: u8) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(TS_PACKET_SIZE);
    pkt.push(SYNC_BYTE);
    pkt.push(0x40 | ((pid >> 8) as u8 & 0x1f)); // PUSI set
    pkt.push(pid as u8);
    pkt.push(0x10 | (cc & 0x0f)); // payload only
    pkt.push(0x00); // pointer field
    pkt.extend_from_slice(section);
    pkt.resize(TS_PACKET_SIZE, 0xff);
    pkt
}

fn pat_section() -> Vec<u8> {
    let mut section = vec![
        0x00, // table_id
        0xb0, 0x0d, // section_syntax + length 13
        0x00, 0x01, // transport_stream_id
        0xc1, // version 0, current_next 1
        0x00, 0x00, // section/last_section number
        0x00, 0x01, // program_number 1
        0xe0 | ((PMT_PID >> 8) as u8 & 0x1f),
        PMT_PID as u8,
    ];
    let crc = crc32_mpeg(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pmt_section() -> Vec<u8> {
    let mut section = vec![
        0x02, // table_id
        0xb0, 0x12, // section_syntax + length 18
        0x00, 0x01, // program_number
        0xc1, // version 0, current_next 1
        0x00, 0x00, // section/last_section number
        0xe0 | ((VIDEO_PID >> 8) as u8 & 0x1f),
        VIDEO_PID as u8, // PCR PID
        0xf0, 0x00, // program_info_length 0
        STREAM_TYPE_H264,
        0xe0 | ((VIDEO_PID >> 8) as u8 & 0x1f),
        VIDEO_PID as u8,
        0xf0, 0x00, // ES_info_length 0
    ];
    let crc = crc32_mpeg(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn pes_header(pts: Duration, _payload_len: usize) -> Vec<u8> {
    let pts_ticks = pts.as_nanos() as u64 * 90_000 / 1_000_000_000;
    let mut header = vec![
        0x00, 0x00, 0x01, 0xe0, // start code, video stream id
        0x00, 0x00, // PES_packet_length 0: unbounded, allowed for video
        0x80, // marker bits
        0x80, // PTS only
        0x05, // header data length
    ];
    header.push(0x20 | (((pts_ticks >> 30) as u8 & 0x07) << 1) | 0x01);
    header.push((pts_ticks >> 22) as u8);
    header.push((((pts_ticks >> 14) as u8) & 0xfe) | 0x01);
    header.push((pts_ticks >> 7) as u8);
    header.push((((pts_ticks << 1) as u8) & 0xfe) | 0x01);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect the PES payload carried on the video PID.
    fn demux_video(ts: &[u8]) -> Vec<u8> {
        assert_eq!(ts.len() % TS_PACKET_SIZE, 0);
        let mut out = Vec::new();
        for pkt in ts.chunks(TS_PACKET_SIZE) {
            assert_eq!(pkt[0], SYNC_BYTE);
            let pid = (u16::from(pkt[1] & 0x1f) << 8) | u16::from(pkt[2]);
            if pid != VIDEO_PID {
                continue;
            }
            let afc = (pkt[3] >> 4) & 0x03;
            let mut offset = 4;
            if afc & 0x02 != 0 {
                offset += 1 + pkt[4] as usize;
            }
            if afc & 0x01 != 0 {
                out.extend_from_slice(&pkt[offset..]);
            }
        }
        out
    }

    #[test]
    fn test_segment_header_is_two_packets() {
        let mut muxer = TsMuxer::new();
        let header = muxer.segment_header();
        assert_eq!(header.len(), 2 * TS_PACKET_SIZE);
        assert_eq!(header[0], SYNC_BYTE);
        assert_eq!(header[TS_PACKET_SIZE], SYNC_BYTE);
        // PAT on PID 0, PMT on its advertised PID.
        assert_eq!(header[1] & 0x1f, 0);
        let pmt_pid = (u16::from(header[TS_PACKET_SIZE + 1] & 0x1f) << 8)
            | u16::from(header[TS_PACKET_SIZE + 2]);
        assert_eq!(pmt_pid, PMT_PID);
    }

    #[test]
    fn test_au_roundtrips_through_packets() {
        let mut muxer = TsMuxer::new();
        let au: Vec<u8> = (0..1000).map(|i| i as u8).collect();
        let ts = muxer.write_au(&au, Duration::from_secs(1), true);

        let payload = demux_video(&ts);
        // Strip the 9+5 byte PES header.
        assert_eq!(&payload[..4], &[0x00, 0x00, 0x01, 0xe0]);
        assert_eq!(&payload[14..], &au[..]);
    }

    #[test]
    fn test_continuity_counters_increment() {
        let mut muxer = TsMuxer::new();
        let au = vec![0u8; 400];
        let ts = muxer.write_au(&au, Duration::ZERO, false);
        let ccs: Vec<u8> = ts
            .chunks(TS_PACKET_SIZE)
            .map(|pkt| pkt[3] & 0x0f)
            .collect();
        for pair in ccs.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) & 0x0f);
        }
    }

    #[test]
    fn test_pts_encoding() {
        let header = pes_header(Duration::from_secs(1), 0);
        // 90000 ticks = 0x00015F90.
        let pts = (u64::from(header[9] & 0x0e) << 29)
            | (u64::from(header[10]) << 22)
            | (u64::from(header[11] & 0xfe) << 14)
            | (u64::from(header[12]) << 7)
            | (u64::from(header[13]) >> 1);
        assert_eq!(pts, 90_000);
    }

    #[test]
    fn test_crc32_mpeg_known_vector() {
        // CRC of an empty message is the init value.
        assert_eq!(crc32_mpeg(&[]), 0xffff_ffff);
        // Differs per input.
        assert_ne!(crc32_mpeg(b"a"), crc32_mpeg(b"b"));
    }
}
