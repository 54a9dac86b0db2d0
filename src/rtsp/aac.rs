//! ADTS framing for AAC elementary streams
//!
//! The decoder is deliberately restrictive: single-frame packets only,
//! CRC-absent (`protection_absent=1`) required, AAC-LC only. Publishers
//! sending anything else are rejected on the audio path.

use crate::error::{Error, Result};

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

const CHANNEL_COUNTS: [u8; 7] = [1, 2, 3, 4, 5, 6, 8];

/// AAC-LC object type as carried in the ADTS profile field (+1).
const AUDIO_TYPE_AAC_LC: u8 = 2;

/// One decoded ADTS packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsPacket {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub au: Vec<u8>,
}

/// Decode an ADTS stream into packets.
pub fn decode_adts(mut byts: &[u8]) -> Result<Vec<AdtsPacket>> {
    let mut out = Vec::new();

    loop {
        if byts.is_empty() {
            break;
        }
        if byts.len() < 8 {
            return Err(Error::Protocol("ADTS: invalid length".to_string()));
        }

        let sync_word = (u16::from(byts[0]) << 4) | (u16::from(byts[1]) >> 4);
        if sync_word != 0xfff {
            return Err(Error::Protocol("ADTS: invalid syncword".to_string()));
        }

        let protection_absent = byts[1] & 0x01;
        if protection_absent != 1 {
            return Err(Error::Protocol("ADTS: CRC is not supported".to_string()));
        }

        let audio_type = (byts[2] >> 6) + 1;
        if audio_type != AUDIO_TYPE_AAC_LC {
            return Err(Error::Protocol(format!(
                "ADTS: unsupported audio type: {audio_type}"
            )));
        }

        let sample_rate_index = (byts[2] >> 2) & 0x0f;
        let sample_rate = *SAMPLE_RATES
            .get(sample_rate_index as usize)
            .ok_or_else(|| {
                Error::Protocol(format!("ADTS: invalid sample rate index: {sample_rate_index}"))
            })?;

        let channel_config = ((byts[2] & 0x01) << 2) | ((byts[3] >> 6) & 0x03);
        if !(1..=7).contains(&channel_config) {
            return Err(Error::Protocol(format!(
                "ADTS: invalid channel configuration: {channel_config}"
            )));
        }
        let channel_count = CHANNEL_COUNTS[channel_config as usize - 1];

        let frame_len = ((usize::from(byts[3] & 0x03) << 11)
            | (usize::from(byts[4]) << 3)
            | (usize::from(byts[5] >> 5) & 0x07))
            .saturating_sub(7);

        let frame_count = byts[6] & 0x03;
        if frame_count != 0 {
            return Err(Error::Protocol(
                "ADTS: multiple frame count not supported".to_string(),
            ));
        }

        if byts[7..].len() < frame_len {
            return Err(Error::Protocol("ADTS: invalid frame length".to_string()));
        }

        out.push(AdtsPacket {
            sample_rate,
            channel_count,
            au: byts[7..7 + frame_len].to_vec(),
        });
        byts = &byts[7 + frame_len..];
    }

    Ok(out)
}

/// Encode packets into an ADTS stream (single frame per header, no CRC).
pub fn encode_adts(pkts: &[AdtsPacket]) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    for pkt in pkts {
        let sample_rate_index = SAMPLE_RATES
            .iter()
            .position(|&s| s == pkt.sample_rate)
            .ok_or_else(|| {
                Error::Protocol(format!("ADTS: invalid sample rate: {}", pkt.sample_rate))
            })?;

        let channel_config = CHANNEL_COUNTS
            .iter()
            .position(|&c| c == pkt.channel_count)
            .map(|i| i + 1)
            .ok_or_else(|| {
                Error::Protocol(format!("ADTS: invalid channel count: {}", pkt.channel_count))
            })?;

        let frame_len = pkt.au.len() + 7;
        let fullness = 0x07ff; // like ffmpeg does

        out.push(0xff);
        out.push(0xf1);
        out.push(
            ((AUDIO_TYPE_AAC_LC - 1) << 6)
                | ((sample_rate_index as u8) << 2)
                | ((channel_config as u8 >> 2) & 0x01),
        );
        out.push(((channel_config as u8 & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03));
        out.push((frame_len >> 3) as u8);
        out.push(((frame_len as u8 & 0x07) << 5) | ((fullness >> 6) as u8 & 0x1f));
        out.push((fullness as u8 & 0x3f) << 2);
        out.extend_from_slice(&pkt.au);
    }

    Ok(out)
}
