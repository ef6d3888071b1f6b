//! Voice-note metadata from raw Ogg/Opus bytes.
//!
//! Only enough of the container is walked to find the Opus header and the
//! final granule position; nothing is decoded.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{Error, Result};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const OPUS_HEAD: &[u8; 8] = b"OpusHead";
const PAGE_HEADER_LEN: usize = 27;
const DEFAULT_SAMPLE_RATE: u32 = 48_000;

pub const MIN_DURATION_SECS: u32 = 1;
pub const MAX_DURATION_SECS: u32 = 300;
pub const WAVEFORM_LEN: usize = 64;

/// Playback metadata attached to an outgoing voice note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInfo {
    pub duration_seconds: u32,
    /// [`WAVEFORM_LEN`] samples, each in 0..=100
    pub waveform: Vec<u8>,
}

/// Fields read from the "OpusHead" identification header
#[derive(Debug, Clone, Copy)]
struct OpusHead {
    pre_skip: u16,
    sample_rate: u32,
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Opus ID header: magic(8) version(1) channels(1) pre_skip(2) rate(4)
fn parse_opus_head(page: &[u8]) -> Option<OpusHead> {
    let at = find(page, OPUS_HEAD)?;
    let fields = page.get(at + 10..at + 16)?;
    Some(OpusHead {
        pre_skip: le_u16(&fields[0..2]),
        sample_rate: le_u32(&fields[2..6]),
    })
}

/// Compute duration and a display waveform for an Ogg-encapsulated Opus
/// stream. Fails only when the buffer does not start with an Ogg page.
pub fn analyze_ogg_opus(data: &[u8]) -> Result<AudioInfo> {
    if !data.starts_with(CAPTURE_PATTERN) {
        return Err(Error::Parse(
            "not an Ogg stream (missing OggS capture pattern)".to_string(),
        ));
    }

    let mut last_granule = 0u64;
    let mut head: Option<OpusHead> = None;
    let mut i = 0usize;

    while i + PAGE_HEADER_LEN < data.len() {
        if &data[i..i + 4] != CAPTURE_PATTERN {
            // Resync on the next capture pattern
            i += 1;
            continue;
        }

        let granule = le_u64(&data[i + 6..i + 14]);
        let sequence = le_u32(&data[i + 18..i + 22]);
        let segments = data[i + 26] as usize;

        let table_end = i + PAGE_HEADER_LEN + segments;
        if table_end >= data.len() {
            break;
        }
        let payload: usize = data[i + PAGE_HEADER_LEN..table_end]
            .iter()
            .map(|&len| len as usize)
            .sum();
        let page_len = PAGE_HEADER_LEN + segments + payload;

        if head.is_none() && sequence <= 1 {
            let page_end = (i + page_len).min(data.len());
            head = parse_opus_head(&data[i..page_end]);
            if let Some(h) = head {
                debug!(
                    "OpusHead: sample_rate={} pre_skip={}",
                    h.sample_rate, h.pre_skip
                );
            }
        }

        if granule != 0 {
            last_granule = granule;
        }
        i += page_len;
    }

    let (pre_skip, sample_rate) = match head {
        Some(h) if h.sample_rate > 0 => (h.pre_skip, h.sample_rate),
        Some(h) => (h.pre_skip, DEFAULT_SAMPLE_RATE),
        None => {
            debug!("No OpusHead found, assuming {} Hz", DEFAULT_SAMPLE_RATE);
            (0, DEFAULT_SAMPLE_RATE)
        }
    };

    let raw = if last_granule > 0 {
        let samples = last_granule.saturating_sub(pre_skip as u64);
        (samples as f64 / sample_rate as f64).ceil()
    } else {
        debug!("No granule position found, estimating from size");
        (data.len() / 2000) as f64
    };
    let duration_seconds = raw.clamp(MIN_DURATION_SECS as f64, MAX_DURATION_SECS as f64) as u32;

    debug!(
        "Ogg analysis: {} bytes, last_granule={}, duration={}s",
        data.len(),
        last_granule,
        duration_seconds
    );

    Ok(AudioInfo {
        duration_seconds,
        waveform: placeholder_waveform(duration_seconds),
    })
}

/// Synthetic amplitude envelope; a pure function of `duration_seconds`
pub fn placeholder_waveform(duration_seconds: u32) -> Vec<u8> {
    const BASE_AMPLITUDE: f64 = 35.0;

    let mut rng = ChaCha8Rng::seed_from_u64(duration_seconds as u64);
    let frequency = duration_seconds.min(120) as f64 / 30.0;
    let pi = std::f64::consts::PI;

    (0..WAVEFORM_LEN)
        .map(|i| {
            let pos = i as f64 / WAVEFORM_LEN as f64;
            let mut val = BASE_AMPLITUDE * (pos * pi * frequency * 8.0).sin();
            val += BASE_AMPLITUDE / 2.0 * (pos * pi * frequency * 16.0).sin();
            val += (rng.gen::<f64>() - 0.5) * 15.0;
            // Quieter at both ends
            val *= 0.7 + 0.3 * (pos * pi).sin();
            (val + 50.0).clamp(0.0, 100.0) as u8
        })
        .collect()
}
