//! Per-station DSP pipeline: frequency shift, low-pass filter, decimate, FM
//! discriminate, quantize to s16le PCM.

use super::filter::LowPassFilter;
use num_complex::Complex32;
use std::io::{self, Write};

/// Sink for a station's demodulated PCM byte stream. A write error of
/// `BrokenPipe`/`ConnectionReset` marks the station dead; the caller must
/// stop feeding it rather than treat that as a fatal pipeline error.
pub trait PcmSink: Send {
    fn write_pcm(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<W: Write + Send> PcmSink for W {
    fn write_pcm(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }
}

pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
}

pub struct StationDsp {
    pub pi_hint: String,
    phase: f32,
    phase_inc: f32,
    filter: LowPassFilter,
    decimation: usize,
    z_prev: Complex32,
    pcm_scratch: Vec<u8>,
    pub dead: bool,
}

impl StationDsp {
    pub fn new(offset_hz: f32, sample_rate_hz: f32, taps: &[f32], block_len: usize, decimation: usize) -> Self {
        StationDsp {
            pi_hint: String::new(),
            phase: 0.0,
            // A station sitting at +offset_hz above center appears in the
            // tuner's baseband IQ as a tone at +offset_hz; bringing it down
            // to DC means multiplying by exp(-j*2*pi*offset_hz*t), hence the
            // negated sign here rather than the positive one a literal
            // `2*pi*delta_f/fs` phasor would give.
            phase_inc: -2.0 * std::f32::consts::PI * offset_hz / sample_rate_hz,
            filter: LowPassFilter::new(taps, block_len),
            decimation,
            z_prev: Complex32::new(0.0, 0.0),
            pcm_scratch: Vec::new(),
            dead: false,
        }
    }

    /// Runs the full per-station pipeline over one wideband IQ block and
    /// returns the resulting s16le mono PCM bytes.
    pub fn process(&mut self, block: &[Complex32]) -> &[u8] {
        let mut shifted: Vec<Complex32> = Vec::with_capacity(block.len());
        for &s in block {
            shifted.push(s * Complex32::from_polar(1.0, self.phase));
            self.phase += self.phase_inc;
            if self.phase > std::f32::consts::PI {
                self.phase -= 2.0 * std::f32::consts::PI;
            } else if self.phase < -std::f32::consts::PI {
                self.phase += 2.0 * std::f32::consts::PI;
            }
        }

        let filtered = self.filter.apply(&shifted);

        let decimated: Vec<Complex32> = filtered.iter().step_by(self.decimation).copied().collect();

        self.pcm_scratch.clear();
        self.pcm_scratch.reserve(decimated.len() * 2);
        for &z in &decimated {
            let discriminated = (z * self.z_prev.conj()).arg();
            self.z_prev = z;
            let sample = (discriminated / std::f32::consts::PI * i16::MAX as f32)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            self.pcm_scratch.extend_from_slice(&sample.to_le_bytes());
        }

        &self.pcm_scratch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::filter::blackman_sinc_lpf;

    #[test]
    fn process_emits_two_bytes_per_decimated_sample() {
        let taps = blackman_sinc_lpf(0.1, 63);
        let mut dsp = StationDsp::new(0.0, 1_000_000.0, &taps, 256, 4);
        let block: Vec<Complex32> = (0..256).map(|_| Complex32::new(1.0, 0.0)).collect();
        let pcm = dsp.process(&block);
        assert_eq!(pcm.len(), (256 / 4) * 2);
    }

    #[test]
    fn is_broken_pipe_detects_expected_errors() {
        let err = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(is_broken_pipe(&err));
    }
}
