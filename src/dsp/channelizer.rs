//! Splits one wideband IQ stream into per-station PCM sinks, one dedicated
//! thread per channelizer, each station independently able to die without
//! stopping its siblings.

use super::station::{is_broken_pipe, PcmSink, StationDsp};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Converts interleaved unsigned 8-bit IQ bytes to normalized complex
/// samples: `(I - 127.5) / 127.5`.
pub fn iq_bytes_to_complex(bytes: &[u8]) -> Vec<num_complex::Complex32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let i = (pair[0] as f32 - 127.5) / 127.5;
            let q = (pair[1] as f32 - 127.5) / 127.5;
            num_complex::Complex32::new(i, q)
        })
        .collect()
}

pub struct Station {
    pub dsp: StationDsp,
    pub sink: Box<dyn PcmSink>,
}

pub struct Channelizer<R: Read> {
    source: R,
    stations: Vec<Station>,
    block_len_samples: usize,
    stop: Arc<AtomicBool>,
}

impl<R: Read> Channelizer<R> {
    pub fn new(source: R, stations: Vec<Station>, block_len_samples: usize, stop: Arc<AtomicBool>) -> Self {
        Channelizer {
            source,
            stations,
            block_len_samples,
            stop,
        }
    }

    /// Thread body: reads `2 * block_len_samples` bytes per iteration
    /// (2 bytes per IQ sample), dispatching each block to every live
    /// station in configuration order. A short read is retried, not
    /// treated as EOF; a zero-length read is EOF.
    pub fn run(&mut self) {
        let want = self.block_len_samples * 2;
        let mut buf = vec![0u8; want];
        let mut filled = 0usize;

        while !self.stop.load(Ordering::Relaxed) {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled < want {
                        continue;
                    }
                    let block = iq_bytes_to_complex(&buf[..want]);
                    for station in &mut self.stations {
                        if station.dsp.dead {
                            continue;
                        }
                        let pcm = station.dsp.process(&block);
                        if let Err(e) = station.sink.write_pcm(pcm) {
                            if is_broken_pipe(&e) {
                                station.dsp.dead = true;
                            } else {
                                tracing::warn!(error = %e, "station sink write failed");
                                station.dsp.dead = true;
                            }
                        }
                    }
                    filled = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "channelizer source read failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_conversion_maps_range_extremes() {
        let samples = iq_bytes_to_complex(&[0, 127, 128, 255]);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].re - (-1.0)).abs() < 1e-3);
        assert!((samples[1].re - (0.5 / 127.5)).abs() < 1e-3);
    }

    struct VecSink(Vec<u8>);
    impl PcmSink for VecSink {
        fn write_pcm(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.0.extend_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn short_reads_are_buffered_until_a_full_block() {
        use crate::dsp::filter::blackman_sinc_lpf;
        let taps = blackman_sinc_lpf(0.1, 31);
        let station = Station {
            dsp: StationDsp::new(0.0, 1_000_000.0, &taps, 64, 2),
            sink: Box::new(VecSink(Vec::new())),
        };
        // Feed the block in two halves via a cursor-backed reader that
        // only ever returns a handful of bytes per call.
        struct Trickle(std::io::Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(5);
                self.0.read(&mut buf[..n])
            }
        }
        let data = vec![128u8; 64 * 2];
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let mut chan = Channelizer::new(Trickle(std::io::Cursor::new(data)), vec![station], 64, stop);
        // Run until the single block is consumed, then stop (EOF triggers break).
        chan.run();
        stop2.store(true, Ordering::Relaxed);
    }
}
