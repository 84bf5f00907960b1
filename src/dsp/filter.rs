//! Overlap-save FIR low-pass filtering via FFT convolution.

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// A windowed-sinc low-pass filter applied to a block stream by overlap-save.
pub struct LowPassFilter {
    fft_len: usize,
    taps_len: usize,
    block_len: usize,
    h: Vec<Complex32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scratch_fwd: Vec<Complex32>,
    scratch_inv: Vec<Complex32>,
    overlap: Vec<Complex32>,
    out: Vec<Complex32>,
}

/// Generates Blackman-windowed sinc low-pass coefficients for the given
/// cutoff (as a fraction of the sample rate) and tap count.
pub fn blackman_sinc_lpf(cutoff_frac: f32, num_taps: usize) -> Vec<f32> {
    assert!(num_taps % 2 == 1, "tap count must be odd for a symmetric filter");
    let m = (num_taps - 1) as f32;
    let mut taps: Vec<f32> = (0..num_taps)
        .map(|i| {
            let n = i as f32 - m / 2.0;
            let sinc = if n == 0.0 {
                2.0 * cutoff_frac
            } else {
                (2.0 * std::f32::consts::PI * cutoff_frac * n).sin() / (std::f32::consts::PI * n)
            };
            let window = 0.42 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / m).cos()
                + 0.08 * (4.0 * std::f32::consts::PI * i as f32 / m).cos();
            sinc * window
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    if sum != 0.0 {
        for t in &mut taps {
            *t /= sum;
        }
    }
    taps
}

impl LowPassFilter {
    pub fn new(taps: &[f32], block_len: usize) -> Self {
        let taps_len = taps.len();
        let fft_len = (block_len + taps_len - 1).next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);

        let mut h: Vec<Complex32> = taps.iter().map(|&t| Complex32::new(t, 0.0)).collect();
        h.resize(fft_len, Complex32::new(0.0, 0.0));
        let mut scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        fft.process_with_scratch(&mut h, &mut scratch);

        LowPassFilter {
            fft_len,
            taps_len,
            block_len,
            h,
            scratch_fwd: vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()],
            scratch_inv: vec![Complex32::new(0.0, 0.0); ifft.get_inplace_scratch_len()],
            fft,
            ifft,
            overlap: vec![Complex32::new(0.0, 0.0); taps_len - 1],
            out: vec![Complex32::new(0.0, 0.0); fft_len],
        }
    }

    /// Filters one block, returning the valid (steady-state) output samples
    /// for that block. The filter keeps its own overlap tail between calls,
    /// so blocks must be fed in order.
    pub fn apply(&mut self, block: &[Complex32]) -> &[Complex32] {
        assert_eq!(block.len(), self.block_len);

        for v in self.out.iter_mut() {
            *v = Complex32::new(0.0, 0.0);
        }
        self.out[..self.overlap.len()].copy_from_slice(&self.overlap);
        self.out[self.overlap.len()..self.overlap.len() + block.len()].copy_from_slice(block);

        self.fft.process_with_scratch(&mut self.out, &mut self.scratch_fwd);
        for (o, h) in self.out.iter_mut().zip(self.h.iter()) {
            *o *= h;
        }
        self.ifft.process_with_scratch(&mut self.out, &mut self.scratch_inv);

        let scale = 1.0 / self.fft_len as f32;
        for v in self.out.iter_mut() {
            *v *= scale;
        }

        // Overlap for next call is the last (taps_len - 1) input samples.
        let start = block.len() - (self.taps_len - 1).min(block.len());
        self.overlap.clear();
        self.overlap.extend_from_slice(&block[start..]);
        self.overlap.resize(self.taps_len - 1, Complex32::new(0.0, 0.0));

        let valid_start = self.taps_len - 1;
        let valid_end = valid_start + block.len();
        &self.out[valid_start..valid_end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coefficients_sum_to_one() {
        let taps = blackman_sinc_lpf(0.1, 63);
        let sum: f32 = taps.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn attenuates_out_of_band_tone() {
        let taps = blackman_sinc_lpf(0.05, 127);
        let mut filt = LowPassFilter::new(&taps, 512);

        let in_band: Vec<Complex32> = (0..512)
            .map(|n| Complex32::from_polar(1.0, 2.0 * std::f32::consts::PI * 0.01 * n as f32))
            .collect();
        let out_of_band: Vec<Complex32> = (0..512)
            .map(|n| Complex32::from_polar(1.0, 2.0 * std::f32::consts::PI * 0.3 * n as f32))
            .collect();

        // warm up the overlap state
        for _ in 0..4 {
            filt.apply(&in_band);
        }
        let in_band_power: f32 = filt.apply(&in_band).iter().map(|c| c.norm_sqr()).sum();

        let mut filt2 = LowPassFilter::new(&taps, 512);
        for _ in 0..4 {
            filt2.apply(&out_of_band);
        }
        let out_of_band_power: f32 = filt2.apply(&out_of_band).iter().map(|c| c.norm_sqr()).sum();

        assert!(out_of_band_power < in_band_power * 0.1);
    }
}
