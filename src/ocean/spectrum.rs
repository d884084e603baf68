//! Wave spectrum, butterfly table and slope variance precompute
//!
//! Everything here runs on the CPU once per parameter change. Sums are
//! carried in `f64` and stored as `f32` texels.

use std::f64::consts::PI;

use super::{FFT_SEED, FFT_SIZE, GRID_SIZES, PASSES};
pub use crate::math::Lcg;

/// Gravity-capillary crossover wavenumber
pub const KM: f64 = 370.0;
/// Phase speed at [`KM`]
pub const CM: f64 = 0.23;

/// Parameters that shape the spectrum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumParams {
    /// Wind speed at 10 m
    pub wind: f32,
    /// Inverse wave age
    pub omega: f32,
    pub amplitude: f32,
}

fn sqr(x: f64) -> f64 {
    x * x
}

/// Deep-water dispersion with the capillary term.
pub fn omega(k: f64) -> f64 {
    (9.81 * k * (1.0 + sqr(k / KM))).sqrt()
}

impl SpectrumParams {
    /// Directional spectrum at wave vector `(kx, ky)`. With `omnispectrum`
    /// the direction-independent spectrum is returned instead.
    pub fn spectrum(&self, kx: f64, ky: f64, omnispectrum: bool) -> f64 {
        let u10 = (self.wind as f64).max(0.001);
        let big_omega = self.omega as f64;
        let amp = self.amplitude as f64;

        let k = (kx * kx + ky * ky).sqrt();
        let c = omega(k) / k;

        // spectral peak
        let kp = 9.81 * sqr(big_omega / u10);
        let cp = omega(kp) / kp;

        // friction velocity
        let z0 = 3.7e-5 * sqr(u10) / 9.81 * (u10 / cp).powf(0.9);
        let u_star = 0.41 * u10 / (10.0 / z0).ln();

        let lpm = (-5.0 / 4.0 * sqr(kp / k)).exp();
        let gamma = if big_omega < 1.0 {
            1.7
        } else {
            1.7 + 6.0 * big_omega.ln()
        };
        let sigma = 0.08 * (1.0 + 4.0 / big_omega.powi(3));
        let peak = (-1.0 / (2.0 * sqr(sigma)) * sqr((k / kp).sqrt() - 1.0)).exp();
        let jp = gamma.powf(peak);
        let fp = lpm * jp * (-big_omega / 10f64.sqrt() * ((k / kp).sqrt() - 1.0)).exp();
        let alpha_p = 0.006 * big_omega.sqrt();
        let mut bl = 0.5 * alpha_p * cp / c * fp;

        let alpha_m = if u_star < CM {
            0.01 * (1.0 + (u_star / CM).ln())
        } else {
            0.01 * (1.0 + 3.0 * (u_star / CM).ln())
        };
        let fm = (-0.25 * sqr(k / KM - 1.0)).exp();
        let mut bh = 0.5 * alpha_m * CM / c * fm * lpm;

        if omnispectrum {
            return amp * (bl + bh) / (k * sqr(k));
        }

        let a0 = 2f64.ln() / 4.0;
        let ap = 4.0;
        let am = 0.13 * u_star / CM;
        let delta = (a0 + ap * (c / cp).powf(2.5) + am * (CM / c).powf(2.5)).tanh();
        let phi = ky.atan2(kx);

        if kx < 0.0 {
            return 0.0;
        }
        bl *= 2.0;
        bh *= 2.0;
        amp * (bl + bh) * (1.0 + delta * (2.0 * phi).cos()) / (2.0 * PI * sqr(sqr(k)))
    }

    /// Complex amplitude of FFT bin `(i, j)` for a patch of `length_scale`.
    /// Bins inside the `k_min` box carry no energy and draw no phase.
    pub fn get_spectrum_sample(&self, rng: &mut Lcg, i: i32, j: i32, length_scale: f64, k_min: f64) -> (f64, f64) {
        let dk = 2.0 * PI / length_scale;
        let kx = i as f64 * dk;
        let ky = j as f64 * dk;
        if kx.abs() < k_min && ky.abs() < k_min {
            return (0.0, 0.0);
        }
        let s = self.spectrum(kx, ky, false);
        let h = (s / 2.0).sqrt() * dk;
        let phi = rng.next_f64() * 2.0 * PI;
        (h * phi.cos(), h * phi.sin())
    }

    /// Integral of k² times the omnidirectional spectrum over k in [5e-3, 1e3].
    pub fn theoretic_slope_variance(&self) -> f64 {
        let mut variance = 0.0;
        let mut k = 5e-3;
        while k < 1e3 {
            let next = k * 1.001;
            variance += k * k * self.spectrum(k, 0.0, true) * (next - k);
            k = next;
        }
        variance
    }
}

/// Signed frequency of FFT index `x`.
fn signed_index(x: u32, size: u32) -> i32 {
    if x >= size / 2 {
        x as i32 - size as i32
    } else {
        x as i32
    }
}

/// Initial spectra and the variance correction derived from them
#[derive(Debug, Clone)]
pub struct WaveSpectrum {
    pub size: u32,
    /// Grids 1 and 2 packed as (re, im, re, im)
    pub spectrum_1_2: Vec<[f32; 4]>,
    /// Grids 3 and 4
    pub spectrum_3_4: Vec<[f32; 4]>,
    /// Half the gap between the theoretic and the sampled slope variance
    pub slope_variance_delta: f32,
}

impl WaveSpectrum {
    /// Sample all four grids with the fixed seed. The result only depends on
    /// `params`.
    pub fn generate(params: &SpectrumParams) -> Self {
        Self::generate_sized(params, FFT_SIZE)
    }

    pub fn generate_sized(params: &SpectrumParams, size: u32) -> Self {
        let n = size as f64;
        let [g1, g2, g3, g4] = GRID_SIZES.map(f64::from);
        let mut rng = Lcg::new(FFT_SEED);
        let texels = (size * size) as usize;
        let mut spectrum_1_2 = Vec::with_capacity(texels);
        let mut spectrum_3_4 = Vec::with_capacity(texels);
        for y in 0..size {
            for x in 0..size {
                let i = signed_index(x, size);
                let j = signed_index(y, size);
                let s1 = params.get_spectrum_sample(&mut rng, i, j, g1, PI / g1);
                let s2 = params.get_spectrum_sample(&mut rng, i, j, g2, PI * n / g1);
                let s3 = params.get_spectrum_sample(&mut rng, i, j, g3, PI * n / g2);
                let s4 = params.get_spectrum_sample(&mut rng, i, j, g4, PI * n / g3);
                spectrum_1_2.push([s1.0 as f32, s1.1 as f32, s2.0 as f32, s2.1 as f32]);
                spectrum_3_4.push([s3.0 as f32, s3.1 as f32, s4.0 as f32, s4.1 as f32]);
            }
        }

        let mut spectrum = Self {
            size,
            spectrum_1_2,
            spectrum_3_4,
            slope_variance_delta: 0.0,
        };
        let delta = 0.5 * (params.theoretic_slope_variance() - spectrum.total_slope_variance());
        spectrum.slope_variance_delta = delta as f32;
        spectrum
    }

    /// Slope variance actually represented by the sampled spectra.
    pub fn total_slope_variance(&self) -> f64 {
        fn slope_variance(kx: f64, ky: f64, re: f32, im: f32) -> f64 {
            let k_square = kx * kx + ky * ky;
            let h_square = (re as f64) * (re as f64) + (im as f64) * (im as f64);
            k_square * h_square * 2.0
        }
        let [g1, g2, g3, g4] = GRID_SIZES.map(f64::from);
        let mut total = 0.0;
        for y in 0..self.size {
            for x in 0..self.size {
                let offset = (x + y * self.size) as usize;
                let i = 2.0 * PI * signed_index(x, self.size) as f64;
                let j = 2.0 * PI * signed_index(y, self.size) as f64;
                let [a0, a1, a2, a3] = self.spectrum_1_2[offset];
                let [b0, b1, b2, b3] = self.spectrum_3_4[offset];
                total += slope_variance(i / g1, j / g1, a0, a1);
                total += slope_variance(i / g2, j / g2, a2, a3);
                total += slope_variance(i / g3, j / g3, b0, b1);
                total += slope_variance(i / g4, j / g4, b2, b3);
            }
        }
        total
    }
}

/// Reverse the low `log2(n)` bits of `i`.
pub fn bit_reverse(i: u32, n: u32) -> u32 {
    let bits = n.trailing_zeros();
    if bits == 0 {
        return 0;
    }
    i.reverse_bits() >> (32 - bits)
}

/// Butterfly lookup, one row per pass and `2^passes` texels per row. Each
/// texel holds both source indices as texel-centre coordinates and the
/// twiddle factor, negated for the lower half of each butterfly.
pub fn butterfly_lookup(passes: u32) -> Vec<[f32; 4]> {
    let size = 1u32 << passes;
    let mut data = vec![[0.0f32; 4]; (size * passes) as usize];
    for pass in 0..passes {
        let blocks = 1u32 << (passes - 1 - pass);
        let half_inputs = 1u32 << pass;
        for block in 0..blocks {
            for k in 0..half_inputs {
                let i1 = block * half_inputs * 2 + k;
                let i2 = i1 + half_inputs;
                let (j1, j2) = if pass == 0 {
                    (bit_reverse(i1, size), bit_reverse(i2, size))
                } else {
                    (i1, i2)
                };
                let angle = 2.0 * PI * (k * blocks) as f64 / size as f64;
                let (wr, wi) = (angle.cos() as f32, angle.sin() as f32);
                let u1 = (j1 as f32 + 0.5) / size as f32;
                let u2 = (j2 as f32 + 0.5) / size as f32;
                data[(i1 + pass * size) as usize] = [u1, u2, wr, wi];
                data[(i2 + pass * size) as usize] = [u1, u2, -wr, -wi];
            }
        }
    }
    data
}

/// Butterfly table for the configured FFT size.
pub fn default_butterfly() -> Vec<[f32; 4]> {
    butterfly_lookup(PASSES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocean::{AMPLITUDE, OMEGA, WIND};

    fn params() -> SpectrumParams {
        SpectrumParams {
            wind: WIND,
            omega: OMEGA,
            amplitude: AMPLITUDE,
        }
    }

    #[test]
    fn test_lcg_sequence() {
        let mut rng = Lcg::new(1234);
        let first = rng.next_f64();
        let expected_seed = (1234u64 * 1_103_515_245 + 12_345) & 0x7fff_ffff;
        assert_eq!(first, (expected_seed >> 7) as f64 / (1u64 << 24) as f64);
        for _ in 0..1000 {
            let value = rng.next_f64();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_bit_reverse() {
        assert_eq!(bit_reverse(1, 256), 128);
        assert_eq!(bit_reverse(3, 8), 6);
        assert_eq!(bit_reverse(0, 256), 0);
        assert_eq!(bit_reverse(255, 256), 255);
    }

    #[test]
    fn test_butterfly_first_pass_uses_bit_reversal() {
        let data = butterfly_lookup(3);
        assert_eq!(data.len(), 8 * 3);
        // pass 0: pairs (0, 1) read bit-reversed (0, 4)
        assert_eq!(data[0][0], 0.5 / 8.0);
        assert_eq!(data[0][1], 4.5 / 8.0);
        assert_eq!(data[0][2], 1.0);
        assert_eq!(data[1][2], -1.0);
        // later passes read in place
        let row = &data[8..16];
        assert_eq!(row[0][0], 0.5 / 8.0);
        assert_eq!(row[0][1], 2.5 / 8.0);
    }

    #[test]
    fn test_spectrum_is_one_sided() {
        let p = params();
        assert_eq!(p.spectrum(-0.1, 0.05, false), 0.0);
        assert!(p.spectrum(0.1, 0.05, false) > 0.0);
        assert!(p.spectrum(0.1, 0.0, true) > 0.0);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let p = params();
        let a = WaveSpectrum::generate_sized(&p, 16);
        let b = WaveSpectrum::generate_sized(&p, 16);
        assert_eq!(a.spectrum_1_2, b.spectrum_1_2);
        assert_eq!(a.spectrum_3_4, b.spectrum_3_4);
        assert_eq!(a.slope_variance_delta, b.slope_variance_delta);
        // the DC bin sits inside every k_min box
        assert_eq!(a.spectrum_1_2[0], [0.0; 4]);
        // at 16 bins grid 1 only reaches waves far longer than the peak, where
        // the low-frequency cutoff leaves nothing
        assert!(a.spectrum_1_2.iter().all(|s| s[0] == 0.0 && s[1] == 0.0));
        assert!(a.spectrum_1_2.iter().any(|s| s[2] != 0.0));
        assert!(a.spectrum_3_4.iter().any(|s| s[0] != 0.0));
        assert!(a.spectrum_3_4.iter().any(|s| s[2] != 0.0));
    }

    #[test]
    fn test_slope_variance_delta_is_finite() {
        let p = params();
        let spectrum = WaveSpectrum::generate_sized(&p, 16);
        assert!(spectrum.slope_variance_delta.is_finite());
        assert!(p.theoretic_slope_variance() > 0.0);
    }
}
