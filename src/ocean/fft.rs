//! CPU reference of the GPU ocean passes
//!
//! Mirrors `fft_init.wgsl` and `fft.wgsl` texel for texel, including the
//! half-float storage of every intermediate target, so a readback of FFT_A
//! can be checked against it.

use glam::{Vec2, Vec4};
use half::f16;

use super::spectrum::WaveSpectrum;
use crate::resources::FFT_LAYERS;

/// One layer of an FFT target, row-major from the top-left texel
pub type FftLayer = Vec<[f32; 4]>;

fn quantize(v: f32) -> f32 {
    f16::from_f32(v).to_f32()
}

fn quantize4(v: [f32; 4]) -> [f32; 4] {
    v.map(quantize)
}

fn times_i(z: Vec2) -> Vec2 {
    Vec2::new(-z.y, z.x)
}

fn inverse_length(k: Vec2) -> f32 {
    let len = k.length();
    if len == 0.0 {
        0.0
    } else {
        1.0 / len
    }
}

/// Software IFFT over the same inputs the GPU passes read
#[derive(Debug, Clone)]
pub struct CpuFft {
    size: u32,
    passes: u32,
    spectrum_1_2: Vec<[f32; 4]>,
    spectrum_3_4: Vec<[f32; 4]>,
    butterfly: Vec<[f32; 4]>,
    inverse_grid_sizes: Vec4,
}

impl CpuFft {
    pub fn new(spectrum: &WaveSpectrum, butterfly: &[[f32; 4]], inverse_grid_sizes: Vec4) -> Self {
        let size = spectrum.size;
        Self {
            size,
            passes: size.trailing_zeros(),
            spectrum_1_2: spectrum.spectrum_1_2.iter().copied().map(quantize4).collect(),
            spectrum_3_4: spectrum.spectrum_3_4.iter().copied().map(quantize4).collect(),
            butterfly: butterfly.iter().copied().map(quantize4).collect(),
            inverse_grid_sizes,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn animated(&self, k: f32, s0: Vec2, s0c: Vec2, t: f32) -> Vec2 {
        let w = (9.81 * k * (1.0 + k * k / (370.0 * 370.0))).sqrt();
        let (s, c) = (w * t).sin_cos();
        Vec2::new(
            (s0.x + s0c.x) * c - (s0.y + s0c.y) * s,
            (s0.x - s0c.x) * s + (s0.y - s0c.y) * c,
        )
    }

    /// Initial complex amplitudes of every layer at time `t`.
    pub fn init(&self, t: f32) -> Vec<FftLayer> {
        let n = self.size as i32;
        let igs = self.inverse_grid_sizes;
        let texels = (self.size * self.size) as usize;
        let mut layers = vec![Vec::with_capacity(texels); FFT_LAYERS as usize];
        for y in 0..n {
            for x in 0..n {
                let at = |data: &[[f32; 4]], x: i32, y: i32| {
                    let v = data[(x + y * n) as usize];
                    (Vec2::new(v[0], v[1]), Vec2::new(v[2], v[3]))
                };
                let (cx, cy) = ((n - x) % n, (n - y) % n);
                let (s1, s2) = at(&self.spectrum_1_2, x, y);
                let (s3, s4) = at(&self.spectrum_3_4, x, y);
                let (s1c, s2c) = at(&self.spectrum_1_2, cx, cy);
                let (s3c, s4c) = at(&self.spectrum_3_4, cx, cy);

                let signed = |v: i32| {
                    let index = if v >= n / 2 { v - n } else { v };
                    index as f32 / n as f32
                };
                let index = Vec2::new(signed(x), signed(y));
                let k1 = index * igs.x;
                let k2 = index * igs.y;
                let k3 = index * igs.z;
                let k4 = index * igs.w;

                let h1 = self.animated(k1.length(), s1, s1c, t);
                let h2 = self.animated(k2.length(), s2, s2c, t);
                let h3 = self.animated(k3.length(), s3, s3c, t);
                let h4 = self.animated(k4.length(), s4, s4c, t);

                let pack = |a: Vec2, b: Vec2| quantize4([a.x, a.y, b.x, b.y]);
                let slope = |k: Vec2, h: Vec2| times_i(k.x * h) - k.y * h;
                let choppy = |k: Vec2, h: Vec2| {
                    let a = inverse_length(k);
                    -times_i(k.x * a * h) + k.y * a * h
                };
                layers[0].push(pack(h1 + times_i(h2), h3 + times_i(h4)));
                layers[1].push(pack(slope(k1, h1), slope(k2, h2)));
                layers[2].push(pack(slope(k3, h3), slope(k4, h4)));
                layers[3].push(pack(choppy(k1, h1), choppy(k2, h2)));
                layers[4].push(pack(choppy(k3, h3), choppy(k4, h4)));
            }
        }
        layers
    }

    /// One butterfly pass over every layer. `butterfly_pass` is the uniform
    /// the GPU pass receives.
    pub fn butterfly_pass(&self, input: &[FftLayer], vertical: bool, butterfly_pass: f32) -> Vec<FftLayer> {
        let n = self.size as usize;
        let row = (butterfly_pass * self.passes as f32) as usize;
        input
            .iter()
            .map(|layer| {
                let mut out = Vec::with_capacity(layer.len());
                for y in 0..n {
                    for x in 0..n {
                        let coord = if vertical { y } else { x };
                        let data = self.butterfly[coord + row * n];
                        let j1 = (data[0] * n as f32).floor() as usize;
                        let j2 = (data[1] * n as f32).floor() as usize;
                        let (p1, p2) = if vertical {
                            (x + j1 * n, x + j2 * n)
                        } else {
                            (j1 + y * n, j2 + y * n)
                        };
                        let a = layer[p1];
                        let b = layer[p2];
                        let (wr, wi) = (data[2], data[3]);
                        out.push(quantize4([
                            a[0] + wr * b[0] - wi * b[1],
                            a[1] + wi * b[0] + wr * b[1],
                            a[2] + wr * b[2] - wi * b[3],
                            a[3] + wi * b[2] + wr * b[3],
                        ]));
                    }
                }
                out
            })
            .collect()
    }

    /// Init plus all horizontal and vertical passes; returns the final FFT_A.
    pub fn simulate(&self, t: f32) -> Vec<FftLayer> {
        let mut layers = self.init(t);
        for i in 0..self.passes {
            layers = self.butterfly_pass(&layers, false, super::horizontal_pass(i, self.passes));
        }
        for i in self.passes..self.passes * 2 {
            layers = self.butterfly_pass(&layers, true, super::vertical_pass(i, self.passes));
        }
        layers
    }
}

/// Sum of absolute heights of all four grids in the height layer.
pub fn height_sum(heights: &[[f32; 4]]) -> f64 {
    heights
        .iter()
        .map(|t| t.iter().map(|v| v.abs() as f64).sum::<f64>())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocean::spectrum::{butterfly_lookup, SpectrumParams};
    use crate::ocean::{inverse_grid_sizes, AMPLITUDE, OMEGA, WIND};

    fn small_fft(size: u32) -> CpuFft {
        let params = SpectrumParams {
            wind: WIND,
            omega: OMEGA,
            amplitude: AMPLITUDE,
        };
        let spectrum = WaveSpectrum::generate_sized(&params, size);
        let butterfly = butterfly_lookup(size.trailing_zeros());
        CpuFft::new(&spectrum, &butterfly, inverse_grid_sizes(size, 1.0))
    }

    #[test]
    fn test_impulse_transforms_to_constant() {
        let fft = small_fft(8);
        let mut layer = vec![[0.0f32; 4]; 64];
        layer[0] = [1.0, 0.0, 0.0, 0.0];
        let mut layers = vec![layer];
        for i in 0..3 {
            layers = fft.butterfly_pass(&layers, false, (i as f32 + 0.5) / 3.0);
        }
        for i in 0..3 {
            layers = fft.butterfly_pass(&layers, true, (i as f32 + 0.5) / 3.0);
        }
        for texel in &layers[0] {
            assert!((texel[0] - 1.0).abs() < 1e-3, "{texel:?}");
            assert!(texel[1].abs() < 1e-3);
        }
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let fft = small_fft(16);
        let a = fft.simulate(0.0);
        let b = fft.simulate(0.0);
        assert_eq!(a, b);
        assert_eq!(a.len(), FFT_LAYERS as usize);
        assert!(height_sum(&a[0]) > 0.0);
    }
}
