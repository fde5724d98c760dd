use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::config::ColorRangeConfig;

/// Converts 8-bit sRGB into 8-bit CIELAB (L scaled to 0..255, a and b offset
/// by 128).
#[derive(Clone)]
pub struct LabConverter {
    linear: [f32; 256],
}

const XN: f32 = 0.950_456;
const ZN: f32 = 1.088_754;
const EPSILON: f32 = 0.008_856;

fn lab_f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

impl LabConverter {
    pub fn new() -> Self {
        let mut linear = [0f32; 256];
        for (i, v) in linear.iter_mut().enumerate() {
            let c = i as f32 / 255.0;
            *v = if c <= 0.040_45 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            };
        }
        LabConverter { linear }
    }

    pub fn convert(&self, Rgb([r, g, b]): Rgb<u8>) -> [u8; 3] {
        let (r, g, b) = (
            self.linear[r as usize],
            self.linear[g as usize],
            self.linear[b as usize],
        );

        let x = (0.412_453 * r + 0.357_580 * g + 0.180_423 * b) / XN;
        let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
        let z = (0.019_334 * r + 0.119_193 * g + 0.950_227 * b) / ZN;

        let l = if y > EPSILON {
            116.0 * y.cbrt() - 16.0
        } else {
            903.3 * y
        };
        let a = 500.0 * (lab_f(x) - lab_f(y));
        let b = 200.0 * (lab_f(y) - lab_f(z));

        [
            (l * 2.55).round().clamp(0.0, 255.0) as u8,
            (a + 128.0).round().clamp(0.0, 255.0) as u8,
            (b + 128.0).round().clamp(0.0, 255.0) as u8,
        ]
    }

    pub fn convert_image(&self, frame: &RgbImage) -> RgbImage {
        let mut lab = RgbImage::new(frame.width(), frame.height());
        for (src, dst) in frame.pixels().zip(lab.pixels_mut()) {
            *dst = Rgb(self.convert(*src));
        }
        lab
    }
}

impl Default for LabConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Scales natural CIELAB values to the 8-bit encoding.
fn scale(v: [f64; 3]) -> [u8; 3] {
    [
        (v[0] * 2.55).round().clamp(0.0, 255.0) as u8,
        (v[1] + 128.0).round().clamp(0.0, 255.0) as u8,
        (v[2] + 128.0).round().clamp(0.0, 255.0) as u8,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LabBounds {
    lower: [u8; 3],
    upper: [u8; 3],
}

impl LabBounds {
    fn new(a: [f64; 3], b: [f64; 3]) -> Self {
        let (a, b) = (scale(a), scale(b));
        let mut lower = [0; 3];
        let mut upper = [0; 3];
        for i in 0..3 {
            lower[i] = a[i].min(b[i]);
            upper[i] = a[i].max(b[i]);
        }
        LabBounds { lower, upper }
    }

    fn contains(&self, px: [u8; 3]) -> bool {
        (0..3).all(|i| self.lower[i] <= px[i] && px[i] <= self.upper[i])
    }
}

/// One or two inclusive boxes in 8-bit CIELAB; a pixel matches if it lies in
/// either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorRange {
    bounds: Vec<LabBounds>,
}

impl ColorRange {
    pub fn from_config(config: &ColorRangeConfig) -> Self {
        let bounds = match *config {
            ColorRangeConfig::Single { lower, upper } => vec![LabBounds::new(lower, upper)],
            ColorRangeConfig::Wrapped {
                lower_0,
                upper_0,
                lower_1,
                upper_1,
            } => vec![
                LabBounds::new(lower_0, upper_0),
                LabBounds::new(lower_1, upper_1),
            ],
        };
        ColorRange { bounds }
    }

    pub fn contains(&self, lab: [u8; 3]) -> bool {
        self.bounds.iter().any(|b| b.contains(lab))
    }

    /// Binary mask (255 = match) over an image already converted to Lab.
    pub fn mask(&self, lab: &RgbImage) -> GrayImage {
        GrayImage::from_fn(lab.width(), lab.height(), |x, y| {
            if self.contains(lab.get_pixel(x, y).0) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn natural(lab: [u8; 3]) -> (f64, f64, f64) {
        (
            lab[0] as f64 / 2.55,
            lab[1] as f64 - 128.0,
            lab[2] as f64 - 128.0,
        )
    }

    #[test]
    fn primaries_land_near_reference_values() {
        let converter = LabConverter::new();

        let (l, a, b) = natural(converter.convert(Rgb([255, 0, 0])));
        assert!(
            (l - 53.2).abs() < 1.0 && (a - 80.1).abs() < 1.5 && (b - 67.2).abs() < 1.5,
            "{} {} {}",
            l,
            a,
            b
        );

        let (l, a, b) = natural(converter.convert(Rgb([255, 255, 255])));
        assert!((l - 100.0).abs() < 0.5 && a.abs() < 1.0 && b.abs() < 1.0, "{} {} {}", l, a, b);

        let (l, _, _) = natural(converter.convert(Rgb([0, 0, 0])));
        assert_eq!(l, 0.0);
    }

    #[test]
    fn wrapped_range_is_a_union() {
        let range = ColorRange::from_config(&ColorRangeConfig::Wrapped {
            lower_0: [0.0, 40.0, 0.0],
            upper_0: [100.0, 127.0, 127.0],
            lower_1: [0.0, 40.0, -127.0],
            upper_1: [100.0, 127.0, -60.0],
        });

        assert!(range.contains(scale([50.0, 80.0, 60.0])));
        assert!(range.contains(scale([50.0, 80.0, -90.0])));
        assert!(!range.contains(scale([50.0, 80.0, -30.0])));
        assert!(!range.contains(scale([50.0, 0.0, 60.0])));
    }

    #[test]
    fn reversed_bounds_are_normalized() {
        let range = ColorRange::from_config(&ColorRangeConfig::Single {
            lower: [80.0, 10.0, 10.0],
            upper: [20.0, -10.0, -10.0],
        });
        assert!(range.contains(scale([50.0, 0.0, 0.0])));
    }
}
