//! Joint image/mask augmentation.
//!
//! Geometric transforms move the image and every class mask together and run
//! on 8-bit pixels; photometric transforms touch the image only and run on
//! the `[0, 1]` float planes afterwards.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::rngs::StdRng;
use rand::Rng;
use xray_core::{AugmentSettings, Error, Result};

/// Image and class masks before conversion to floats
#[derive(Debug, Clone)]
pub struct RawSample {
    pub image: RgbImage,
    pub masks: Vec<GrayImage>,
}

/// Transform that moves pixels
#[derive(Debug, Clone, PartialEq)]
pub enum Geometric {
    HorizontalFlip { p: f64 },
    /// Rotation by a uniform angle in `[-limit, limit]` degrees
    Rotate { limit: f32, p: f64 },
}

impl Geometric {
    fn probability(&self) -> f64 {
        match self {
            Geometric::HorizontalFlip { p } | Geometric::Rotate { p, .. } => *p,
        }
    }

    fn apply(&self, sample: &mut RawSample, rng: &mut StdRng) {
        if !rng.random_bool(self.probability()) {
            return;
        }
        match *self {
            Geometric::HorizontalFlip { .. } => {
                image::imageops::flip_horizontal_in_place(&mut sample.image);
                for mask in &mut sample.masks {
                    image::imageops::flip_horizontal_in_place(mask);
                }
            }
            Geometric::Rotate { limit, .. } => {
                let degrees = if limit > 0.0 {
                    rng.random_range(-limit..=limit)
                } else {
                    0.0
                };
                let theta = degrees.to_radians();
                sample.image =
                    rotate_about_center(&sample.image, theta, Interpolation::Bilinear, Rgb([0, 0, 0]));
                for mask in &mut sample.masks {
                    *mask = rotate_about_center(mask, theta, Interpolation::Nearest, Luma([0]));
                }
            }
        }
    }
}

/// Transform that changes intensities only
#[derive(Debug, Clone, PartialEq)]
pub enum Photometric {
    /// `img · (1 + c) + b · mean(img)`, `c ∈ [-contrast, contrast]`,
    /// `b ∈ [-brightness, brightness]`, clamped to `[0, 1]`
    BrightnessContrast {
        brightness_limit: f32,
        contrast_limit: f32,
        p: f64,
    },
}

impl Photometric {
    fn apply(&self, pixels: &mut [f32], rng: &mut StdRng) {
        let Photometric::BrightnessContrast {
            brightness_limit,
            contrast_limit,
            p,
        } = *self;
        if !rng.random_bool(p) || pixels.is_empty() {
            return;
        }

        let alpha = 1.0 + symmetric(rng, contrast_limit);
        let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
        let beta = symmetric(rng, brightness_limit) * mean;

        for v in pixels.iter_mut() {
            *v = (*v * alpha + beta).clamp(0.0, 1.0);
        }
    }
}

fn symmetric(rng: &mut StdRng, limit: f32) -> f32 {
    if limit > 0.0 {
        rng.random_range(-limit..=limit)
    } else {
        0.0
    }
}

/// Ordered augmentation pipeline: geometric transforms, then photometric ones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Augmentation {
    geometric: Vec<Geometric>,
    photometric: Vec<Photometric>,
}

impl Augmentation {
    pub fn new(geometric: Vec<Geometric>, photometric: Vec<Photometric>) -> Result<Self> {
        let probabilities = geometric
            .iter()
            .map(Geometric::probability)
            .chain(photometric.iter().map(|t| match t {
                Photometric::BrightnessContrast { p, .. } => *p,
            }));
        for p in probabilities {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Config(format!(
                    "augmentation probability {p} outside [0, 1]"
                )));
            }
        }

        Ok(Self {
            geometric,
            photometric,
        })
    }

    /// Rotate, flip, then brightness/contrast, as configured
    pub fn from_settings(settings: &AugmentSettings) -> Result<Self> {
        Self::new(
            vec![
                Geometric::Rotate {
                    limit: settings.rotate_limit,
                    p: settings.rotate_p,
                },
                Geometric::HorizontalFlip {
                    p: settings.horizontal_flip_p,
                },
            ],
            vec![Photometric::BrightnessContrast {
                brightness_limit: settings.brightness_limit,
                contrast_limit: settings.contrast_limit,
                p: settings.brightness_contrast_p,
            }],
        )
    }

    pub fn apply_geometric(&self, sample: &mut RawSample, rng: &mut StdRng) {
        for t in &self.geometric {
            t.apply(sample, rng);
        }
    }

    /// `pixels` holds the image planes scaled to `[0, 1]`
    pub fn apply_photometric(&self, pixels: &mut [f32], rng: &mut StdRng) {
        for t in &self.photometric {
            t.apply(pixels, rng);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.geometric.is_empty() && self.photometric.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample() -> RawSample {
        let mut image = RgbImage::new(8, 8);
        image.put_pixel(0, 3, Rgb([200, 100, 50]));
        let mut mask = GrayImage::new(8, 8);
        mask.put_pixel(0, 3, Luma([1]));
        RawSample {
            image,
            masks: vec![mask],
        }
    }

    #[test]
    fn test_flip_moves_image_and_masks_together() -> Result<()> {
        let aug = Augmentation::new(vec![Geometric::HorizontalFlip { p: 1.0 }], vec![])?;
        let mut s = sample();
        aug.apply_geometric(&mut s, &mut StdRng::seed_from_u64(0));

        assert_eq!(s.image.get_pixel(7, 3).0, [200, 100, 50]);
        assert_eq!(s.masks[0].get_pixel(7, 3).0, [1]);
        assert_eq!(s.masks[0].get_pixel(0, 3).0, [0]);
        Ok(())
    }

    #[test]
    fn test_rotation_keeps_masks_binary() -> Result<()> {
        let aug = Augmentation::new(vec![Geometric::Rotate { limit: 14.0, p: 1.0 }], vec![])?;
        let mut s = sample();
        for x in 2..6 {
            for y in 2..6 {
                s.masks[0].put_pixel(x, y, Luma([1]));
            }
        }
        aug.apply_geometric(&mut s, &mut StdRng::seed_from_u64(3));

        assert_eq!(s.image.dimensions(), (8, 8));
        assert!(s.masks[0].pixels().all(|p| p.0[0] <= 1));
        Ok(())
    }

    #[test]
    fn test_zero_probability_is_identity() -> Result<()> {
        let aug = Augmentation::new(
            vec![
                Geometric::HorizontalFlip { p: 0.0 },
                Geometric::Rotate { limit: 30.0, p: 0.0 },
            ],
            vec![],
        )?;
        let mut s = sample();
        let before = s.clone();
        aug.apply_geometric(&mut s, &mut StdRng::seed_from_u64(1));
        assert_eq!(s.image, before.image);
        assert_eq!(s.masks, before.masks);
        Ok(())
    }

    #[test]
    fn test_brightness_contrast_stays_in_unit_range() -> Result<()> {
        let aug = Augmentation::new(
            vec![],
            vec![Photometric::BrightnessContrast {
                brightness_limit: 0.9,
                contrast_limit: 0.9,
                p: 1.0,
            }],
        )?;
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let mut pixels: Vec<f32> = (0..64).map(|i| i as f32 / 63.0).collect();
            aug.apply_photometric(&mut pixels, &mut rng);
            assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
        }
        Ok(())
    }

    #[test]
    fn test_invalid_probability_is_rejected() {
        let err = Augmentation::new(vec![Geometric::HorizontalFlip { p: 1.5 }], vec![]);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_default_settings() -> Result<()> {
        let aug = Augmentation::from_settings(&AugmentSettings::default())?;
        assert!(!aug.is_empty());
        Ok(())
    }
}
