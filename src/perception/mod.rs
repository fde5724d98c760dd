//! Color and shape segmentation of camera frames.

use std::fmt;

use anyhow::bail;
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_cross_mut, draw_hollow_rect_mut},
    filter::filter3x3,
    rect::Rect,
};
use serde::{Deserialize, Serialize};

use crate::{config::VisionConfig, geometry::PixelPoint};

mod color;
mod contour;
mod shape;

pub use color::*;
pub use contour::*;
pub use shape::*;

/// Blur applied to color masks before thresholding.
const COLOR_BLUR: f32 = 1.1;

const LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];

/// Name of a configured marker color.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorName(pub String);

impl fmt::Display for ColorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ColorName {
    fn from(s: &str) -> Self {
        ColorName(s.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub color: ColorName,
    pub shape: Option<Shape>,
    pub center: PixelPoint,
    pub contour: Vec<PixelPoint>,
    pub bbox: BoundingBox,
    pub local_id: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_corners: Option<[PixelPoint; 3]>,
}

/// Per-color masks for one frame plus the shape outline mask.
pub struct Segmentation {
    pub colors: Vec<(ColorName, GrayImage)>,
    pub shapes: GrayImage,
}

/// Laplacian variance of the grayscale frame; higher is sharper.
pub fn quality(frame: &RgbImage) -> f64 {
    let gray = imageops::grayscale(frame);
    let response = filter3x3::<Luma<u8>, f32, f32>(&gray, &LAPLACIAN);

    let n = response.pixels().len();
    if n == 0 {
        return 0.0;
    }

    let values = response.pixels().map(|p| p.0[0] as f64);
    let mean = values.clone().sum::<f64>() / n as f64;
    values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

/// Validated detection settings. Built once at startup and shared read-only.
#[derive(Clone)]
pub struct Perception {
    lab: LabConverter,
    colors: Vec<(ColorName, ColorRange)>,
    shape_range: ColorRange,
    shape_inverted: bool,
    min_diagonal: f64,
    min_diagonal_shape: f64,
    min_diagonal_code_element: f64,
    quality_threshold: f64,
}

impl Perception {
    pub fn from_config(config: &VisionConfig) -> anyhow::Result<Self> {
        let mut colors: Vec<(ColorName, ColorRange)> = Vec::with_capacity(config.colors.len());

        for c in &config.colors {
            if c.name.is_empty() {
                bail!("color names must not be empty");
            }
            if colors.iter().any(|(name, _)| name.0 == c.name) {
                bail!("color {} is configured twice", c.name);
            }
            colors.push((ColorName(c.name.clone()), ColorRange::from_config(&c.range)));
        }

        if config.min_diagonal < 0.0
            || config.min_diagonal_shape < 0.0
            || config.min_diagonal_code_element < 0.0
        {
            bail!("minimum diagonals must not be negative");
        }

        Ok(Perception {
            lab: LabConverter::new(),
            colors,
            shape_range: ColorRange::from_config(&config.shape_color),
            shape_inverted: config.shape_inverted,
            min_diagonal: config.min_diagonal,
            min_diagonal_shape: config.min_diagonal_shape,
            min_diagonal_code_element: config.min_diagonal_code_element,
            quality_threshold: config.quality_threshold,
        })
    }

    pub fn passes_quality(&self, quality: f64) -> bool {
        quality >= self.quality_threshold
    }

    pub fn colors(&self) -> impl Iterator<Item = &ColorName> {
        self.colors.iter().map(|(name, _)| name)
    }

    fn shape_mask(&self, frame: &RgbImage, lab: &RgbImage) -> GrayImage {
        if self.shape_inverted {
            let mut inverted = frame.clone();
            imageops::invert(&mut inverted);
            self.shape_range.mask(&self.lab.convert_image(&inverted))
        } else {
            self.shape_range.mask(lab)
        }
    }

    /// Masks for `only` (or every configured color) and the shape mask.
    pub fn segment(&self, frame: &RgbImage, only: Option<&ColorName>) -> Segmentation {
        let lab = self.lab.convert_image(frame);

        let colors = self
            .colors
            .iter()
            .filter(|(name, _)| only.map_or(true, |o| o == name))
            .map(|(name, range)| (name.clone(), range.mask(&lab)))
            .collect();

        Segmentation {
            colors,
            shapes: self.shape_mask(frame, &lab),
        }
    }

    /// Quadrilateral markers of one color. `local_id`s continue from
    /// `first_id`.
    pub fn detect(
        &self,
        color: &ColorName,
        mask: &GrayImage,
        first_id: usize,
    ) -> Vec<DetectedObject> {
        outlines(mask, COLOR_BLUR, (0, 0))
            .into_iter()
            .filter(|o| o.bbox.diagonal() >= self.min_diagonal)
            .filter(|o| o.vertices() == 4)
            .enumerate()
            .map(|(i, o)| DetectedObject {
                color: color.clone(),
                shape: None,
                center: o.bbox.center(),
                contour: o.polygon,
                bbox: o.bbox,
                local_id: first_id + i,
                geolocation: None,
                code_corners: None,
            })
            .collect()
    }

    pub fn classify_shape(&self, object: &DetectedObject, shape_mask: &GrayImage) -> Option<Shape> {
        classify_shape(&object.bbox, shape_mask, self.min_diagonal_shape)
    }

    pub fn classify_fiducial(
        &self,
        object: &DetectedObject,
        shape_mask: &GrayImage,
    ) -> Option<[PixelPoint; 3]> {
        classify_fiducial(&object.bbox, shape_mask, self.min_diagonal_code_element)
    }

    /// Every marker in the frame with its shape classified.
    pub fn analyze(&self, frame: &RgbImage) -> Vec<DetectedObject> {
        let segmentation = self.segment(frame, None);
        let mut objects = Vec::new();

        for (color, mask) in &segmentation.colors {
            let mut found = self.detect(color, mask, objects.len());
            for object in &mut found {
                object.shape = self.classify_shape(object, &segmentation.shapes);
            }
            objects.extend(found);
        }

        objects
    }

    /// The marker of `color` nearest the image center, optionally restricted
    /// to a shape. Code markers get their element centers attached.
    pub fn find_closest(
        &self,
        frame: &RgbImage,
        color: &ColorName,
        target: Option<TargetShape>,
    ) -> Option<DetectedObject> {
        let segmentation = self.segment(frame, Some(color));
        let (_, mask) = segmentation.colors.first()?;

        let center = PixelPoint::new(frame.width() as f64 / 2.0, frame.height() as f64 / 2.0);
        let distance =
            |o: &DetectedObject| (o.center.x - center.x).powi(2) + (o.center.y - center.y).powi(2);

        self.detect(color, mask, 0)
            .into_iter()
            .filter_map(|mut object| match target {
                None => Some(object),
                Some(TargetShape::Code) => {
                    let corners = self.classify_fiducial(&object, &segmentation.shapes)?;
                    object.code_corners = Some(corners);
                    Some(object)
                }
                Some(target) => {
                    object.shape = self.classify_shape(&object, &segmentation.shapes);
                    (object.shape == target.shape()).then(|| object)
                }
            })
            .min_by(|a, b| distance(a).total_cmp(&distance(b)))
    }
}

/// Copy of the frame with detection boxes and centers drawn in.
pub fn annotate(frame: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
    let mut annotated = frame.clone();

    for object in objects {
        let b = object.bbox;
        let rect = Rect::at(b.x as i32, b.y as i32).of_size(b.width.max(1), b.height.max(1));
        draw_hollow_rect_mut(&mut annotated, rect, Rgb([0, 255, 0]));
        draw_cross_mut(
            &mut annotated,
            Rgb([255, 0, 255]),
            object.center.x as i32,
            object.center.y as i32,
        );
    }

    annotated
}
