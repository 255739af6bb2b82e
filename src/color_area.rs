//! Average color of a marker region and the per-channel tolerance check.

use std::fmt;
use std::ops::Range;

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// A color with floating point channels in `0.0..=255.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Color {
    #[serde(rename = "R")]
    pub r: f64,
    #[serde(rename = "G")]
    pub g: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

impl Color {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    fn channels(&self) -> [f64; 3] {
        [self.r, self.g, self.b]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1})", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerShape {
    Ellipse = 0,
    Rectangle = 1,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown marker shape value {0}")]
pub struct UnknownMarkerShape(pub u32);

impl TryFrom<u32> for MarkerShape {
    type Error = UnknownMarkerShape;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MarkerShape::Ellipse),
            1 => Ok(MarkerShape::Rectangle),
            other => Err(UnknownMarkerShape(other)),
        }
    }
}

/// Requested marker placement in full-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionGeometry {
    pub center_x: u32,
    pub center_y: u32,
    pub width: u32,
    pub height: u32,
    pub shape: MarkerShape,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ColorAreaError {
    #[error("frame is {actual_width}x{actual_height} but the color area was set up for {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
}

/// Pixel window of the image that holds the marker, always inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropWindow {
    pub x: Range<u32>,
    pub y: Range<u32>,
}

impl CropWindow {
    fn clamped(geometry: &RegionGeometry, width: u32, height: u32) -> Self {
        fn axis(center: u32, extent: u32, limit: u32) -> Range<u32> {
            let center = i64::from(center);
            let half = i64::from(extent / 2);
            let limit = i64::from(limit);
            let start = (center - half).clamp(0, limit);
            let end = (center + half).clamp(start, limit);
            // Both ends are within 0..=limit, which came from a u32.
            start as u32..end as u32
        }
        Self {
            x: axis(geometry.center_x, geometry.width, width),
            y: axis(geometry.center_y, geometry.height, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.x.end - self.x.start
    }

    pub fn height(&self) -> u32 {
        self.y.end - self.y.start
    }
}

/// Evaluator for one marker configuration on frames of one size.
///
/// Built from a reference frame; any configuration change means building a
/// new one.
#[derive(Debug, Clone)]
pub struct ColorArea {
    geometry: RegionGeometry,
    crop: CropWindow,
    /// Row-major over the crop window.
    mask: Vec<bool>,
    mask_pixels: usize,
    image_width: u32,
    image_height: u32,
    color: Color,
    tolerance: u8,
}

impl ColorArea {
    pub fn new(reference: &RgbImage, geometry: RegionGeometry, color: Color, tolerance: u8) -> Self {
        let (image_width, image_height) = reference.dimensions();
        let crop = CropWindow::clamped(&geometry, image_width, image_height);
        let mask = rasterize_mask(&geometry, &crop);
        let mask_pixels = mask.iter().filter(|&&m| m).count();

        info!(
            "img size = {}x{}, marker size = {}x{} ({:?}), center = ({}, {}), color (R, G, B) = {}, tolerance = {}",
            image_width,
            image_height,
            geometry.width,
            geometry.height,
            geometry.shape,
            geometry.center_x,
            geometry.center_y,
            color,
            tolerance
        );

        Self {
            geometry,
            crop,
            mask,
            mask_pixels,
            image_width,
            image_height,
            color,
            tolerance,
        }
    }

    pub fn geometry(&self) -> &RegionGeometry {
        &self.geometry
    }

    pub fn crop(&self) -> &CropWindow {
        &self.crop
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn tolerance(&self) -> u8 {
        self.tolerance
    }

    /// Pixels of the crop window that take part in the average.
    pub fn mask_pixels(&self) -> usize {
        self.mask_pixels
    }

    fn check_dimensions(&self, img: &RgbImage) -> Result<(), ColorAreaError> {
        let (w, h) = img.dimensions();
        if (w, h) != (self.image_width, self.image_height) {
            return Err(ColorAreaError::DimensionMismatch {
                expected_width: self.image_width,
                expected_height: self.image_height,
                actual_width: w,
                actual_height: h,
            });
        }
        Ok(())
    }

    /// Mean color of the masked crop. An empty mask yields black.
    pub fn average_color(&self, img: &RgbImage) -> Result<Color, ColorAreaError> {
        self.check_dimensions(img)?;
        if self.mask_pixels == 0 {
            return Ok(Color::default());
        }

        let crop_w = self.crop.width() as usize;
        let mut sum = [0u64; 3];
        for (row, y) in self.crop.y.clone().enumerate() {
            let mask_row = &self.mask[row * crop_w..(row + 1) * crop_w];
            for (x, _) in self.crop.x.clone().zip(mask_row).filter(|&(_, &m)| m) {
                let px = img.get_pixel(x, y).0;
                for c in 0..3 {
                    sum[c] += u64::from(px[c]);
                }
            }
        }

        let n = self.mask_pixels as f64;
        Ok(Color::new(
            sum[0] as f64 / n,
            sum[1] as f64 / n,
            sum[2] as f64 / n,
        ))
    }

    pub fn is_within_tolerance(&self, img: &RgbImage) -> Result<bool, ColorAreaError> {
        let current = self.average_color(img)?;
        debug!(
            "Target/Current average color in region: {}/{}",
            self.color, current
        );
        Ok(within_tolerance(self.color, current, self.tolerance))
    }

    /// The crop window of `img`, for debug snapshots.
    pub fn crop_image(&self, img: &RgbImage) -> Result<RgbImage, ColorAreaError> {
        self.check_dimensions(img)?;
        Ok(image::imageops::crop_imm(
            img,
            self.crop.x.start,
            self.crop.y.start,
            self.crop.width(),
            self.crop.height(),
        )
        .to_image())
    }

    /// The mask as a white-on-black image.
    pub fn mask_image(&self) -> GrayImage {
        let w = self.crop.width();
        GrayImage::from_fn(w, self.crop.height(), |x, y| {
            let on = self.mask[(y * w + x) as usize];
            Luma([if on { 255 } else { 0 }])
        })
    }
}

/// True when every channel differs from the reference by strictly less than
/// `tolerance`.
pub fn within_tolerance(reference: Color, measured: Color, tolerance: u8) -> bool {
    let tolerance = f64::from(tolerance);
    reference
        .channels()
        .iter()
        .zip(measured.channels())
        .all(|(r, m)| (r - m).abs() < tolerance)
}

fn rasterize_mask(geometry: &RegionGeometry, crop: &CropWindow) -> Vec<bool> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    match geometry.shape {
        MarkerShape::Rectangle => vec![true; w * h],
        MarkerShape::Ellipse => {
            // Filled ellipse with half-axes of half the marker size; the extra
            // half pixel keeps the boundary row and column of the axes.
            let a = f64::from(geometry.width / 2) + 0.5;
            let b = f64::from(geometry.height / 2) + 0.5;
            let cx = f64::from(geometry.center_x);
            let cy = f64::from(geometry.center_y);
            let mut mask = Vec::with_capacity(w * h);
            for y in crop.y.clone() {
                let dy = (f64::from(y) - cy) / b;
                for x in crop.x.clone() {
                    let dx = (f64::from(x) - cx) / a;
                    mask.push(dx * dx + dy * dy <= 1.0);
                }
            }
            mask
        }
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn uniform(w: u32, h: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(rgb))
    }

    fn geometry(cx: u32, cy: u32, w: u32, h: u32, shape: MarkerShape) -> RegionGeometry {
        RegionGeometry {
            center_x: cx,
            center_y: cy,
            width: w,
            height: h,
            shape,
        }
    }

    #[test]
    fn crop_is_clamped_at_edges() {
        let img = uniform(100, 80, [0, 0, 0]);
        let area = ColorArea::new(&img, geometry(5, 78, 40, 30, MarkerShape::Rectangle), Color::default(), 10);
        assert_eq!(area.crop().x, 0..25);
        assert_eq!(area.crop().y, 63..80);

        let far = ColorArea::new(&img, geometry(500, 500, 40, 30, MarkerShape::Ellipse), Color::default(), 10);
        assert_eq!(far.crop().x, 100..100);
        assert_eq!(far.crop().y, 80..80);
        assert_eq!(far.mask_pixels(), 0);
        assert_eq!(far.average_color(&img).unwrap(), Color::default());
    }

    #[test]
    fn rectangle_averages_whole_crop() {
        let mut img = uniform(10, 10, [0, 0, 0]);
        // Left half of the crop red, right half blue
        for y in 3..7 {
            for x in 3..5 {
                img.put_pixel(x, y, Rgb([200, 0, 0]));
            }
            for x in 5..7 {
                img.put_pixel(x, y, Rgb([0, 0, 100]));
            }
        }
        let area = ColorArea::new(&img, geometry(5, 5, 4, 4, MarkerShape::Rectangle), Color::default(), 10);
        assert_eq!(area.mask_pixels(), 16);
        assert_eq!(area.average_color(&img).unwrap(), Color::new(100.0, 0.0, 50.0));
    }

    #[test]
    fn ellipse_ignores_corners() {
        let mut img = uniform(40, 40, [10, 20, 30]);
        // Paint the crop corners a wildly different color
        for (x, y) in [(10, 10), (29, 10), (10, 29), (29, 29)] {
            img.put_pixel(x, y, Rgb([255, 255, 255]));
        }
        let area = ColorArea::new(&img, geometry(20, 20, 20, 20, MarkerShape::Ellipse), Color::default(), 10);
        assert!(area.mask_pixels() < 400);
        assert!(area.mask_pixels() > 300);
        assert_eq!(area.average_color(&img).unwrap(), Color::new(10.0, 20.0, 30.0));

        let rect = ColorArea::new(&img, geometry(20, 20, 20, 20, MarkerShape::Rectangle), Color::default(), 10);
        assert_ne!(rect.average_color(&img).unwrap(), Color::new(10.0, 20.0, 30.0));
    }

    #[test]
    fn tolerance_is_strict_and_per_channel() {
        let reference = Color::new(100.0, 100.0, 100.0);
        assert!(within_tolerance(reference, Color::new(109.9, 90.1, 100.0), 10));
        // Exactly the tolerance is not a match
        assert!(!within_tolerance(reference, Color::new(110.0, 100.0, 100.0), 10));
        // One channel off is enough to fail, no matter how close the others are
        assert!(!within_tolerance(reference, Color::new(100.0, 100.0, 80.0), 10));
        // Zero tolerance never matches
        assert!(!within_tolerance(reference, reference, 0));
    }

    #[test]
    fn tolerance_is_symmetric_under_channel_permutation() {
        let reference = Color::new(10.0, 50.0, 90.0);
        let measured = Color::new(14.0, 43.0, 95.0);
        let permuted_ref = Color::new(reference.b, reference.r, reference.g);
        let permuted_measured = Color::new(measured.b, measured.r, measured.g);
        for tolerance in [5, 7, 8, 20] {
            assert_eq!(
                within_tolerance(reference, measured, tolerance),
                within_tolerance(permuted_ref, permuted_measured, tolerance)
            );
        }
    }

    #[test]
    fn mismatched_frame_size_is_detected() {
        let img = uniform(20, 20, [0, 0, 0]);
        let area = ColorArea::new(&img, geometry(10, 10, 4, 4, MarkerShape::Ellipse), Color::default(), 10);
        let other = uniform(21, 20, [0, 0, 0]);
        assert_eq!(
            area.is_within_tolerance(&other),
            Err(ColorAreaError::DimensionMismatch {
                expected_width: 20,
                expected_height: 20,
                actual_width: 21,
                actual_height: 20,
            })
        );
    }

    #[test]
    fn unknown_shape_values_are_rejected() {
        assert_eq!(MarkerShape::try_from(0), Ok(MarkerShape::Ellipse));
        assert_eq!(MarkerShape::try_from(1), Ok(MarkerShape::Rectangle));
        assert_eq!(MarkerShape::try_from(2), Err(UnknownMarkerShape(2)));
    }

    #[test]
    fn debug_images_match_crop() {
        let img = uniform(30, 30, [1, 2, 3]);
        let area = ColorArea::new(&img, geometry(15, 15, 10, 6, MarkerShape::Ellipse), Color::default(), 10);
        let crop = area.crop_image(&img).unwrap();
        let mask = area.mask_image();
        assert_eq!(crop.dimensions(), (10, 6));
        assert_eq!(mask.dimensions(), (10, 6));
        assert_eq!(mask.get_pixel(5, 3).0, [255]);
    }
}
