use image::RgbImage;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};
use thiserror::Error;

use super::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame payload too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("{format:?} needs even dimensions, got {width}x{height}")]
    OddDimensions {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("jpeg stream carries no image header")]
    MissingJpegInfo,
    #[error("unsupported jpeg layout {format:?} ({width}x{height}) for a {expected_width}x{expected_height} stream")]
    UnsupportedJpeg {
        format: JpegPixelFormat,
        width: u16,
        height: u16,
        expected_width: u32,
        expected_height: u32,
    },
}

pub fn decode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage, DecodeError> {
    match format {
        PixelFormat::Rgb24 => {
            // Already in RGB format
            let raw = expect_len(data, format.frame_size(width, height))?;
            from_raw(width, height, raw.to_vec())
        }
        PixelFormat::Bgr24 => {
            let raw = expect_len(data, format.frame_size(width, height))?;
            let mut rgb = raw.to_vec();
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            from_raw(width, height, rgb)
        }
        PixelFormat::Yuyv4 => {
            // Two pixels share one chroma pair
            expect_even(format, width, height, width % 2 == 0)?;
            let raw = expect_len(data, format.frame_size(width, height))?;
            yuyv_to_rgb(raw, width, height)
        }
        PixelFormat::Nv12 => {
            // 2x2 blocks share one chroma pair
            expect_even(format, width, height, width % 2 == 0 && height % 2 == 0)?;
            let raw = expect_len(data, format.frame_size(width, height))?;
            nv12_to_rgb(raw, width, height)
        }
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder.decode()?;
            let info = decoder.info().ok_or(DecodeError::MissingJpegInfo)?;
            let unsupported = DecodeError::UnsupportedJpeg {
                format: info.pixel_format,
                width: info.width,
                height: info.height,
                expected_width: width,
                expected_height: height,
            };
            if u32::from(info.width) != width || u32::from(info.height) != height {
                return Err(unsupported);
            }
            match info.pixel_format {
                JpegPixelFormat::RGB24 => from_raw(width, height, pixels),
                JpegPixelFormat::L8 => from_raw(
                    width,
                    height,
                    pixels.iter().flat_map(|&l| [l, l, l]).collect(),
                ),
                _ => Err(unsupported),
            }
        }
    }
}

fn expect_len(data: &[u8], expected: usize) -> Result<&[u8], DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(&data[..expected])
}

fn expect_even(format: PixelFormat, width: u32, height: u32, even: bool) -> Result<(), DecodeError> {
    if even {
        Ok(())
    } else {
        Err(DecodeError::OddDimensions {
            format,
            width,
            height,
        })
    }
}

fn from_raw(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, DecodeError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(DecodeError::Truncated {
        expected: width as usize * height as usize * 3,
        actual,
    })
}

/// BT.601 full-range YCbCr to RGB.
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

/// Inverse of [`yuv_to_rgb`], used by the synthetic source to paint YUV frames.
pub fn rgb_to_yuv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(f32::from);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    [clamp_u8(y), clamp_u8(u), clamp_u8(v)]
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, DecodeError> {
    let w = width as usize;
    let h = height as usize;
    let (luma, chroma) = data.split_at(w * h);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let uv_row = &chroma[(row / 2) * w..];
        for col in 0..w {
            let uv = (col / 2) * 2;
            rgb.extend_from_slice(&yuv_to_rgb(luma[row * w + col], uv_row[uv], uv_row[uv + 1]));
        }
    }
    from_raw(width, height, rgb)
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, DecodeError> {
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for quad in data.chunks_exact(4) {
        let [y0, u, y1, v] = [quad[0], quad[1], quad[2], quad[3]];
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    from_raw(width, height, rgb)
}
