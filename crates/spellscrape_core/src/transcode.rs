use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::error::IngestError;

#[derive(Debug, Clone, Copy)]
pub struct TranscodeOptions {
    pub source: ImageFormat,
    pub target: ImageFormat,
    /// Opaque colour translucent pixels are composited onto.
    pub background: [u8; 3],
}

#[derive(Debug, Clone)]
pub struct TranscodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode `bytes` as `options.source`, drop the alpha channel and encode as
/// `options.target`.
///
/// Alpha is removed by alpha-blending every pixel over `options.background`.
/// This is lossy for translucent pixels: the original transparency cannot be
/// recovered from the output.
pub fn transcode(
    bytes: &[u8],
    options: &TranscodeOptions,
) -> Result<TranscodedImage, IngestError> {
    let decoded =
        image::load_from_memory_with_format(bytes, options.source).map_err(IngestError::Decode)?;
    let flattened = flatten_alpha(&decoded, options.background);
    let (width, height) = flattened.dimensions();

    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(flattened)
        .write_to(&mut cursor, options.target)
        .map_err(IngestError::Encode)?;

    Ok(TranscodedImage {
        bytes: cursor.into_inner(),
        width,
        height,
    })
}

fn flatten_alpha(image: &DynamicImage, background: [u8; 3]) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut output = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [red, green, blue, alpha] = pixel.0;
        output.put_pixel(
            x,
            y,
            Rgb([
                blend(red, background[0], alpha),
                blend(green, background[1], alpha),
                blend(blue, background[2], alpha),
            ]),
        );
    }
    output
}

fn blend(foreground: u8, background: u8, alpha: u8) -> u8 {
    let alpha = u32::from(alpha);
    let mixed = u32::from(foreground) * alpha + u32::from(background) * (255 - alpha);
    ((mixed + 127) / 255) as u8
}
