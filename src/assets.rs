use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::{error::BackdropResult, frame::FrameRgba};

/// Root of the static background asset tree.
pub const BACKGROUNDS_DIR: &str = "backgrounds";

/// The bundled background image set, addressed relative to
/// [`BACKGROUNDS_DIR`].
pub fn background_image_paths() -> Vec<PathBuf> {
    [
        "architecture-5082700_1280",
        "porch-691330_1280",
        "saxon-switzerland-539418_1280",
        "shibuyasky-4768679_1280",
    ]
    .iter()
    .map(|name| Path::new(BACKGROUNDS_DIR).join(format!("{name}.jpg")))
    .collect()
}

/// A decoded background still, ready to composite.
#[derive(Clone, Debug)]
pub struct BackgroundImage {
    pub width: u32,
    pub height: u32,
    pub pixels: FrameRgba,
}

impl BackgroundImage {
    pub fn from_frame(pixels: FrameRgba) -> Self {
        Self {
            width: pixels.width,
            height: pixels.height,
            pixels,
        }
    }
}

/// Decode an encoded image (PNG/JPEG/...) into a premultiplied background.
pub fn decode_background(bytes: &[u8]) -> BackdropResult<BackgroundImage> {
    let dyn_img = image::load_from_memory(bytes).context("decode background image")?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let mut data = rgba.into_raw();
    premultiply_rgba8_in_place(&mut data);

    Ok(BackgroundImage {
        width,
        height,
        pixels: FrameRgba::from_data(width, height, data)?,
    })
}

/// Load and decode a background asset from disk.
pub fn load_background(path: &Path) -> BackdropResult<BackgroundImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read background '{}'", path.display()))?;
    decode_background(&bytes)
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn background_paths_are_fixed_and_jpg() {
        let paths = background_image_paths();
        assert_eq!(paths.len(), 4);
        for p in paths {
            assert!(p.starts_with(BACKGROUNDS_DIR));
            assert_eq!(p.extension().unwrap(), "jpg");
        }
    }

    #[test]
    fn decode_background_png_dimensions_and_premul() {
        let src_rgba = vec![100u8, 50u8, 200u8, 128u8];
        let img = image::RgbaImage::from_raw(1, 1, src_rgba).unwrap();

        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();

        let bg = decode_background(&buf).unwrap();
        assert_eq!((bg.width, bg.height), (1, 1));
        assert_eq!(
            bg.pixels.data.as_slice(),
            &[
                ((100u16 * 128 + 127) / 255) as u8,
                ((50u16 * 128 + 127) / 255) as u8,
                ((200u16 * 128 + 127) / 255) as u8,
                128u8
            ]
        );
    }

    #[test]
    fn decode_background_rejects_garbage() {
        assert!(decode_background(b"not an image").is_err());
    }
}
