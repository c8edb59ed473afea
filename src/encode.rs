//! Pixel format conversion and still-image encoding.
//!
//! Renderers hand us premultiplied BGRA. PNG wants straight-alpha RGBA, so
//! image-mode capture unpremultiplies on the way out; the CDP backend goes the
//! other direction when it turns screenshots into paint buffers.

use crate::Result;

/// Convert premultiplied BGRA into straight-alpha RGBA, reusing `dst`.
pub fn bgra_premultiplied_to_rgba(src: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    dst.reserve(src.len());
    for px in src.chunks_exact(4) {
        let (b, g, r, a) = (px[0], px[1], px[2], px[3]);
        match a {
            0 => dst.extend_from_slice(&[0, 0, 0, 0]),
            255 => dst.extend_from_slice(&[r, g, b, 255]),
            _ => dst.extend_from_slice(&[unpremultiply(r, a), unpremultiply(g, a), unpremultiply(b, a), a]),
        }
    }
}

#[inline]
fn unpremultiply(c: u8, a: u8) -> u8 {
    let v = (c as u32 * 255 + a as u32 / 2) / a as u32;
    v.min(255) as u8
}

#[inline]
fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u32 * a as u32 + 127) / 255) as u8
}

/// Encode one premultiplied BGRA frame as an 8-bit RGBA PNG.
pub fn encode_png(bgra: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * 4;
    if bgra.len() != expected {
        return Err(crate::Error::EncodeError(format!(
            "expected {} bytes for {}x{}, got {}",
            expected,
            width,
            height,
            bgra.len()
        )));
    }

    let mut rgba = Vec::new();
    bgra_premultiplied_to_rgba(bgra, &mut rgba);

    let mut out = Vec::with_capacity(expected / 2);
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        // runs on the render thread
        encoder.set_compression(png::Compression::Fast);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&rgba)?;
        writer.finish()?;
    }
    Ok(out)
}

/// Decode a PNG into premultiplied BGRA. Returns `(pixels, width, height)`.
pub fn decode_png_to_bgra(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let mut decoder = png::Decoder::new(std::io::Cursor::new(data));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info()?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf)?;
    let pixels = &buf[..info.buffer_size()];

    let mut bgra = Vec::with_capacity(info.width as usize * info.height as usize * 4);
    match info.color_type {
        png::ColorType::Rgba => {
            for px in pixels.chunks_exact(4) {
                let a = px[3];
                bgra.extend_from_slice(&[premultiply(px[2], a), premultiply(px[1], a), premultiply(px[0], a), a]);
            }
        }
        png::ColorType::Rgb => {
            for px in pixels.chunks_exact(3) {
                bgra.extend_from_slice(&[px[2], px[1], px[0], 255]);
            }
        }
        png::ColorType::GrayscaleAlpha => {
            for px in pixels.chunks_exact(2) {
                let v = premultiply(px[0], px[1]);
                bgra.extend_from_slice(&[v, v, v, px[1]]);
            }
        }
        png::ColorType::Grayscale => {
            for &v in pixels {
                bgra.extend_from_slice(&[v, v, v, 255]);
            }
        }
        other => {
            return Err(crate::Error::EncodeError(format!("unsupported PNG color type {:?}", other)));
        }
    }

    Ok((bgra, info.width, info.height))
}
