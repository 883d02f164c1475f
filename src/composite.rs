use crate::{
    config::BlendMode,
    error::{BackdropError, BackdropResult},
};

pub type PremulRgba8 = [u8; 4];

/// Opaque green written over cutout pixels by the color-substitution
/// treatment.
pub const SUBSTITUTION_GREEN: PremulRgba8 = [0, 255, 0, 255];

/// Porter-Duff `src over dst` on premultiplied RGBA8.
pub fn over(dst: PremulRgba8, src: PremulRgba8) -> PremulRgba8 {
    if src[3] == 255 {
        return src;
    }
    if src[3] == 0 {
        return dst;
    }
    let inv = 255u16 - u16::from(src[3]);
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = src[i].saturating_add(mul_div255(u16::from(dst[i]), inv));
    }
    out
}

/// Foreground extraction: multiply every channel of `src` by the mask
/// alpha, writing into `dst`. This is the "draw the mask, then intersect
/// the source draw with the existing alpha" step collapsed into one pass:
/// only pixels where the mask alpha is nonzero survive, feathered edges
/// come out partially transparent.
pub fn clip_to_mask(src: &[u8], alpha: &[u8], dst: &mut [u8]) -> BackdropResult<()> {
    if src.len() != alpha.len() * 4 || dst.len() != src.len() {
        return Err(BackdropError::render(
            "mask clip requires rgba buffers matching the alpha plane",
        ));
    }
    for ((out, px), &a) in dst
        .chunks_exact_mut(4)
        .zip(src.chunks_exact(4))
        .zip(alpha.iter())
    {
        let a16 = u16::from(a);
        for c in 0..4 {
            out[c] = mul_div255(u16::from(px[c]), a16);
        }
    }
    Ok(())
}

/// Destination-over: compose `bg` *behind* the already-drawn `canvas`.
pub fn under_in_place(canvas: &mut [u8], bg: &[u8]) -> BackdropResult<()> {
    if canvas.len() != bg.len() || !canvas.len().is_multiple_of(4) {
        return Err(BackdropError::render(
            "destination-over expects equal-length rgba8 buffers",
        ));
    }
    for (d, s) in canvas.chunks_exact_mut(4).zip(bg.chunks_exact(4)) {
        let out = over([s[0], s[1], s[2], s[3]], [d[0], d[1], d[2], d[3]]);
        d.copy_from_slice(&out);
    }
    Ok(())
}

/// Color substitution (greenscreen output): explicit per-pixel scan of the
/// composited frame. A pixel is replaced with opaque green iff all of
/// R, G, B and A equal the cutout sentinel (zero); every other pixel
/// passes through untouched.
pub fn substitute_cutout_in_place(canvas: &mut [u8]) -> BackdropResult<()> {
    if !canvas.len().is_multiple_of(4) {
        return Err(BackdropError::render(
            "substitution expects an rgba8 buffer",
        ));
    }
    for px in canvas.chunks_exact_mut(4) {
        if px[0] == 0 && px[1] == 0 && px[2] == 0 && px[3] == 0 {
            px.copy_from_slice(&SUBSTITUTION_GREEN);
        }
    }
    Ok(())
}

/// Light wrap: fold a fraction of the background color into foreground
/// edge pixels. Only the partially-covered edge band (0 < mask alpha
/// < 255) is touched; the wrap strength scales with how thin the
/// foreground coverage is at that pixel.
pub fn light_wrap_in_place(
    canvas: &mut [u8],
    bg: &[u8],
    alpha: &[u8],
    amount: f32,
    mode: BlendMode,
) -> BackdropResult<()> {
    if canvas.len() != bg.len() || canvas.len() != alpha.len() * 4 {
        return Err(BackdropError::render(
            "light wrap requires rgba buffers matching the alpha plane",
        ));
    }
    let amount = amount.clamp(0.0, 1.0);
    if amount == 0.0 {
        return Ok(());
    }

    for ((px, b), &a) in canvas
        .chunks_exact_mut(4)
        .zip(bg.chunks_exact(4))
        .zip(alpha.iter())
    {
        if a == 0 || a == 255 {
            continue;
        }
        let wrap = amount * (1.0 - (a as f32) / 255.0);
        let t = ((wrap * 255.0).round() as i32).clamp(0, 255) as u16;
        let it = 255 - t;
        for c in 0..3 {
            let wrapped = match mode {
                BlendMode::Screen => screen(px[c], b[c]),
                BlendMode::Linear => px[c].saturating_add(b[c]),
            };
            px[c] = mul_div255(u16::from(px[c]), it)
                .saturating_add(mul_div255(u16::from(wrapped), t));
        }
    }
    Ok(())
}

fn screen(a: u8, b: u8) -> u8 {
    255 - mul_div255(u16::from(255 - a), u16::from(255 - b))
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}
