use crate::error::{BackdropError, BackdropResult};

/// Separable Gaussian kernel in Q16 fixed point, normalized so the
/// weights sum to exactly 65536.
pub fn gaussian_kernel_q16(radius: u32, sigma: f32) -> BackdropResult<Vec<u32>> {
    if radius == 0 {
        return Ok(vec![1 << 16]);
    }
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(BackdropError::configuration("blur sigma must be > 0"));
    }

    let r = radius as i32;
    let mut weights_f = Vec::<f64>::with_capacity((2 * r + 1) as usize);
    let mut sum = 0.0f64;
    let sigma = sigma as f64;
    let denom = 2.0 * sigma * sigma;
    for i in -r..=r {
        let x = i as f64;
        let w = (-x * x / denom).exp();
        weights_f.push(w);
        sum += w;
    }

    let mut weights = Vec::<u32>::with_capacity(weights_f.len());
    let mut acc: i64 = 0;
    for &wf in &weights_f {
        let q = ((wf / sum) * 65536.0).round() as i64;
        let q = q.clamp(0, 65536);
        weights.push(q as u32);
        acc += q;
    }
    // Fold rounding error into the center tap so the kernel stays
    // normalization-exact.
    let delta = 65536i64 - acc;
    if delta != 0 {
        let mid = weights.len() / 2;
        let new_mid = (i64::from(weights[mid]) + delta).clamp(0, 65536);
        weights[mid] = new_mid as u32;
    }

    Ok(weights)
}

/// Two-pass Gaussian blur over a premultiplied RGBA8 buffer.
///
/// `tmp` is caller-owned scratch of the same length, so per-frame calls
/// allocate nothing.
pub fn blur_rgba_premul(
    src: &[u8],
    dst: &mut [u8],
    tmp: &mut [u8],
    width: u32,
    height: u32,
    kernel: &[u32],
) -> BackdropResult<()> {
    let expected = checked_len(width, height, 4)?;
    if src.len() != expected || dst.len() != expected || tmp.len() != expected {
        return Err(BackdropError::render(
            "blur buffers must all match width*height*4",
        ));
    }
    if kernel.len() == 1 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    horizontal_pass::<4>(src, tmp, width, height, kernel);
    vertical_pass::<4>(tmp, dst, width, height, kernel);
    Ok(())
}

/// Two-pass Gaussian blur over a single-channel plane (mask feathering).
pub fn blur_plane(
    src: &[u8],
    dst: &mut [u8],
    tmp: &mut [u8],
    width: u32,
    height: u32,
    kernel: &[u32],
) -> BackdropResult<()> {
    let expected = checked_len(width, height, 1)?;
    if src.len() != expected || dst.len() != expected || tmp.len() != expected {
        return Err(BackdropError::render(
            "plane blur buffers must all match width*height",
        ));
    }
    if kernel.len() == 1 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    horizontal_pass::<1>(src, tmp, width, height, kernel);
    vertical_pass::<1>(tmp, dst, width, height, kernel);
    Ok(())
}

fn checked_len(width: u32, height: u32, channels: usize) -> BackdropResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels))
        .ok_or_else(|| BackdropError::render("blur buffer size overflow"))
}

fn horizontal_pass<const C: usize>(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[u32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    for y in 0..height as i32 {
        for x in 0..w {
            let mut acc = [0u64; C];
            for (ki, &kw) in k.iter().enumerate() {
                let dx = ki as i32 - radius;
                let sx = (x + dx).clamp(0, w - 1);
                let idx = ((y * w + sx) as usize) * C;
                for c in 0..C {
                    acc[c] += (kw as u64) * (src[idx + c] as u64);
                }
            }
            let out_idx = ((y * w + x) as usize) * C;
            for c in 0..C {
                dst[out_idx + c] = q16_to_u8(acc[c]);
            }
        }
    }
}

fn vertical_pass<const C: usize>(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[u32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    let h = height as i32;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0u64; C];
            for (ki, &kw) in k.iter().enumerate() {
                let dy = ki as i32 - radius;
                let sy = (y + dy).clamp(0, h - 1);
                let idx = ((sy * w + x) as usize) * C;
                for c in 0..C {
                    acc[c] += (kw as u64) * (src[idx + c] as u64);
                }
            }
            let out_idx = ((y * w + x) as usize) * C;
            for c in 0..C {
                dst[out_idx + c] = q16_to_u8(acc[c]);
            }
        }
    }
}

fn q16_to_u8(acc: u64) -> u8 {
    let v = (acc + 32768) >> 16;
    (v.min(255)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel_q16(8, 4.0).unwrap();
        assert_eq!(k.len(), 17);
        assert_eq!(k.iter().map(|&w| w as u64).sum::<u64>(), 65536);
        for i in 0..k.len() / 2 {
            assert_eq!(k[i], k[k.len() - 1 - i]);
        }
    }

    #[test]
    fn kernel_rejects_bad_sigma() {
        assert!(gaussian_kernel_q16(4, 0.0).is_err());
        assert!(gaussian_kernel_q16(4, f32::NAN).is_err());
    }

    #[test]
    fn radius_0_is_identity() {
        let src = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = vec![0u8; 8];
        let mut tmp = vec![0u8; 8];
        let k = gaussian_kernel_q16(0, 1.0).unwrap();
        blur_rgba_premul(&src, &mut dst, &mut tmp, 1, 2, &k).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn constant_image_is_identity() {
        let (w, h) = (4u32, 3u32);
        let px = [10u8, 20u8, 30u8, 40u8];
        let src = px.repeat((w * h) as usize);
        let mut dst = vec![0u8; src.len()];
        let mut tmp = vec![0u8; src.len()];
        let k = gaussian_kernel_q16(3, 1.5).unwrap();
        blur_rgba_premul(&src, &mut dst, &mut tmp, w, h, &k).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn plane_blur_spreads_energy_from_single_pixel() {
        let (w, h) = (5u32, 5u32);
        let mut src = vec![0u8; (w * h) as usize];
        src[(2 * w + 2) as usize] = 255;

        let mut dst = vec![0u8; src.len()];
        let mut tmp = vec![0u8; src.len()];
        let k = gaussian_kernel_q16(2, 1.2).unwrap();
        blur_plane(&src, &mut dst, &mut tmp, w, h, &k).unwrap();

        let nonzero = dst.iter().filter(|&&v| v != 0).count();
        assert!(nonzero > 1);

        let sum: u32 = dst.iter().map(|&v| u32::from(v)).sum();
        assert!((sum as i32 - 255).abs() <= 4);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let src = vec![0u8; 16];
        let mut dst = vec![0u8; 12];
        let mut tmp = vec![0u8; 16];
        let k = gaussian_kernel_q16(1, 0.5).unwrap();
        assert!(blur_rgba_premul(&src, &mut dst, &mut tmp, 2, 2, &k).is_err());
    }
}
