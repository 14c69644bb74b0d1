//! Gradient-based edge detection (Canny).

use image::GrayImage;

/// Canny edge detection: Sobel gradients, non-maximum suppression along
/// the quantised gradient direction, then double-threshold hysteresis.
/// Returns a binary edge map (255 on edges).
pub fn canny(img: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = (img.width() as i32, img.height() as i32);
    if w < 3 || h < 3 {
        return GrayImage::new(img.width(), img.height());
    }
    let src = img.as_raw();
    let at = |x: i32, y: i32| -> f32 {
        let xc = x.clamp(0, w - 1);
        let yc = y.clamp(0, h - 1);
        src[(yc * w + xc) as usize] as f32
    };

    let mut gx = vec![0.0f32; (w * h) as usize];
    let mut gy = vec![0.0f32; (w * h) as usize];
    let mut mag = vec![0.0f32; (w * h) as usize];

    for y in 0..h {
        for x in 0..w {
            let sx = -at(x - 1, y - 1) - 2.0 * at(x - 1, y) - at(x - 1, y + 1)
                + at(x + 1, y - 1)
                + 2.0 * at(x + 1, y)
                + at(x + 1, y + 1);
            let sy = -at(x - 1, y - 1) - 2.0 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2.0 * at(x, y + 1)
                + at(x + 1, y + 1);
            let i = (y * w + x) as usize;
            gx[i] = sx;
            gy[i] = sy;
            mag[i] = (sx * sx + sy * sy).sqrt();
        }
    }

    // Non-maximum suppression into strong/weak classes.
    const NONE: u8 = 0;
    const WEAK: u8 = 1;
    const STRONG: u8 = 2;
    let mut class = vec![NONE; (w * h) as usize];

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = (y * w + x) as usize;
            let m = mag[i];
            if m < low {
                continue;
            }

            // Quantise the gradient direction to one of four axes.
            let angle = gy[i].atan2(gx[i]).to_degrees();
            let angle = if angle < 0.0 { angle + 180.0 } else { angle };
            let (dx, dy) = if !(22.5..157.5).contains(&angle) {
                (1i32, 0i32)
            } else if angle < 67.5 {
                (1, 1)
            } else if angle < 112.5 {
                (0, 1)
            } else {
                (1, -1)
            };

            let m1 = mag[((y + dy) * w + (x + dx)) as usize];
            let m2 = mag[((y - dy) * w + (x - dx)) as usize];
            if m >= m1 && m >= m2 {
                class[i] = if m >= high { STRONG } else { WEAK };
            }
        }
    }

    // Hysteresis: promote weak pixels connected to strong ones.
    let mut out = GrayImage::new(img.width(), img.height());
    let mut stack: Vec<(i32, i32)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if class[(y * w + x) as usize] == STRONG {
                stack.push((x, y));
            }
        }
    }
    while let Some((x, y)) = stack.pop() {
        let i = (y * w + x) as usize;
        if out.as_raw()[i] == 255 {
            continue;
        }
        out.put_pixel(x as u32, y as u32, image::Luma([255]));
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let ni = (ny * w + nx) as usize;
                if class[ni] == WEAK && out.as_raw()[ni] != 255 {
                    stack.push((nx, ny));
                }
            }
        }
    }

    out
}
