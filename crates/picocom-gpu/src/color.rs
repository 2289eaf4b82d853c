//! RGB565 colour helpers.
//!
//! Layout: blue in bits 0-4, green in bits 5-10, red in bits 11-15.

pub const BLACK: u16 = 0x0000;
pub const WHITE: u16 = 0xFFFF;
pub const RED: u16 = 0xF800;
pub const GREEN: u16 = 0x07E0;
pub const BLUE: u16 = 0x001F;

pub const fn rgb(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 & 0x1F) << 11) | ((g as u16 & 0x3F) << 5) | (b as u16 & 0x1F)
}

/// Split into `(r, g, b)` channel values (5, 6, 5 bits).
pub const fn channels(c: u16) -> (u16, u16, u16) {
    ((c >> 11) & 0x1F, (c >> 5) & 0x3F, c & 0x1F)
}

/// Build a colour from unit floats, clamping each channel to `0..=1`.
pub fn from_rgbf(r: f32, g: f32, b: f32) -> u16 {
    let r = (r.clamp(0.0, 1.0) * 31.0) as u8;
    let g = (g.clamp(0.0, 1.0) * 63.0) as u8;
    let b = (b.clamp(0.0, 1.0) * 31.0) as u8;
    rgb(r, g, b)
}

/// Blend `fg` over `bg` with an 8-bit alpha (5 bits of precision).
pub fn alpha_blit(fg: u16, bg: u16, alpha: u8) -> u16 {
    let a = (alpha >> 3) as u32;
    let spread = |c: u16| (c as u32 | ((c as u32) << 16)) & 0x07E0_F81F;
    let fg = spread(fg);
    let mut bg = spread(bg);
    bg = bg.wrapping_add((fg.wrapping_sub(bg)).wrapping_mul(a) >> 5);
    bg &= 0x07E0_F81F;
    (bg | (bg >> 16)) as u16
}

/// Per-channel add that saturates each channel at its maximum.
pub fn add_saturate(a: u16, b: u16) -> u16 {
    let (ar, ag, ab) = channels(a);
    let (br, bg, bb) = channels(b);
    let r = (ar + br).min(0x1F);
    let g = (ag + bg).min(0x3F);
    let b = (ab + bb).min(0x1F);
    (r << 11) | (g << 5) | b
}

/// Per-channel multiply, normalised so white is the identity.
pub fn multiply(a: u16, b: u16) -> u16 {
    let (ar, ag, ab) = channels(a);
    let (br, bg, bb) = channels(b);
    let r = (ar * br) / 0x1F;
    let g = (ag * bg) / 0x3F;
    let b = (ab * bb) / 0x1F;
    (r << 11) | (g << 5) | b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_extremes() {
        assert_eq!(alpha_blit(RED, BLUE, 0), BLUE);
        // 255 >> 3 = 31 of 32 steps, so full alpha lands one step short.
        let c = alpha_blit(WHITE, BLACK, 255);
        let (r, g, b) = channels(c);
        assert!(r >= 30 && g >= 60 && b >= 30);
    }

    #[test]
    fn add_saturates_per_channel() {
        assert_eq!(add_saturate(RED, RED), RED);
        assert_eq!(add_saturate(RED, BLUE), RED | BLUE);
        assert_eq!(add_saturate(rgb(20, 40, 20), rgb(20, 40, 20)), WHITE);
    }

    #[test]
    fn rgbf_clamps() {
        assert_eq!(from_rgbf(2.0, -1.0, 0.0), RED);
        assert_eq!(from_rgbf(1.0, 1.0, 1.0), WHITE);
    }

    #[test]
    fn multiply_by_white_is_identity() {
        let c = rgb(12, 33, 7);
        assert_eq!(multiply(c, WHITE), c);
        assert_eq!(multiply(c, BLACK), BLACK);
    }
}
