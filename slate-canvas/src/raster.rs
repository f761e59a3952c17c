//! Owned RGBA raster surface and color parsing.

use std::fmt;
use std::str::FromStr;

/// An 8-bit RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColorError {
    #[error("color '{0}' must start with '#'")]
    MissingHash(String),
    #[error("color '{0}' must have 6 or 8 hex digits")]
    BadLength(String),
    #[error("color '{0}' contains a non-hex digit")]
    BadDigit(String),
}

impl Color {
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#rrggbb` or `#rrggbbaa`.
    pub fn parse(s: &str) -> Result<Self, ColorError> {
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| ColorError::MissingHash(s.to_string()))?;
        if hex.len() != 6 && hex.len() != 8 {
            return Err(ColorError::BadLength(s.to_string()));
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ColorError::BadDigit(s.to_string()));
        }

        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ColorError::BadDigit(s.to_string()))
        };
        let a = if hex.len() == 8 { channel(6)? } else { 255 };
        Ok(Self::rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }

    pub fn is_opaque(&self) -> bool {
        self.a == 255
    }

    /// Source-over composite of `self` onto `dst`.
    pub fn over(self, dst: Color) -> Color {
        if self.is_opaque() {
            return self;
        }
        if self.a == 0 {
            return dst;
        }
        let sa = self.a as u32;
        let da = dst.a as u32 * (255 - sa) / 255;
        let out_a = sa + da;
        if out_a == 0 {
            return Color::TRANSPARENT;
        }
        let mix = |s: u8, d: u8| ((s as u32 * sa + d as u32 * da) / out_a) as u8;
        Color::rgba(
            mix(self.r, dst.r),
            mix(self.g, dst.g),
            mix(self.b, dst.b),
            out_a as u8,
        )
    }
}

impl FromStr for Color {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)?;
        if self.a != 255 {
            write!(f, "{:02x}", self.a)?;
        }
        Ok(())
    }
}

/// A fixed-size pixel surface.
///
/// `base` is the background the surface was created with; `background` is
/// whatever the last clear painted, and is what the eraser paints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    base: Color,
    background: Color,
    pixels: Vec<Color>,
}

impl Raster {
    pub fn new(width: u32, height: u32, background: Color) -> Self {
        Self {
            width,
            height,
            base: background,
            background,
            pixels: vec![background; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Current background (last clear color).
    pub fn background(&self) -> Color {
        self.background
    }

    /// Background the raster was created with.
    pub fn base_background(&self) -> Color {
        self.base
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[self.index(x, y)])
    }

    /// Composite `color` onto one pixel. Out-of-bounds writes are clipped.
    pub fn put(&mut self, x: i64, y: i64, color: Color) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let idx = self.index(x as u32, y as u32);
        self.pixels[idx] = color.over(self.pixels[idx]);
    }

    /// Wipe every pixel to `color`, which becomes the background.
    pub fn fill(&mut self, color: Color) {
        self.background = color;
        self.pixels.fill(color);
    }

    /// Wipe back to the creation background.
    pub fn reset(&mut self) {
        self.fill(self.base);
    }

    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    /// Number of pixels exactly equal to `color`.
    pub fn count(&self, color: Color) -> usize {
        self.pixels.iter().filter(|&&p| p == color).count()
    }

    /// FNV-1a hash over the pixel data, for cheap equality checks across
    /// replays.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for byte in self
            .pixels
            .iter()
            .flat_map(|p| [p.r, p.g, p.b, p.a])
            .chain(self.width.to_le_bytes())
            .chain(self.height.to_le_bytes())
        {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rgb_and_rgba() {
        assert_eq!(Color::parse("#ff8000").unwrap(), Color::rgb(255, 128, 0));
        assert_eq!(Color::parse("#FF800080").unwrap(), Color::rgba(255, 128, 0, 128));
        assert_eq!("#000000".parse::<Color>().unwrap(), Color::BLACK);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Color::parse("ff8000"),
            Err(ColorError::MissingHash("ff8000".into()))
        );
        assert_eq!(Color::parse("#fff"), Err(ColorError::BadLength("#fff".into())));
        assert_eq!(
            Color::parse("#gg0000"),
            Err(ColorError::BadDigit("#gg0000".into()))
        );
        // Multi-byte input must not panic on slicing.
        assert!(Color::parse("#ééé").is_err());
    }

    #[test]
    fn test_display_roundtrips() {
        for s in ["#1e90ff", "#00000080"] {
            assert_eq!(Color::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_over_blending() {
        let red = Color::rgb(255, 0, 0);
        assert!(red.is_opaque());
        assert!(!Color::rgba(255, 0, 0, 254).is_opaque());
        assert_eq!(red.over(Color::WHITE), red);
        assert_eq!(Color::TRANSPARENT.over(red), red);

        let half_black = Color::rgba(0, 0, 0, 128);
        let mixed = half_black.over(Color::WHITE);
        assert_eq!(mixed.a, 255);
        assert!(mixed.r > 120 && mixed.r < 135);
    }

    #[test]
    fn test_put_clips_out_of_bounds() {
        let mut raster = Raster::new(4, 4, Color::WHITE);
        raster.put(-1, 0, Color::BLACK);
        raster.put(4, 4, Color::BLACK);
        raster.put(2, 3, Color::BLACK);
        assert_eq!(raster.count(Color::BLACK), 1);
        assert_eq!(raster.pixel(2, 3), Some(Color::BLACK));
        assert_eq!(raster.pixel(4, 0), None);
    }

    #[test]
    fn test_fill_sets_background_and_reset_restores_base() {
        let mut raster = Raster::new(3, 2, Color::WHITE);
        raster.fill(Color::BLACK);
        assert_eq!(raster.background(), Color::BLACK);
        assert_eq!(raster.count(Color::BLACK), 6);

        raster.reset();
        assert_eq!(raster.background(), Color::WHITE);
        assert_eq!(raster.count(Color::WHITE), 6);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = Raster::new(8, 8, Color::WHITE);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.put(1, 1, Color::BLACK);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(
            Raster::new(4, 16, Color::WHITE).fingerprint(),
            a.fingerprint()
        );
    }
}
