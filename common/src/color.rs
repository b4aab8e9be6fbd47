use core::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(0xFF, 0xFF, 0xFF);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn from_u32(value: u32) -> Self {
        Self {
            r: ((value >> 16) & 0xFF) as u8,
            g: ((value >> 8) & 0xFF) as u8,
            b: (value & 0xFF) as u8,
        }
    }

    pub const fn to_u32(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    /// Parses `RRGGBB` with an optional leading `#`.
    ///
    /// The `#` must be the first character; whitespace is skipped only after
    /// it. Reads the longest run of leading hex digits, so trailing garbage is
    /// ignored and an unparsable string yields black. Values wider than a
    /// signed 32-bit integer saturate before the low 24 bits are taken.
    pub fn from_hex(hex: &str) -> Self {
        let digits = hex.strip_prefix('#').unwrap_or(hex).trim_start();

        let mut value: u32 = 0;
        for digit in digits.chars().map_while(|c| c.to_digit(16)) {
            value = match value.checked_mul(16).and_then(|v| v.checked_add(digit)) {
                Some(next) if next <= i32::MAX as u32 => next,
                _ => i32::MAX as u32,
            };
        }

        Self::from_u32(value)
    }

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Scales every channel by `percent / 100`, truncating.
    pub fn scaled(self, percent: u8) -> Self {
        let percent = u16::from(percent.min(100));
        let scale = |channel: u8| ((u16::from(channel) * percent) / 100) as u8;
        Self {
            r: scale(self.r),
            g: scale(self.g),
            b: scale(self.b),
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.r, self.g, self.b)
    }
}
