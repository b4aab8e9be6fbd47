use log::{info, warn};

use crate::{board::PixelStrip, color::Rgb, error::LightError};

pub const COMPARTMENTS: usize = 6;
pub const LEDS_PER_COMPARTMENT: usize = 3;
pub const STRIP_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompartmentSlot {
    pub color: Rgb,
    pub brightness: u8,
}

impl Default for CompartmentSlot {
    fn default() -> Self {
        Self {
            color: Rgb::WHITE,
            brightness: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompartmentState {
    slots: [CompartmentSlot; COMPARTMENTS],
}

impl CompartmentState {
    pub fn slot(&self, index: usize) -> Option<&CompartmentSlot> {
        self.slots.get(index)
    }
}

/// Maps compartments onto their fixed pixel ranges and remembers what was
/// last applied to each.
#[derive(Debug, Clone, Default)]
pub struct CompartmentLights {
    state: CompartmentState,
}

impl CompartmentLights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CompartmentState {
        &self.state
    }

    pub fn pixel_range(index: usize) -> core::ops::Range<usize> {
        let start = index * LEDS_PER_COMPARTMENT;
        start..start + LEDS_PER_COMPARTMENT
    }

    /// Renders `hex_color` at `brightness` percent on compartment `index` and
    /// commits it. Out-of-range indices leave state and pixels untouched.
    pub fn apply(
        &mut self,
        strip: &mut dyn PixelStrip,
        index: i64,
        hex_color: &str,
        brightness: u8,
    ) -> Result<usize, LightError> {
        let slot = usize::try_from(index)
            .ok()
            .filter(|slot| *slot < COMPARTMENTS)
            .ok_or(LightError::InvalidCompartment(index))?;

        let brightness = brightness.min(100);
        let color = Rgb::from_hex(hex_color);
        let rendered = color.scaled(brightness);

        Self::render_slot(strip, slot, rendered);
        strip.show()?;

        self.state.slots[slot] = CompartmentSlot { color, brightness };
        info!(
            "compartment {slot} set to {} at {brightness}% (rendered {rendered})",
            color.to_hex()
        );
        Ok(slot)
    }

    fn render_slot(strip: &mut dyn PixelStrip, slot: usize, color: Rgb) {
        for pixel in Self::pixel_range(slot) {
            if pixel >= strip.len() {
                warn!("pixel {pixel} for compartment {slot} is beyond the strip");
                break;
            }
            strip.set_pixel(pixel, color);
        }
    }
}
