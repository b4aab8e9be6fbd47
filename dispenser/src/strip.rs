use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, PinState, Pulse, PulseTicks, RmtChannel, TxRmtDriver,
        VariableLengthSignal,
    },
};
use log::warn;

use dispenser_common::{error::LightError, PixelStrip, Rgb};

/// 80 MHz APB / 2 gives 25 ns ticks.
const WS2812_CLOCK_DIVIDER: u8 = 2;
const T0H_TICKS: u16 = 16;
const T0L_TICKS: u16 = 34;
const T1H_TICKS: u16 = 32;
const T1L_TICKS: u16 = 18;

/// WS2812 chain driven over an RMT channel, GRB byte order.
pub struct Ws2812Strip {
    tx: TxRmtDriver<'static>,
    pixels: Vec<Rgb>,
}

impl Ws2812Strip {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        len: usize,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new()
            .clock_divider(WS2812_CLOCK_DIVIDER)
            .idle(Some(PinState::Low));
        let tx = TxRmtDriver::new(channel, pin, &config).context("failed to init RMT led driver")?;

        Ok(Self {
            tx,
            pixels: vec![Rgb::BLACK; len],
        })
    }

    fn encode(&self) -> anyhow::Result<VariableLengthSignal> {
        let zero = [
            Pulse::new(PinState::High, PulseTicks::new(T0H_TICKS)?),
            Pulse::new(PinState::Low, PulseTicks::new(T0L_TICKS)?),
        ];
        let one = [
            Pulse::new(PinState::High, PulseTicks::new(T1H_TICKS)?),
            Pulse::new(PinState::Low, PulseTicks::new(T1L_TICKS)?),
        ];

        let mut signal = VariableLengthSignal::with_capacity(self.pixels.len() * 24 * 2);
        for pixel in &self.pixels {
            for byte in [pixel.g, pixel.r, pixel.b] {
                for bit in (0..8).rev() {
                    let pulses = if byte & (1 << bit) != 0 { &one } else { &zero };
                    signal.push(pulses.iter())?;
                }
            }
        }
        Ok(signal)
    }
}

impl PixelStrip for Ws2812Strip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        match self.pixels.get_mut(index) {
            Some(pixel) => *pixel = color,
            None => warn!("pixel {index} is past the end of the strip"),
        }
    }

    fn show(&mut self) -> Result<(), LightError> {
        let signal = self
            .encode()
            .map_err(|err| LightError::Strip(format!("{err:#}")))?;
        self.tx
            .start_blocking(&signal)
            .map_err(|err| LightError::Strip(format!("rmt transmit failed: {err:?}")))
    }
}
