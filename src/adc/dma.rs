//! ADC as a DMA source

use super::{Adc, AdcInstance};
use crate::dma::{Direction, DmaConfig, WordSize};
use crate::feature::Feature;
use crate::Error;

/// Configures a DMA channel to drain an ADC data register.
///
/// Sets up a circular, half-word, peripheral to memory transfer from the
/// data register into an incrementing buffer. Apply [`OneShot`] after it for
/// a single pass over the buffer.
///
/// [`OneShot`]: crate::dma::OneShot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcDmaSource {
    address: u32,
}

impl AdcDmaSource {
    /// Source reading from the data register at `address`
    pub const fn new(address: u32) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u32 {
        self.address
    }
}

impl Feature<DmaConfig> for AdcDmaSource {
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.direction = Direction::PeripheralToMemory;
        cfg.peripheral_address = self.address;
        cfg.peripheral_size = WordSize::Bits16;
        cfg.memory_size = WordSize::Bits16;
        cfg.peripheral_increment = false;
        cfg.memory_increment = true;
        cfg.circular = true;
        Ok(())
    }
}

impl<ADC: AdcInstance> Adc<ADC> {
    /// DMA feature reading this converter's results
    pub fn dma_source(&self) -> AdcDmaSource {
        AdcDmaSource::new(self.data_register_address())
    }
}
