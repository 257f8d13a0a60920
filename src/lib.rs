//! # Composable peripheral drivers for the STM32F1 family
//!
//! Peripheral drivers in this crate are not configured through a long list of
//! setter calls. Instead every driver is built from an ordered set of small,
//! independent *features*: a clock prescaler, a resolution, a group of regular
//! channels, scan mode, DMA circular mode and so on. Each feature writes its
//! part of a configuration descriptor, and the driver commits that descriptor
//! to the register block exactly once.
//!
//! Interrupts reach the application through the [`event`] module: a driver's
//! interrupt entry point publishes a typed event and every subscribed
//! receiver is called synchronously, in registration order, before the ISR
//! returns.
//!
//! # Usage
//!
//! Select the microcontroller with the corresponding Cargo feature:
//!
//! - stm32f100
//! - stm32f101
//! - stm32f103
//! - stm32f105
//! - stm32f107
//!
//! ```toml
//! [dependencies.stm32f1xx-compose]
//! version = "0.1.0"
//! features = ["stm32f103"]
//! ```
//!
//! Without a device feature only the register independent part of the crate
//! is built: the feature composition core, the event dispatch core and the
//! driver state machines. Every driver is generic over a small register seam
//! trait ([`adc::AdcInstance`], [`dma::DmaChannel`], [`can::CanInstance`])
//! which the device features implement for the PAC register blocks.
//!
//! ## Usage example
//!
//! Three ADC1 channels converted in scan mode, moved to memory by circular
//! DMA, with the main loop woken by the DMA complete interrupt:
//!
//! ```rust, ignore
//! let adc = Adc::new(dp.ADC1, (
//!     ClockPrescaler(AdcPrescaler::Div2),
//!     ResolutionFeature(Resolution::Bits12),
//!     RegularChannels::new(&[0, 1], SampleTime::T_71),
//!     RegularChannel(2, SampleTime::T_239),
//!     ScanMode,
//!     DmaRequests,
//! ))?;
//!
//! let mut dma = DmaChannelDriver::new(dma1.1, adc.dma_source())?;
//! dma.subscribe(&READY)?;
//! dma.enable_interrupts(Interrupts::COMPLETE);
//! dma.begin_read(singleton!(: [u16; 3] = [0; 3]).unwrap())
//!     .map_err(|(e, _buf)| e)?;
//!
//! loop {
//!     adc.start_regular_conversion();
//!     READY.wait();
//! }
//! ```
//!
//! See the `demos` folder for complete programs.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(feature = "stm32f100")]
pub use stm32f1::stm32f100 as pac;

#[cfg(feature = "stm32f101")]
pub use stm32f1::stm32f101 as pac;

#[cfg(feature = "stm32f103")]
pub use stm32f1::stm32f103 as pac;

#[cfg(any(feature = "stm32f105", feature = "stm32f107"))]
pub use stm32f1::stm32f107 as pac;

#[cfg(feature = "device-selected")]
pub use crate::pac as device;

#[macro_use]
mod fmt;

pub mod adc;
pub mod can;
pub mod dma;
pub mod error;
pub mod event;
pub mod feature;
pub mod prelude;

pub use crate::error::Error;
