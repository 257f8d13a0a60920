//! DMA channel singletons for the PAC controllers

use super::{DmaChannel, DmaConfig, Interrupts};
use crate::feature::Peripheral;
use crate::Error;

pub trait DmaExt {
    type Channels;

    /// Enables the controller and resets every channel
    fn split(self) -> Self::Channels;
}

macro_rules! dma {
    ($($DMAX:ident: ($dmaX:ident, $dmaen:ident, {
        $($CX:ident: ($idx:expr),)+
    }),)+) => {
        $(
            pub mod $dmaX {
                use super::*;
                use crate::pac::{$DMAX, RCC};

                #[allow(clippy::manual_non_exhaustive)]
                pub struct Channels((), $(pub $CX),+);

                $(
                    /// A singleton that represents a single DMAx channel (channel X in this case)
                    ///
                    /// This singleton has exclusive access to the registers of the DMAx channel X
                    pub struct $CX { _0: () }

                    impl $CX {
                        const SHIFT: u32 = 4 * $idx;

                        fn dma(&self) -> &'static crate::pac::dma1::RegisterBlock {
                            unsafe { &*$DMAX::ptr() }
                        }

                        fn ch(&self) -> &'static crate::pac::dma1::CH {
                            self.dma().ch($idx)
                        }
                    }

                    impl Peripheral for $CX {
                        type Config = DmaConfig;

                        fn commit(&mut self, cfg: &DmaConfig) -> Result<(), Error> {
                            self.stop();
                            // NOTE(unsafe) every CCR bit is written from the descriptor
                            unsafe {
                                self.ch().cr().write(|w| w.bits(cfg.ccr_bits()));
                                self.ch().par().write(|w| w.pa().bits(cfg.peripheral_address));
                            }
                            Ok(())
                        }
                    }

                    impl DmaChannel for $CX {
                        fn set_peripheral_address(&mut self, address: u32, inc: bool) {
                            unsafe { self.ch().par().write(|w| w.pa().bits(address)) };
                            self.ch().cr().modify(|_, w| w.pinc().bit(inc));
                        }

                        fn set_memory_address(&mut self, address: u32, inc: bool) {
                            unsafe { self.ch().mar().write(|w| w.ma().bits(address)) };
                            self.ch().cr().modify(|_, w| w.minc().bit(inc));
                        }

                        fn set_transfer_length(&mut self, len: usize) {
                            self.ch().ndtr().write(|w| unsafe { w.ndt().bits(len as u16) });
                        }

                        fn start(&mut self) {
                            self.ch().cr().modify(|_, w| w.en().set_bit());
                        }

                        fn stop(&mut self) {
                            unsafe { self.dma().ifcr().write(|w| w.bits(0b1111 << Self::SHIFT)) };
                            self.ch().cr().modify(|_, w| w.en().clear_bit());
                        }

                        fn remaining(&self) -> usize {
                            self.ch().ndtr().read().ndt().bits() as usize
                        }

                        fn take_flags(&mut self) -> Interrupts {
                            let isr = self.dma().isr().read().bits() >> Self::SHIFT;
                            unsafe { self.dma().ifcr().write(|w| w.bits(0b1111 << Self::SHIFT)) };
                            let mut flags = Interrupts::empty();
                            flags.set(Interrupts::COMPLETE, isr & (1 << 1) != 0);
                            flags.set(Interrupts::HALF_COMPLETE, isr & (1 << 2) != 0);
                            flags.set(Interrupts::ERROR, isr & (1 << 3) != 0);
                            flags
                        }

                        fn listen(&mut self, irq: Interrupts) {
                            self.ch().cr().modify(|r, w| unsafe {
                                w.bits(r.bits() | irq_bits(irq))
                            });
                        }

                        fn unlisten(&mut self, irq: Interrupts) {
                            self.ch().cr().modify(|r, w| unsafe {
                                w.bits(r.bits() & !irq_bits(irq))
                            });
                        }
                    }
                )+

                impl DmaExt for $DMAX {
                    type Channels = Channels;

                    fn split(self) -> Channels {
                        let rcc = unsafe { &(*RCC::ptr()) };
                        rcc.ahbenr().modify(|_, w| w.$dmaen().set_bit());

                        // reset the DMA control registers (stops all on-going transfers)
                        $(
                            self.ch($idx).cr().reset();
                        )+

                        Channels((), $($CX { _0: () }),+)
                    }
                }
            }
        )+
    }
}

/// `TCIE`, `HTIE` and `TEIE` bits of `CCR`
fn irq_bits(irq: Interrupts) -> u32 {
    let mut bits = 0;
    if irq.contains(Interrupts::COMPLETE) {
        bits |= 1 << 1;
    }
    if irq.contains(Interrupts::HALF_COMPLETE) {
        bits |= 1 << 2;
    }
    if irq.contains(Interrupts::ERROR) {
        bits |= 1 << 3;
    }
    bits
}

dma! {
    DMA1: (dma1, dma1en, {
        C1: (0),
        C2: (1),
        C3: (2),
        C4: (3),
        C5: (4),
        C6: (5),
        C7: (6),
    }),
}

#[cfg(any(feature = "high", feature = "connectivity"))]
dma! {
    DMA2: (dma2, dma2en, {
        C1: (0),
        C2: (1),
        C3: (2),
        C4: (3),
        C5: (4),
    }),
}
