use cortex_m::asm::delay;

use super::{AdcConfig, AdcInstance, Resolution};
use crate::error::Subsystem;
use crate::feature::Peripheral;
use crate::pac::{self, RCC};
use crate::Error;

// Stabilisation time after ADON: 1 us at the highest core clock
const POWER_UP_CYCLES: u32 = 72;
// Two ADC clocks before calibration at the slowest ADC clock (72 MHz / 8)
const PRE_CALIBRATION_CYCLES: u32 = 16;

macro_rules! adc_hw {
    ($(
        $(#[$attr:meta])*
        $ADC:ident: ($adcen:ident, $adcrst:ident),
    )+) => {
        $(
            $(#[$attr])*
            impl Peripheral for pac::$ADC {
                type Config = AdcConfig;

                fn commit(&mut self, cfg: &AdcConfig) -> Result<(), Error> {
                    if cfg.resolution != Resolution::Bits12 {
                        return Err(Error::Unsupported.latch(Subsystem::Adc, cfg.resolution.bits() as u32));
                    }

                    // NOTE(unsafe) this modifies only the bits owned by this converter
                    let rcc = unsafe { &*RCC::ptr() };
                    rcc.apb2enr().modify(|_, w| w.$adcen().set_bit());
                    rcc.apb2rstr().modify(|_, w| w.$adcrst().set_bit());
                    rcc.apb2rstr().modify(|_, w| w.$adcrst().clear_bit());
                    rcc.cfgr().modify(|_, w| unsafe { w.adcpre().bits(cfg.prescaler.bits()) });

                    self.cr2().modify(|_, w| w.adon().clear_bit());

                    let [sqr1, sqr2, sqr3] = cfg.sequence.sqr_bits();
                    let (smpr1, smpr2) = cfg.smpr_bits();
                    unsafe {
                        self.smpr1().write(|w| w.bits(smpr1));
                        self.smpr2().write(|w| w.bits(smpr2));
                        self.sqr1().write(|w| w.bits(sqr1));
                        self.sqr2().write(|w| w.bits(sqr2));
                        self.sqr3().write(|w| w.bits(sqr3));
                    }

                    self.cr1().modify(|_, w| {
                        w.scan().bit(cfg.scan);
                        w.discen().clear_bit();
                        w.eocie().bit(cfg.eoc_interrupt)
                    });
                    self.cr2().modify(|_, w| {
                        w.cont().bit(cfg.continuous);
                        w.dma().bit(cfg.dma);
                        w.align().bit(cfg.align.into());
                        w.exttrig().set_bit();
                        unsafe { w.extsel().bits(cfg.trigger.bits()) }
                    });

                    self.cr2().modify(|_, w| w.adon().set_bit());
                    delay(POWER_UP_CYCLES);
                    delay(PRE_CALIBRATION_CYCLES * cfg.prescaler.divisor());

                    self.cr2().modify(|_, w| w.rstcal().set_bit());
                    while self.cr2().read().rstcal().bit_is_set() {}

                    self.cr2().modify(|_, w| w.cal().set_bit());
                    while self.cr2().read().cal().bit_is_set() {}

                    Ok(())
                }
            }

            $(#[$attr])*
            impl AdcInstance for pac::$ADC {
                fn start_conversion(&mut self) {
                    self.cr2().modify(|_, w| w.swstart().set_bit());
                }

                fn is_conversion_complete(&self) -> bool {
                    self.sr().read().eoc().bit_is_set()
                }

                fn read_data(&mut self) -> u16 {
                    self.dr().read().data().bits()
                }

                fn data_register_address(&self) -> u32 {
                    self.dr().as_ptr() as u32
                }

                fn power_down(&mut self) {
                    self.cr2().modify(|_, w| w.adon().clear_bit());
                }
            }
        )+
    };
}

adc_hw! {
    ADC1: (adc1en, adc1rst),
    #[cfg(any(feature = "stm32f103", feature = "connectivity"))]
    ADC2: (adc2en, adc2rst),
    #[cfg(all(feature = "stm32f103", any(feature = "high", feature = "xl")))]
    ADC3: (adc3en, adc3rst),
}
