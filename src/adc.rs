//! # Analog to Digital converter
//!
//! An [`Adc`] is built from features writing an [`AdcConfig`]:
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
//! ```
//!
//! Channel features append to the regular sequence in the order they are
//! applied; the first registered channel gets rank 1. The sequence belongs to
//! the driver instance, so two converters never share ranks.

use core::convert::Infallible;

use fugit::HertzU32 as Hertz;
use heapless::Vec;

use crate::error::Subsystem;
use crate::feature::{self, Feature, Peripheral};
use crate::Error;

mod dma;
#[cfg(feature = "device-selected")]
mod hw;

pub use self::dma::AdcDmaSource;

/// Length of the STM32F1 regular conversion sequence
pub const MAX_REGULAR_CHANNELS: usize = 16;

/// Highest channel number (17 is the internal reference on ADC1)
pub const MAX_CHANNEL: u8 = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(non_camel_case_types)]
/// ADC sampling time
///
/// Options for the sampling time, each is T + 0.5 ADC clock cycles.
pub enum SampleTime {
    /// 1.5 cycles sampling time
    T_1,
    /// 7.5 cycles sampling time
    T_7,
    /// 13.5 cycles sampling time
    T_13,
    /// 28.5 cycles sampling time
    T_28,
    /// 41.5 cycles sampling time
    T_41,
    /// 55.5 cycles sampling time
    T_55,
    /// 71.5 cycles sampling time
    T_71,
    /// 239.5 cycles sampling time
    T_239,
}

impl Default for SampleTime {
    /// Get the default sample time (currently 28.5 cycles)
    fn default() -> Self {
        SampleTime::T_28
    }
}

impl From<SampleTime> for u8 {
    fn from(val: SampleTime) -> Self {
        use SampleTime::*;
        match val {
            T_1 => 0,
            T_7 => 1,
            T_13 => 2,
            T_28 => 3,
            T_41 => 4,
            T_55 => 5,
            T_71 => 6,
            T_239 => 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// ADC data register alignment
pub enum Align {
    /// Right alignment of output data
    #[default]
    Right,
    /// Left alignment of output data
    Left,
}

impl From<Align> for bool {
    fn from(val: Align) -> Self {
        match val {
            Align::Right => false,
            Align::Left => true,
        }
    }
}

/// ADC clock divider applied to PCLK2
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdcPrescaler {
    #[default]
    Div2,
    Div4,
    Div6,
    Div8,
}

impl AdcPrescaler {
    pub fn divisor(self) -> u32 {
        match self {
            AdcPrescaler::Div2 => 2,
            AdcPrescaler::Div4 => 4,
            AdcPrescaler::Div6 => 6,
            AdcPrescaler::Div8 => 8,
        }
    }

    /// `ADCPRE` field value
    pub fn bits(self) -> u8 {
        match self {
            AdcPrescaler::Div2 => 0b00,
            AdcPrescaler::Div4 => 0b01,
            AdcPrescaler::Div6 => 0b10,
            AdcPrescaler::Div8 => 0b11,
        }
    }
}

/// Conversion resolution
///
/// The STM32F1 converters are 12 bit only. Other values are accepted by the
/// descriptor but refused when committed to the hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resolution {
    #[default]
    Bits12,
    Bits10,
    Bits8,
    Bits6,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Resolution::Bits12 => 12,
            Resolution::Bits10 => 10,
            Resolution::Bits8 => 8,
            Resolution::Bits6 => 6,
        }
    }
}

/// Regular group trigger (`EXTSEL`, ADC1 and ADC2 encoding)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Trigger {
    Tim1Cc1,
    Tim1Cc2,
    Tim1Cc3,
    Tim2Cc2,
    Tim3Trgo,
    Tim4Cc4,
    Exti11,
    /// `SWSTART` bit, see [`Adc::start_regular_conversion`]
    #[default]
    Software,
}

impl Trigger {
    pub fn bits(self) -> u8 {
        match self {
            Trigger::Tim1Cc1 => 0b000,
            Trigger::Tim1Cc2 => 0b001,
            Trigger::Tim1Cc3 => 0b010,
            Trigger::Tim2Cc2 => 0b011,
            Trigger::Tim3Trgo => 0b100,
            Trigger::Tim4Cc4 => 0b101,
            Trigger::Exti11 => 0b110,
            Trigger::Software => 0b111,
        }
    }
}

/// One entry of the regular sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegularEntry {
    pub channel: u8,
    pub sample_time: SampleTime,
}

/// Regular conversion sequence. Entry `i` has rank `i + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegularSequence {
    entries: Vec<RegularEntry, MAX_REGULAR_CHANNELS>,
}

impl RegularSequence {
    /// Appends `channel` and returns its rank.
    pub fn push(&mut self, channel: u8, sample_time: SampleTime) -> Result<u8, Error> {
        if channel > MAX_CHANNEL {
            return Err(Error::InvalidChannel);
        }
        self.entries
            .push(RegularEntry {
                channel,
                sample_time,
            })
            .map_err(|_| Error::CapacityExceeded)?;
        Ok(self.entries.len() as u8)
    }

    /// Rank of the first occurrence of `channel`
    pub fn rank_of(&self, channel: u8) -> Option<u8> {
        self.entries
            .iter()
            .position(|e| e.channel == channel)
            .map(|i| i as u8 + 1)
    }

    pub fn entries(&self) -> &[RegularEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `SQR1`, `SQR2` and `SQR3` register values.
    ///
    /// An empty sequence converts channel 0 once, like the reset value.
    pub fn sqr_bits(&self) -> [u32; 3] {
        let pack = |skip: usize, take: usize| {
            self.entries
                .iter()
                .skip(skip)
                .take(take)
                .enumerate()
                .fold(0u32, |s, (i, e)| s | ((e.channel as u32) << (i * 5)))
        };
        let l = self.entries.len().saturating_sub(1) as u32;
        [pack(12, 4) | (l << 20), pack(6, 6), pack(0, 6)]
    }
}

/// ADC configuration descriptor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcConfig {
    pub prescaler: AdcPrescaler,
    pub resolution: Resolution,
    pub align: Align,
    /// Convert the whole regular sequence per trigger, EOC once per group
    pub scan: bool,
    pub continuous: bool,
    /// Issue a DMA request after each conversion
    pub dma: bool,
    pub eoc_interrupt: bool,
    pub trigger: Trigger,
    pub sequence: RegularSequence,
}

impl AdcConfig {
    /// ADC clock resulting from `pclk2` and the prescaler
    pub fn adc_clock(&self, pclk2: Hertz) -> Hertz {
        pclk2 / self.prescaler.divisor()
    }

    /// Number of conversions (and DMA requests) per trigger
    pub fn group_len(&self) -> usize {
        if self.scan {
            self.sequence.len().max(1)
        } else {
            1
        }
    }

    /// `SMPR1` and `SMPR2` register values
    pub fn smpr_bits(&self) -> (u32, u32) {
        self.sequence
            .entries()
            .iter()
            .fold((0, 0), |(smpr1, smpr2), e| {
                let st = u8::from(e.sample_time) as u32;
                if e.channel < 10 {
                    let shift = e.channel as u32 * 3;
                    (smpr1, (smpr2 & !(0b111 << shift)) | (st << shift))
                } else {
                    let shift = (e.channel as u32 - 10) * 3;
                    ((smpr1 & !(0b111 << shift)) | (st << shift), smpr2)
                }
            })
    }

    /// Largest value the data register can hold with this configuration
    pub fn max_sample(&self) -> u16 {
        match self.align {
            Align::Left => u16::MAX,
            Align::Right => (1 << self.resolution.bits()) - 1,
        }
    }
}

/// Selects the ADC clock divider
#[derive(Clone, Copy, Debug)]
pub struct ClockPrescaler(pub AdcPrescaler);

impl Feature<AdcConfig> for ClockPrescaler {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.prescaler = self.0;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ResolutionFeature(pub Resolution);

impl Feature<AdcConfig> for ResolutionFeature {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.resolution = self.0;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AlignFeature(pub Align);

impl Feature<AdcConfig> for AlignFeature {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.align = self.0;
        Ok(())
    }
}

/// Appends one channel to the regular sequence
#[derive(Clone, Copy, Debug)]
pub struct RegularChannel(pub u8, pub SampleTime);

impl Feature<AdcConfig> for RegularChannel {
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        let rank = cfg.sequence.push(self.0, self.1)?;
        trace!("adc channel {=u8} rank {=u8}", self.0, rank);
        Ok(())
    }
}

/// Appends several channels sharing one sample time, in slice order
#[derive(Clone, Copy, Debug)]
pub struct RegularChannels<'c> {
    channels: &'c [u8],
    sample_time: SampleTime,
}

impl<'c> RegularChannels<'c> {
    pub const fn new(channels: &'c [u8], sample_time: SampleTime) -> Self {
        Self {
            channels,
            sample_time,
        }
    }
}

impl Feature<AdcConfig> for RegularChannels<'_> {
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        for &ch in self.channels {
            RegularChannel(ch, self.sample_time).apply(cfg)?;
        }
        Ok(())
    }
}

/// Converts the full regular sequence per trigger with one end of conversion
/// event per group
#[derive(Clone, Copy, Debug)]
pub struct ScanMode;

impl Feature<AdcConfig> for ScanMode {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.scan = true;
        Ok(())
    }
}

/// Restarts conversion as soon as a group completes
#[derive(Clone, Copy, Debug)]
pub struct ContinuousMode;

impl Feature<AdcConfig> for ContinuousMode {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.continuous = true;
        Ok(())
    }
}

/// Lets the converter drive a DMA channel
#[derive(Clone, Copy, Debug)]
pub struct DmaRequests;

impl Feature<AdcConfig> for DmaRequests {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.dma = true;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EndOfConversionInterrupt;

impl Feature<AdcConfig> for EndOfConversionInterrupt {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.eoc_interrupt = true;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExternalTrigger(pub Trigger);

impl Feature<AdcConfig> for ExternalTrigger {
    #[inline]
    fn apply(&self, cfg: &mut AdcConfig) -> Result<(), Error> {
        cfg.trigger = self.0;
        Ok(())
    }
}

/// Register level access to one converter
pub trait AdcInstance: Peripheral<Config = AdcConfig> {
    /// Starts the regular group (`SWSTART`)
    fn start_conversion(&mut self);
    /// `EOC` flag
    fn is_conversion_complete(&self) -> bool;
    /// Reads the data register, clearing `EOC`
    fn read_data(&mut self) -> u16;
    /// Bus address of the data register, for DMA
    fn data_register_address(&self) -> u32;
    fn power_down(&mut self);
}

/// ADC driver
pub struct Adc<ADC> {
    rb: ADC,
    cfg: AdcConfig,
}

impl<ADC: AdcInstance> Adc<ADC> {
    /// Composes `features` and commits them to `adc`.
    ///
    /// Failures are latched under [`Subsystem::Adc`].
    pub fn new<F>(mut adc: ADC, features: F) -> Result<Self, Error>
    where
        F: Feature<AdcConfig>,
    {
        let cfg = feature::compose(&features).map_err(|e| e.latch(Subsystem::Adc, 0))?;
        adc.commit(&cfg)?;
        trace!("adc configured, {=usize} regular channels", cfg.sequence.len());
        Ok(Self { rb: adc, cfg })
    }

    /// Replaces the configuration with a freshly composed one.
    ///
    /// The current configuration stays in place if composition fails.
    pub fn reconfigure<F>(&mut self, features: F) -> Result<(), Error>
    where
        F: Feature<AdcConfig>,
    {
        let cfg = feature::compose(&features).map_err(|e| e.latch(Subsystem::Adc, 0))?;
        self.rb.commit(&cfg)?;
        self.cfg = cfg;
        Ok(())
    }

    pub fn config(&self) -> &AdcConfig {
        &self.cfg
    }

    /// Returns the largest possible sample value for the current settings
    pub fn max_sample(&self) -> u16 {
        self.cfg.max_sample()
    }

    /// Starts one conversion of the regular group
    pub fn start_regular_conversion(&mut self) {
        self.rb.start_conversion();
    }

    pub fn is_conversion_complete(&self) -> bool {
        self.rb.is_conversion_complete()
    }

    /// Reads the last conversion result, if there is one
    pub fn read(&mut self) -> nb::Result<u16, Infallible> {
        if self.rb.is_conversion_complete() {
            Ok(self.rb.read_data())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    pub fn data_register_address(&self) -> u32 {
        self.rb.data_register_address()
    }

    /// Powers down the ADC and releases the peripheral
    pub fn release(mut self) -> ADC {
        self.rb.power_down();
        self.rb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;

    #[derive(Default)]
    struct MockAdc {
        commits: usize,
        last: Option<AdcConfig>,
        started: usize,
        eoc: bool,
        data: u16,
        powered: bool,
        reject_with: Option<u32>,
    }

    impl Peripheral for MockAdc {
        type Config = AdcConfig;
        fn commit(&mut self, cfg: &AdcConfig) -> Result<(), Error> {
            if let Some(native) = self.reject_with {
                return Err(Error::Unsupported.latch(Subsystem::Adc, native));
            }
            self.commits += 1;
            self.last = Some(cfg.clone());
            self.powered = true;
            Ok(())
        }
    }

    impl AdcInstance for MockAdc {
        fn start_conversion(&mut self) {
            self.started += 1;
        }
        fn is_conversion_complete(&self) -> bool {
            self.eoc
        }
        fn read_data(&mut self) -> u16 {
            self.eoc = false;
            self.data
        }
        fn data_register_address(&self) -> u32 {
            0x4001_244C
        }
        fn power_down(&mut self) {
            self.powered = false;
        }
    }

    fn reference_features() -> impl Feature<AdcConfig> {
        (
            ClockPrescaler(AdcPrescaler::Div2),
            ResolutionFeature(Resolution::Bits12),
            RegularChannels::new(&[0, 1], SampleTime::T_71),
            RegularChannel(2, SampleTime::T_239),
            ScanMode,
            DmaRequests,
        )
    }

    #[test]
    fn composes_reference_configuration() {
        let adc = Adc::new(MockAdc::default(), reference_features()).unwrap();
        let cfg = adc.config();

        assert_eq!(cfg.prescaler, AdcPrescaler::Div2);
        assert!(cfg.scan);
        assert!(cfg.dma);
        assert!(!cfg.continuous);
        assert_eq!(cfg.trigger, Trigger::Software);
        assert_eq!(cfg.group_len(), 3);
        assert_eq!(cfg.sequence.rank_of(0), Some(1));
        assert_eq!(cfg.sequence.rank_of(1), Some(2));
        assert_eq!(cfg.sequence.rank_of(2), Some(3));
        assert_eq!(cfg.sequence.rank_of(3), None);
        assert_eq!(cfg.sequence.entries()[2].sample_time, SampleTime::T_239);

        let rb = adc.release();
        assert_eq!(rb.commits, 1);
        assert!(!rb.powered);
    }

    #[test]
    fn same_features_same_registers() {
        let a = Adc::new(MockAdc::default(), reference_features()).unwrap();
        let b = Adc::new(MockAdc::default(), reference_features()).unwrap();
        assert_eq!(a.config(), b.config());
        assert_eq!(a.config().sequence.sqr_bits(), b.config().sequence.sqr_bits());
        assert_eq!(a.config().smpr_bits(), b.config().smpr_bits());
    }

    #[test]
    fn disjoint_features_commute() {
        let a = feature::compose::<AdcConfig, _>(&(
            ScanMode,
            AlignFeature(Align::Left),
            ClockPrescaler(AdcPrescaler::Div6),
        ))
        .unwrap();
        let b = feature::compose::<AdcConfig, _>(&(
            ClockPrescaler(AdcPrescaler::Div6),
            ScanMode,
            AlignFeature(Align::Left),
        ))
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overlapping_features_last_wins() {
        let cfg = feature::compose::<AdcConfig, _>(&(
            ResolutionFeature(Resolution::Bits8),
            ClockPrescaler(AdcPrescaler::Div8),
            ResolutionFeature(Resolution::Bits12),
        ))
        .unwrap();
        assert_eq!(cfg.resolution, Resolution::Bits12);
        assert_eq!(cfg.prescaler, AdcPrescaler::Div8);
    }

    #[test]
    fn sequence_capacity_is_enforced() {
        let _g = error::exclusive();
        const ALL: [u8; 17] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

        let res = Adc::new(MockAdc::default(), RegularChannels::new(&ALL, SampleTime::T_1));
        assert!(matches!(res, Err(Error::CapacityExceeded)));
        let rec = error::last_error().unwrap();
        assert_eq!(rec.subsystem, Subsystem::Adc);
        assert_eq!(rec.code, Error::CapacityExceeded.code());

        // sixteen still fit
        let adc = Adc::new(MockAdc::default(), RegularChannels::new(&ALL[..16], SampleTime::T_1))
            .unwrap();
        assert_eq!(adc.config().sequence.len(), MAX_REGULAR_CHANNELS);
    }

    #[test]
    fn commit_failure_keeps_native_status() {
        let _g = error::exclusive();
        let rb = MockAdc {
            reject_with: Some(0b10),
            ..MockAdc::default()
        };
        let res = Adc::new(rb, reference_features());
        assert!(matches!(res, Err(Error::Unsupported)));
        assert_eq!(
            error::take_error(),
            Some(error::ErrorRecord {
                subsystem: Subsystem::Adc,
                code: Error::Unsupported.code(),
                native: 0b10,
            })
        );
    }

    #[test]
    fn invalid_channel_is_refused_without_commit() {
        let _g = error::exclusive();
        let mut rb = MockAdc::default();
        let res = feature::configure(&mut rb, &(ScanMode, RegularChannel(18, SampleTime::T_1)));
        assert_eq!(res, Err(Error::InvalidChannel));
        assert_eq!(rb.commits, 0);
    }

    #[test]
    fn reconfigure_keeps_old_config_on_failure() {
        let _g = error::exclusive();
        let mut adc = Adc::new(MockAdc::default(), reference_features()).unwrap();
        let before = adc.config().clone();

        assert!(adc.reconfigure(RegularChannel(42, SampleTime::T_1)).is_err());
        assert_eq!(adc.config(), &before);

        adc.reconfigure(RegularChannel(5, SampleTime::T_1)).unwrap();
        assert_eq!(adc.config().sequence.len(), 1);
        assert!(!adc.config().scan);
        assert_eq!(adc.release().commits, 2);
    }

    #[test]
    fn sequence_register_images() {
        let cfg = feature::compose::<AdcConfig, _>(&(
            RegularChannels::new(&[0, 1], SampleTime::T_71),
            RegularChannel(2, SampleTime::T_239),
            RegularChannel(12, SampleTime::T_13),
        ))
        .unwrap();

        let [sqr1, sqr2, sqr3] = cfg.sequence.sqr_bits();
        assert_eq!(sqr1, 3 << 20);
        assert_eq!(sqr2, 0);
        assert_eq!(sqr3, (1 << 5) | (2 << 10) | (12 << 15));

        let (smpr1, smpr2) = cfg.smpr_bits();
        assert_eq!(smpr2, (6 << 3) | (7 << 6) | 6);
        assert_eq!(smpr1, 2 << 6);
    }

    #[test]
    fn long_sequence_spills_into_sqr1() {
        let chans: [u8; 14] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14];
        let cfg =
            feature::compose::<AdcConfig, _>(&RegularChannels::new(&chans, SampleTime::T_1))
                .unwrap();
        let [sqr1, sqr2, _] = cfg.sequence.sqr_bits();
        assert_eq!(sqr1, (13 << 20) | 13 | (14 << 5));
        assert_eq!(sqr2 & 0b11111, 7);
    }

    #[test]
    fn clock_and_sample_range() {
        let cfg = feature::compose::<AdcConfig, _>(&ClockPrescaler(AdcPrescaler::Div6)).unwrap();
        assert_eq!(cfg.adc_clock(Hertz::MHz(72)), Hertz::MHz(12));
        assert_eq!(cfg.max_sample(), 4095);

        let cfg = feature::compose::<AdcConfig, _>(&AlignFeature(Align::Left)).unwrap();
        assert_eq!(cfg.max_sample(), u16::MAX);
    }

    #[test]
    fn read_is_non_blocking() {
        let mut adc = Adc::new(MockAdc::default(), ()).unwrap();
        assert_eq!(adc.read(), Err(nb::Error::WouldBlock));

        adc.start_regular_conversion();
        adc.rb.eoc = true;
        adc.rb.data = 0x0abc;
        assert!(adc.is_conversion_complete());
        assert_eq!(adc.read(), Ok(0x0abc));
        assert_eq!(adc.rb.started, 1);
    }
}
