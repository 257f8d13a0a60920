//! # Controller Area Network (CAN) Interface
//!
//! A [`Can`] driver is built from features writing a [`CanConfig`]. Frames,
//! identifiers, mailboxes and FIFOs are the [`bxcan`] types.
//!
//! ```rust, ignore
//! let timing = BitTiming::for_bitrate(clocks.pclk1(), 500.kHz())?;
//! let can = bxcan::Can::builder(Controller::new(dp.CAN, dp.USB)).leave_disabled();
//! let mut can = Can::new(can, (timing, Mode::Loopback, NoAutoRetransmit))?;
//!
//! let mailbox = can.send(StandardId::new(0x500).unwrap(), &[0xde, 0xad])?;
//! while can.transmission_pending(mailbox) {}
//! let frame = nb::block!(can.receive(Fifo::Fifo0)).unwrap();
//! ```
//!
//! None of the operations wait on the bus: `send` fails when every transmit
//! mailbox is busy and `receive` returns `WouldBlock` when the FIFO is empty.
//!
//! ## Alternate function remapping
//!
//! TX: Alternate Push-Pull Output
//! RX: Input Floating Input
//!
//! ### CAN1
//!
//! | Function | NoRemap | Remap |
//! |----------|---------|-------|
//! | TX       | PA12    | PB9   |
//! | RX       | PA11    | PB8   |
//!
//! ### CAN2
//!
//! | Function | NoRemap | Remap |
//! |----------|---------|-------|
//! | TX       | PB6     | PB13  |
//! | RX       | PB5     | PB12  |

use core::convert::Infallible;

pub use bxcan::{ExtendedId, Fifo, Frame, Id, Mailbox, StandardId};
use bxcan::Data;
use fugit::HertzU32 as Hertz;

use crate::error::Subsystem;
use crate::feature::{self, Feature, Peripheral};
use crate::Error;

#[cfg(all(feature = "device-selected", feature = "has-can"))]
mod hw;
#[cfg(all(feature = "device-selected", feature = "has-can"))]
pub use self::hw::{BxCan, Controller};

/// Native status reported when no transmit mailbox is free
const NO_MAILBOX: u32 = 4;

/// Last error code (`ESR.LEC`) of the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LastErrorCode {
    Stuff,
    Form,
    Ack,
    BitRecessive,
    BitDominant,
    Crc,
    /// Set by software
    Software,
}

impl LastErrorCode {
    /// Decodes `ESR.LEC`; `0` means no error
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 0b111 {
            1 => Self::Stuff,
            2 => Self::Form,
            3 => Self::Ack,
            4 => Self::BitRecessive,
            5 => Self::BitDominant,
            6 => Self::Crc,
            7 => Self::Software,
            _ => return None,
        })
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Stuff => 1,
            Self::Form => 2,
            Self::Ack => 3,
            Self::BitRecessive => 4,
            Self::BitDominant => 5,
            Self::Crc => 6,
            Self::Software => 7,
        }
    }

    /// Code stored in the error register
    pub fn code(self) -> u8 {
        self.bits() << 4
    }
}

/// Bit timing in time quanta
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitTiming {
    /// 1..=1024
    pub prescaler: u16,
    /// Resynchronisation jump width, 1..=4
    pub sjw: u8,
    /// Time segment 1, 1..=16
    pub bs1: u8,
    /// Time segment 2, 1..=8
    pub bs2: u8,
}

impl Default for BitTiming {
    fn default() -> Self {
        Self::from_btr(0x0123_0000)
    }
}

impl BitTiming {
    /// Decodes the timing fields of a `BTR` value
    pub const fn from_btr(btr: u32) -> Self {
        Self {
            prescaler: (btr & 0x3ff) as u16 + 1,
            bs1: ((btr >> 16) & 0xf) as u8 + 1,
            bs2: ((btr >> 20) & 0x7) as u8 + 1,
            sjw: ((btr >> 24) & 0x3) as u8 + 1,
        }
    }

    /// Timing fields of `BTR`.
    ///
    /// Zero fields encode as their minimum; out of range fields are masked.
    pub fn btr(&self) -> u32 {
        (u32::from(self.sjw.saturating_sub(1) & 0x3) << 24)
            | (u32::from(self.bs2.saturating_sub(1) & 0x7) << 20)
            | (u32::from(self.bs1.saturating_sub(1) & 0xf) << 16)
            | u32::from(self.prescaler.saturating_sub(1) & 0x3ff)
    }

    /// Time quanta per bit
    pub fn quanta(&self) -> u32 {
        1 + u32::from(self.bs1) + u32::from(self.bs2)
    }

    /// Finds an exact timing for `bitrate` with the sample point close to
    /// 87.5 %, preferring more quanta per bit.
    pub fn for_bitrate(pclk1: Hertz, bitrate: Hertz) -> Result<Self, Error> {
        let clk = pclk1.raw();
        let rate = bitrate.raw();
        if rate == 0 {
            return Err(Error::Unsupported.latch(Subsystem::Can, 0));
        }
        for quanta in (8..=25u32).rev() {
            let Some(per_bit) = rate.checked_mul(quanta) else {
                continue;
            };
            if clk % per_bit != 0 {
                continue;
            }
            let prescaler = clk / per_bit;
            if !(1..=1024).contains(&prescaler) {
                continue;
            }
            let bs2 = ((quanta + 4) / 8).clamp(1, 8);
            let bs1 = quanta - 1 - bs2;
            if !(1..=16).contains(&bs1) {
                continue;
            }
            return Ok(Self {
                prescaler: prescaler as u16,
                sjw: 1,
                bs1: bs1 as u8,
                bs2: bs2 as u8,
            });
        }
        warn!("can: no timing for {=u32} bit/s", rate);
        Err(Error::Unsupported.latch(Subsystem::Can, rate))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    #[default]
    Normal,
    /// Transmitted frames are received back, TX stays recessive on the bus
    Loopback,
    /// Receive only
    Silent,
    SilentLoopback,
}

impl Mode {
    pub fn is_loopback(self) -> bool {
        matches!(self, Mode::Loopback | Mode::SilentLoopback)
    }

    pub fn is_silent(self) -> bool {
        matches!(self, Mode::Silent | Mode::SilentLoopback)
    }
}

/// CAN configuration descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanConfig {
    pub timing: BitTiming,
    pub mode: Mode,
    pub auto_bus_off: bool,
    pub auto_wakeup: bool,
    pub auto_retransmit: bool,
    /// Drop new frames instead of overwriting the oldest on FIFO overrun
    pub rx_fifo_locked: bool,
    /// Send by request order instead of identifier priority
    pub tx_fifo_priority: bool,
    pub time_triggered: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            timing: BitTiming::default(),
            mode: Mode::default(),
            auto_bus_off: false,
            auto_wakeup: false,
            auto_retransmit: true,
            rx_fifo_locked: false,
            tx_fifo_priority: false,
            time_triggered: false,
        }
    }
}

impl CanConfig {
    /// `BTR` value: timing plus the loopback and silent bits
    pub fn btr_bits(&self) -> u32 {
        self.timing.btr()
            | (u32::from(self.mode.is_silent()) << 31)
            | (u32::from(self.mode.is_loopback()) << 30)
    }

    /// Option bits of `MCR` (`TTCM`, `ABOM`, `AWUM`, `NART`, `RFLM`, `TXFP`)
    pub fn mcr_bits(&self) -> u32 {
        (u32::from(self.time_triggered) << 7)
            | (u32::from(self.auto_bus_off) << 6)
            | (u32::from(self.auto_wakeup) << 5)
            | (u32::from(!self.auto_retransmit) << 4)
            | (u32::from(self.rx_fifo_locked) << 3)
            | (u32::from(self.tx_fifo_priority) << 2)
    }
}

impl Feature<CanConfig> for BitTiming {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        let t = self;
        if !(1..=1024).contains(&t.prescaler)
            || !(1..=4).contains(&t.sjw)
            || !(1..=16).contains(&t.bs1)
            || !(1..=8).contains(&t.bs2)
        {
            return Err(Error::Unsupported);
        }
        cfg.timing = *t;
        Ok(())
    }
}

impl Feature<CanConfig> for Mode {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.mode = *self;
        Ok(())
    }
}

/// Leave bus-off automatically after 128 x 11 recessive bits
#[derive(Clone, Copy, Debug)]
pub struct AutoBusOff;

impl Feature<CanConfig> for AutoBusOff {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.auto_bus_off = true;
        Ok(())
    }
}

/// Leave sleep mode on bus activity
#[derive(Clone, Copy, Debug)]
pub struct AutoWakeup;

impl Feature<CanConfig> for AutoWakeup {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.auto_wakeup = true;
        Ok(())
    }
}

/// Send every frame once, whatever the outcome
#[derive(Clone, Copy, Debug)]
pub struct NoAutoRetransmit;

impl Feature<CanConfig> for NoAutoRetransmit {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.auto_retransmit = false;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RxFifoLocked;

impl Feature<CanConfig> for RxFifoLocked {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.rx_fifo_locked = true;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TxFifoPriority;

impl Feature<CanConfig> for TxFifoPriority {
    #[inline]
    fn apply(&self, cfg: &mut CanConfig) -> Result<(), Error> {
        cfg.tx_fifo_priority = true;
        Ok(())
    }
}

/// Register level access to one bxCAN controller
pub trait CanInstance: Peripheral<Config = CanConfig> {
    /// Puts `frame` into a free mailbox, `None` if all three are busy
    fn transmit(&mut self, frame: &Frame) -> Option<Mailbox>;
    fn is_pending(&self, mailbox: Mailbox) -> bool;
    /// Messages waiting in `fifo`
    fn pending_messages(&self, fifo: Fifo) -> u8;
    /// Reads and releases the oldest message of `fifo`
    fn read_fifo(&mut self, fifo: Fifo) -> Option<Frame>;
    /// Reads and clears `ESR.LEC`
    fn take_last_error(&mut self) -> Option<LastErrorCode>;
    fn sleep(&mut self);
    fn wakeup(&mut self);
}

/// CAN driver
pub struct Can<CAN> {
    can: CAN,
    cfg: CanConfig,
}

impl<CAN: CanInstance> Can<CAN> {
    /// Composes `features`, commits them to `can` and leaves initialisation.
    pub fn new<F>(mut can: CAN, features: F) -> Result<Self, Error>
    where
        F: Feature<CanConfig>,
    {
        let cfg = feature::compose(&features).map_err(|e| e.latch(Subsystem::Can, 0))?;
        can.commit(&cfg)?;
        debug!("can configured, btr {=u32:#x}", cfg.btr_bits());
        Ok(Self { can, cfg })
    }

    pub fn reconfigure<F>(&mut self, features: F) -> Result<(), Error>
    where
        F: Feature<CanConfig>,
    {
        let cfg = feature::compose(&features).map_err(|e| e.latch(Subsystem::Can, 0))?;
        self.can.commit(&cfg)?;
        self.cfg = cfg;
        Ok(())
    }

    pub fn config(&self) -> &CanConfig {
        &self.cfg
    }

    /// Queues a data frame.
    ///
    /// Fails with [`Error::InvalidLength`] for more than 8 bytes and with
    /// [`Error::NoMailboxAvailable`] if every mailbox is busy.
    pub fn send(&mut self, id: impl Into<Id>, data: &[u8]) -> Result<Mailbox, Error> {
        let data = Data::new(data)
            .ok_or_else(|| Error::InvalidLength.latch(Subsystem::Can, data.len() as u32))?;
        self.send_frame(&Frame::new_data(id, data))
    }

    /// Queues a remote frame requesting `dlc` bytes
    pub fn send_remote_frame(&mut self, id: impl Into<Id>, dlc: u8) -> Result<Mailbox, Error> {
        if dlc > 8 {
            return Err(Error::InvalidLength.latch(Subsystem::Can, u32::from(dlc)));
        }
        self.send_frame(&Frame::new_remote(id, dlc))
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<Mailbox, Error> {
        self.can
            .transmit(frame)
            .ok_or_else(|| Error::NoMailboxAvailable.latch(Subsystem::Can, NO_MAILBOX))
    }

    /// Returns `true` while `mailbox` still holds an unsent frame
    pub fn transmission_pending(&self, mailbox: Mailbox) -> bool {
        self.can.is_pending(mailbox)
    }

    pub fn ready_to_receive(&self, fifo: Fifo) -> bool {
        self.can.pending_messages(fifo) > 0
    }

    /// Returns the oldest message of `fifo`, `WouldBlock` if it is empty
    pub fn receive(&mut self, fifo: Fifo) -> nb::Result<Frame, Infallible> {
        if !self.ready_to_receive(fifo) {
            return Err(nb::Error::WouldBlock);
        }
        self.can.read_fifo(fifo).ok_or(nb::Error::WouldBlock)
    }

    /// Drains the controller's last error code.
    ///
    /// Returns `true` and latches [`Error::Bus`] if there was one.
    pub fn has_errors(&mut self) -> bool {
        match self.can.take_last_error() {
            Some(lec) => {
                Error::Bus(lec).latch(Subsystem::Can, u32::from(lec.bits()));
                true
            }
            None => false,
        }
    }

    /// Requests sleep mode
    pub fn sleep(&mut self) {
        self.can.sleep();
    }

    /// Leaves sleep mode
    pub fn wakeup(&mut self) {
        self.can.wakeup();
    }

    pub fn release(self) -> CAN {
        self.can
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockCan {
        commits: usize,
        mailboxes: [Option<Frame>; 3],
        fifo0: VecDeque<Frame>,
        lec: u8,
        asleep: bool,
        loopback: bool,
    }

    impl Peripheral for MockCan {
        type Config = CanConfig;
        fn commit(&mut self, cfg: &CanConfig) -> Result<(), Error> {
            self.commits += 1;
            self.loopback = cfg.mode.is_loopback();
            Ok(())
        }
    }

    impl CanInstance for MockCan {
        fn transmit(&mut self, frame: &Frame) -> Option<Mailbox> {
            let idx = self.mailboxes.iter().position(Option::is_none)?;
            if self.loopback {
                self.fifo0.push_back(frame.clone());
            } else {
                self.mailboxes[idx] = Some(frame.clone());
            }
            Some(match idx {
                0 => Mailbox::Mailbox0,
                1 => Mailbox::Mailbox1,
                _ => Mailbox::Mailbox2,
            })
        }
        fn is_pending(&self, mailbox: Mailbox) -> bool {
            self.mailboxes[mailbox as usize].is_some()
        }
        fn pending_messages(&self, fifo: Fifo) -> u8 {
            match fifo {
                Fifo::Fifo0 => self.fifo0.len() as u8,
                Fifo::Fifo1 => 0,
            }
        }
        fn read_fifo(&mut self, fifo: Fifo) -> Option<Frame> {
            match fifo {
                Fifo::Fifo0 => self.fifo0.pop_front(),
                Fifo::Fifo1 => None,
            }
        }
        fn take_last_error(&mut self) -> Option<LastErrorCode> {
            LastErrorCode::from_bits(core::mem::take(&mut self.lec))
        }
        fn sleep(&mut self) {
            self.asleep = true;
        }
        fn wakeup(&mut self) {
            self.asleep = false;
        }
    }

    fn id(raw: u16) -> StandardId {
        StandardId::new(raw).unwrap()
    }

    #[test]
    fn full_mailboxes_latch_no_mailbox() {
        let _g = error::exclusive();
        let mut can = Can::new(MockCan::default(), ()).unwrap();

        let boxes = [
            can.send(id(0x100), &[1]).unwrap(),
            can.send(id(0x101), &[2]).unwrap(),
            can.send(id(0x102), &[3]).unwrap(),
        ];
        assert_eq!(
            boxes,
            [Mailbox::Mailbox0, Mailbox::Mailbox1, Mailbox::Mailbox2]
        );
        assert!(!error::has_pending_error());

        assert_eq!(can.send(id(0x103), &[4]), Err(Error::NoMailboxAvailable));
        assert_eq!(
            error::last_error(),
            Some(error::ErrorRecord {
                subsystem: Subsystem::Can,
                code: 1,
                native: 4,
            })
        );
        assert!(can.transmission_pending(Mailbox::Mailbox1));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let _g = error::exclusive();
        let mut can = Can::new(MockCan::default(), ()).unwrap();
        assert_eq!(can.send(id(1), &[0; 9]), Err(Error::InvalidLength));
        assert_eq!(can.send_remote_frame(id(1), 9), Err(Error::InvalidLength));
        assert!(!can.transmission_pending(Mailbox::Mailbox0));

        let mb = can.send_remote_frame(id(1), 2).unwrap();
        assert!(can.transmission_pending(mb));
    }

    #[test]
    fn receive_never_waits() {
        let mut can = Can::new(MockCan::default(), Mode::Loopback).unwrap();
        assert!(!can.ready_to_receive(Fifo::Fifo0));
        assert_eq!(can.receive(Fifo::Fifo0), Err(nb::Error::WouldBlock));

        let frame = Frame::new_data(id(0x7ff), [0xde, 0xad]);
        can.can.fifo0.push_back(frame.clone());
        assert!(can.ready_to_receive(Fifo::Fifo0));
        assert_eq!(can.receive(Fifo::Fifo0), Ok(frame));
        assert_eq!(can.receive(Fifo::Fifo0), Err(nb::Error::WouldBlock));
        assert_eq!(can.receive(Fifo::Fifo1), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn frames_keep_their_shape() {
        let mut can = Can::new(MockCan::default(), Mode::Loopback).unwrap();
        let std_id = id(0x7ff);
        let ext_id = ExtendedId::new(0x1fff_ffff).unwrap();

        can.send(std_id, &[]).unwrap();
        can.send(ext_id, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        can.send_remote_frame(std_id, 8).unwrap();
        can.send_remote_frame(ext_id, 0).unwrap();

        let expected: [(Id, bool, u8, &[u8]); 4] = [
            (std_id.into(), false, 0, &[]),
            (ext_id.into(), false, 8, &[1, 2, 3, 4, 5, 6, 7, 8]),
            (std_id.into(), true, 8, &[]),
            (ext_id.into(), true, 0, &[]),
        ];
        for (id, remote, dlc, data) in expected {
            let frame = can.receive(Fifo::Fifo0).unwrap();
            assert_eq!(frame.id(), id);
            assert_eq!(frame.is_remote_frame(), remote);
            assert_eq!(frame.dlc(), dlc);
            assert_eq!(frame.data().map(|d| &d[..]).unwrap_or(&[]), data);
        }
        assert_eq!(can.receive(Fifo::Fifo0), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn has_errors_drains_last_error_code() {
        let _g = error::exclusive();
        let mut can = Can::new(MockCan::default(), ()).unwrap();
        assert!(!can.has_errors());
        assert!(!error::has_pending_error());

        can.can.lec = 3;
        assert!(can.has_errors());
        let rec = error::take_error().unwrap();
        assert_eq!(rec.subsystem, Subsystem::Can);
        assert_eq!(rec.code, 0x30);
        assert_eq!(rec.native, 3);

        assert!(!can.has_errors());
        assert!(!error::has_pending_error());
    }

    #[test]
    fn option_bits() {
        let cfg: CanConfig = feature::compose(&(
            Mode::SilentLoopback,
            NoAutoRetransmit,
            AutoBusOff,
            TxFifoPriority,
        ))
        .unwrap();
        assert_eq!(cfg.mcr_bits(), (1 << 6) | (1 << 4) | (1 << 2));
        assert_eq!(cfg.btr_bits() >> 30, 0b11);

        assert_eq!(CanConfig::default().mcr_bits(), 0);
        assert_eq!(CanConfig::default().btr_bits(), 0x0123_0000);
    }

    #[test]
    fn bit_timing_search() {
        let t = BitTiming::for_bitrate(Hertz::MHz(36), Hertz::kHz(500)).unwrap();
        assert_eq!(36_000_000 / (u32::from(t.prescaler) * t.quanta()), 500_000);
        assert_eq!((t.prescaler, t.bs1, t.bs2), (4, 15, 2));
        assert_eq!(BitTiming::from_btr(t.btr()), t);

        let t = BitTiming::for_bitrate(Hertz::MHz(8), Hertz::kHz(125)).unwrap();
        assert_eq!(8_000_000 / (u32::from(t.prescaler) * t.quanta()), 125_000);
    }

    #[test]
    fn zero_timing_fields_encode_as_minimum() {
        let zero = BitTiming {
            prescaler: 0,
            sjw: 0,
            bs1: 0,
            bs2: 0,
        };
        assert_eq!(zero.btr(), 0);
        assert_eq!(
            BitTiming::from_btr(zero.btr()),
            BitTiming {
                prescaler: 1,
                sjw: 1,
                bs1: 1,
                bs2: 1,
            }
        );
    }

    #[test]
    fn impossible_bitrate_fails() {
        let _g = error::exclusive();
        assert_eq!(
            BitTiming::for_bitrate(Hertz::MHz(8), Hertz::MHz(3)),
            Err(Error::Unsupported)
        );
        let bad = BitTiming {
            prescaler: 1,
            sjw: 1,
            bs1: 17,
            bs2: 1,
        };
        let mut block = MockCan::default();
        assert_eq!(
            feature::configure(&mut block, &bad),
            Err(Error::Unsupported)
        );
        assert_eq!(block.commits, 0);
    }

    #[test]
    fn sleep_and_release() {
        let mut can = Can::new(MockCan::default(), AutoWakeup).unwrap();
        assert!(can.config().auto_wakeup);
        can.sleep();
        assert!(can.can.asleep);
        can.wakeup();
        assert!(!can.can.asleep);

        can.reconfigure(()).unwrap();
        assert!(!can.config().auto_wakeup);
        assert_eq!(can.release().commits, 2);
    }
}
