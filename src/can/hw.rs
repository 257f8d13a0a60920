//! bxCAN controllers, driven through [`bxcan`]
//!
//! ```rust, ignore
//! let can = bxcan::Can::builder(Controller::new(dp.CAN, dp.USB)).leave_disabled();
//! let mut can = Can::new(can, (timing, Mode::Loopback))?;
//! ```
//!
//! Registers are only touched directly where bxcan has no API: the `TTCM`,
//! `RFLM` and `TXFP` options, the mailbox empty bits, the FIFO fill levels and
//! the last error code.

use bxcan::filter::{MasterFilters, Mask32};
use bxcan::{Fifo, Frame, Mailbox, OverrunError};

use super::{Can, CanConfig, CanInstance, LastErrorCode};
use crate::error::Subsystem;
use crate::feature::Peripheral;
use crate::pac::RCC;
use crate::Error;

#[cfg(not(feature = "connectivity"))]
use crate::pac::{CAN as CAN1, USB};
#[cfg(feature = "connectivity")]
use crate::pac::{CAN1, CAN2};

const MCR_TXFP: u32 = 1 << 2;
const MCR_RFLM: u32 = 1 << 3;
const MCR_ABOM: u32 = 1 << 6;
const MCR_TTCM: u32 = 1 << 7;
const TSR_TME0: u32 = 1 << 26;
const TSR_TME: u32 = 0b111 << 26;

// Polls of MSR while waiting for 11 recessive bits
const SYNC_POLLS: u32 = 100_000;

/// Register block of one controller, owned by a [`bxcan::Can`]
pub struct Controller<CAN> {
    _can: CAN,
}

/// A controller as handed to [`Can::new`]
pub type BxCan<CAN> = bxcan::Can<Controller<CAN>>;

fn enable_clock(bit: u8) {
    // NOTE(unsafe) this modifies only the bit owned by this controller
    let rcc = unsafe { &*RCC::ptr() };
    rcc.apb1enr()
        .modify(|r, w| unsafe { w.bits(r.bits() | (1 << bit)) });
    // Stall the pipeline to work around erratum 2.1.13 (DM00037591)
    cortex_m::asm::dsb();
}

impl Controller<CAN1> {
    /// Enables the controller clock.
    ///
    /// CAN shares SRAM with the USB peripheral. Take ownership of USB to
    /// prevent accidental shared usage.
    #[cfg(not(feature = "connectivity"))]
    pub fn new(can: CAN1, _usb: USB) -> Self {
        enable_clock(25);
        Self { _can: can }
    }

    /// Enables the controller clock.
    #[cfg(feature = "connectivity")]
    pub fn new(can: CAN1) -> Self {
        enable_clock(25);
        Self { _can: can }
    }
}

#[cfg(feature = "connectivity")]
impl Controller<CAN2> {
    /// Enables the controller clock.
    ///
    /// CAN2 receives through the filter banks CAN1 splits off, see
    /// [`Can::modify_filters`].
    pub fn new(can: CAN2) -> Self {
        enable_clock(26);
        Self { _can: can }
    }
}

unsafe impl bxcan::Instance for Controller<CAN1> {
    const REGISTERS: *mut bxcan::RegisterBlock = CAN1::ptr() as *mut _;
}

unsafe impl bxcan::FilterOwner for Controller<CAN1> {
    #[cfg(not(feature = "connectivity"))]
    const NUM_FILTER_BANKS: u8 = 14;
    #[cfg(feature = "connectivity")]
    const NUM_FILTER_BANKS: u8 = 28;
}

#[cfg(feature = "connectivity")]
unsafe impl bxcan::MasterInstance for Controller<CAN1> {}

#[cfg(feature = "connectivity")]
unsafe impl bxcan::Instance for Controller<CAN2> {
    const REGISTERS: *mut bxcan::RegisterBlock = CAN2::ptr() as *mut _;
}

impl Can<BxCan<CAN1>> {
    /// Filter banks, including the ones split off for CAN2.
    ///
    /// Bank 0 accepts everything into FIFO 0 after every (re)configuration.
    pub fn modify_filters(&mut self) -> MasterFilters<'_, Controller<CAN1>> {
        self.can.modify_filters()
    }
}

fn accept_all(can: &mut BxCan<CAN1>) {
    can.modify_filters()
        .enable_bank(0, Fifo::Fifo0, Mask32::accept_all());
}

#[cfg(feature = "connectivity")]
fn slave_filters(_can: &mut BxCan<CAN2>) {}

/// Leaves sleep mode once the controller has seen the bus idle
fn sync<I: bxcan::Instance>(
    can: &mut bxcan::Can<I>,
    msr: impl Fn() -> u32,
) -> Result<(), Error> {
    for _ in 0..SYNC_POLLS {
        if can.enable_non_blocking().is_ok() {
            return Ok(());
        }
    }
    warn!("can: bus never went idle");
    Err(Error::Timeout.latch(Subsystem::Can, msr()))
}

fn receive<I: bxcan::Instance>(
    can: &mut bxcan::Can<I>,
    fifo: Fifo,
) -> nb::Result<Frame, OverrunError> {
    match fifo {
        Fifo::Fifo0 => can.rx0().receive(),
        Fifo::Fifo1 => can.rx1().receive(),
    }
}

macro_rules! can_hw {
    ($(
        $(#[$attr:meta])*
        $CAN:ident: $filters:ident,
    )+) => {
        $(
            $(#[$attr])*
            impl Peripheral for BxCan<$CAN> {
                type Config = CanConfig;

                fn commit(&mut self, cfg: &CanConfig) -> Result<(), Error> {
                    // NOTE(unsafe) only registers bxcan leaves alone are written
                    let regs = unsafe { &*$CAN::ptr() };
                    let options = MCR_TTCM | MCR_RFLM | MCR_TXFP;

                    let init = self
                        .modify_config()
                        .set_bit_timing(cfg.timing.btr())
                        .set_loopback(cfg.mode.is_loopback())
                        .set_silent(cfg.mode.is_silent())
                        .set_automatic_retransmit(cfg.auto_retransmit);
                    regs.mcr().modify(|r, w| unsafe {
                        w.bits((r.bits() & !options) | (cfg.mcr_bits() & options))
                    });
                    init.leave_disabled();

                    self.set_automatic_wakeup(cfg.auto_wakeup);
                    $filters(self);
                    sync(self, || regs.msr().read().bits())?;

                    // enabling always turns ABOM on
                    if !cfg.auto_bus_off {
                        regs.mcr().modify(|r, w| unsafe { w.bits(r.bits() & !MCR_ABOM) });
                    }
                    Ok(())
                }
            }

            $(#[$attr])*
            impl CanInstance for BxCan<$CAN> {
                fn transmit(&mut self, frame: &Frame) -> Option<Mailbox> {
                    // bxcan evicts a lower priority frame when all mailboxes are busy
                    let regs = unsafe { &*$CAN::ptr() };
                    if regs.tsr().read().bits() & TSR_TME == 0 {
                        return None;
                    }
                    bxcan::Can::transmit(self, frame)
                        .ok()
                        .map(|status| status.mailbox())
                }

                fn is_pending(&self, mailbox: Mailbox) -> bool {
                    let regs = unsafe { &*$CAN::ptr() };
                    regs.tsr().read().bits() & (TSR_TME0 << mailbox as u32) == 0
                }

                fn pending_messages(&self, fifo: Fifo) -> u8 {
                    let regs = unsafe { &*$CAN::ptr() };
                    (regs.rfr(fifo as usize).read().bits() & 0b11) as u8
                }

                fn read_fifo(&mut self, fifo: Fifo) -> Option<Frame> {
                    match receive(self, fifo) {
                        Ok(frame) => Some(frame),
                        Err(nb::Error::WouldBlock) => None,
                        Err(nb::Error::Other(_)) => {
                            warn!("can: rx fifo overrun");
                            receive(self, fifo).ok()
                        }
                    }
                }

                fn take_last_error(&mut self) -> Option<LastErrorCode> {
                    let regs = unsafe { &*$CAN::ptr() };
                    let esr = regs.esr().read().bits();
                    let lec = LastErrorCode::from_bits(((esr >> 4) & 0b111) as u8);
                    if lec.is_some() {
                        regs.esr().write(|w| unsafe { w.bits(esr & !(0b111 << 4)) });
                    }
                    lec
                }

                fn sleep(&mut self) {
                    bxcan::Can::sleep(self);
                }

                fn wakeup(&mut self) {
                    bxcan::Can::wakeup(self);
                }
            }
        )+
    };
}

can_hw! {
    CAN1: accept_all,
    #[cfg(feature = "connectivity")]
    CAN2: slave_filters,
}
