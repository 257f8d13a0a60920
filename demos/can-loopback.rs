//! Sends a few frames in silent loopback mode and reads them back.
//! Does not require additional transceiver hardware.

#![no_main]
#![no_std]

use panic_semihosting as _;

use cortex_m_rt::entry;
use cortex_m_semihosting::hprintln;
use nb::block;

use stm32f1xx_compose::{
    can::{BitTiming, Can, Controller, ExtendedId, Fifo, Mode, NoAutoRetransmit, StandardId},
    error,
    pac,
    prelude::*,
};

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();

    // Running from HSI: PCLK1 = 8 MHz
    let timing = BitTiming::for_bitrate(8.MHz(), 500.kHz()).unwrap();

    // Use loopback mode: No pins need to be assigned to peripheral.
    let can = bxcan::Can::builder(Controller::new(dp.CAN, dp.USB)).leave_disabled();
    let mut can = Can::new(can, (timing, Mode::SilentLoopback, NoAutoRetransmit)).unwrap();

    let standard = StandardId::new(0x123).unwrap();
    let extended = ExtendedId::new(0x1234_5678).unwrap();

    can.send(standard, &[0x01, 0x02, 0x03]).unwrap();
    can.send(extended, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
    can.send_remote_frame(standard, 2).unwrap();

    for _ in 0..3 {
        let frame = block!(can.receive(Fifo::Fifo0)).unwrap();
        hprintln!("{:?}", frame);
    }

    if can.has_errors() {
        hprintln!("bus error: {:?}", error::take_error());
    }

    loop {
        cortex_m::asm::wfi();
    }
}
