//! Three ADC1 channels converted in scan mode and moved to memory by
//! circular DMA. The DMA complete interrupt wakes the main loop, which prints
//! one line per conversion group.
//!
//! Channels 0 and 1 (PA0, PA1) are sampled for 71.5 cycles, channel 2 (PA2)
//! for 239.5 cycles.

#![no_main]
#![no_std]

use panic_semihosting as _;

use core::cell::RefCell;

use cortex_m::singleton;
use cortex_m_rt::entry;
use cortex_m_semihosting::hprintln;
use critical_section::Mutex;

use stm32f1xx_compose::{
    adc::{
        Adc, AdcPrescaler, ClockPrescaler, DmaRequests, RegularChannel, RegularChannels,
        Resolution, ResolutionFeature, SampleTime, ScanMode,
    },
    dma::{dma1, DmaChannelDriver, DmaExt, Interrupts},
    event::ReadyFlag,
    pac::{self, interrupt, Interrupt},
};

type Transfer = DmaChannelDriver<'static, dma1::C1, &'static mut [u16; 3]>;

// Set by the DMA complete event, consumed by the main loop
static READY: ReadyFlag = ReadyFlag::new();

// Make the DMA driver available to the interrupt handler
static G_DMA: Mutex<RefCell<Option<Transfer>>> = Mutex::new(RefCell::new(None));

#[interrupt]
fn DMA1_CHANNEL1() {
    critical_section::with(|cs| {
        if let Some(dma) = G_DMA.borrow_ref_mut(cs).as_mut() {
            dma.on_interrupt();
        }
    });
}

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();

    // PA0..PA2 as analog inputs
    dp.RCC.apb2enr().modify(|_, w| w.iopaen().set_bit());
    dp.GPIOA
        .crl()
        .modify(|r, w| unsafe { w.bits(r.bits() & !0x0000_0fff) });

    let dma1 = dp.DMA1.split();

    // Running from HSI: PCLK2 = 8 MHz, ADC clock = 4 MHz
    let mut adc = Adc::new(
        dp.ADC1,
        (
            ClockPrescaler(AdcPrescaler::Div2),
            ResolutionFeature(Resolution::Bits12),
            RegularChannels::new(&[0, 1], SampleTime::T_71),
            RegularChannel(2, SampleTime::T_239),
            ScanMode,
            DmaRequests,
        ),
    )
    .unwrap();

    let mut dma: Transfer = DmaChannelDriver::new(dma1.1, adc.dma_source()).unwrap();
    dma.subscribe(&READY).unwrap();
    dma.enable_interrupts(Interrupts::COMPLETE);
    dma.begin_read(singleton!(: [u16; 3] = [0; 3]).unwrap())
        .unwrap();

    critical_section::with(|cs| G_DMA.borrow(cs).replace(Some(dma)));
    unsafe { cortex_m::peripheral::NVIC::unmask(Interrupt::DMA1_CHANNEL1) };

    loop {
        adc.start_regular_conversion();
        READY.wait();

        let group = critical_section::with(|cs| {
            G_DMA
                .borrow_ref(cs)
                .as_ref()
                .and_then(|dma| dma.buffer::<u16>().map(|b| [b[0], b[1], b[2]]))
        });
        if let Some([ch0, ch1, ch2]) = group {
            hprintln!("ch0 {} ch1 {} ch2 {}", ch0, ch1, ch2);
        }
    }
}
