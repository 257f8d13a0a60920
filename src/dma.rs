//! # Direct Memory Access
//!
//! A [`DmaChannelDriver`] wraps one DMA channel configured from features, a
//! caller provided buffer and a [`Publisher`] of [`DmaEvent`]s.
//!
//! ```text
//!            begin_read                         Complete (one-shot)
//!   Idle ──────────────▶ Armed ─▶ Transferring ───────────────────▶ Complete
//!    ▲                               │   ▲ │                           │
//!    │ stop (any state)              │   └─┘ Complete (circular)      │ begin_read
//!    │                               └──────────────▶ Error ──────────┘
//! ```
//!
//! The channel interrupt handler calls [`DmaChannelDriver::on_interrupt`],
//! which reads and clears the hardware flags, advances the state machine and
//! publishes one event per flag to the subscribers.

use core::sync::atomic::{compiler_fence, Ordering};

use bitflags::bitflags;
use embedded_dma::WriteBuffer;

use crate::error::Subsystem;
use crate::event::{Publisher, ReadyFlag, Subscriber, SubscriptionHandle};
use crate::feature::{self, Feature, Peripheral};
use crate::Error;

#[cfg(feature = "device-selected")]
mod hw;
#[cfg(feature = "device-selected")]
pub use self::hw::*;

bitflags! {
    /// Channel interrupt sources (and the matching status flags)
    #[derive(Default)]
    pub struct Interrupts: u8 {
        const HALF_COMPLETE = 0b001;
        const COMPLETE = 0b010;
        const ERROR = 0b100;
    }
}

/// Event published by a [`DmaChannelDriver`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaEvent {
    HalfComplete,
    Complete,
    Error,
}

/// Transfer state of a [`DmaChannelDriver`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No transfer armed
    Idle,
    /// Buffer programmed, channel not yet enabled
    Armed,
    /// Hardware is moving data
    Transferring,
    /// One-shot transfer finished
    Complete,
    /// Controller reported a transfer error
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    #[default]
    PeripheralToMemory,
    MemoryToPeripheral,
    /// Reads from the "peripheral" address, writes to the buffer
    MemoryToMemory,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl Priority {
    pub fn bits(self) -> u8 {
        match self {
            Priority::Low => 0b00,
            Priority::Medium => 0b01,
            Priority::High => 0b10,
            Priority::VeryHigh => 0b11,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WordSize {
    #[default]
    Bits8,
    Bits16,
    Bits32,
}

impl WordSize {
    pub fn bits(self) -> u8 {
        match self {
            WordSize::Bits8 => 0b00,
            WordSize::Bits16 => 0b01,
            WordSize::Bits32 => 0b10,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            WordSize::Bits8 => 1,
            WordSize::Bits16 => 2,
            WordSize::Bits32 => 4,
        }
    }
}

/// DMA channel configuration descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaConfig {
    pub direction: Direction,
    /// Reload the transfer counter after each complete transfer
    pub circular: bool,
    pub priority: Priority,
    pub memory_size: WordSize,
    pub peripheral_size: WordSize,
    pub memory_increment: bool,
    pub peripheral_increment: bool,
    pub peripheral_address: u32,
    pub interrupts: Interrupts,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            direction: Direction::default(),
            circular: false,
            priority: Priority::default(),
            memory_size: WordSize::default(),
            peripheral_size: WordSize::default(),
            memory_increment: true,
            peripheral_increment: false,
            peripheral_address: 0,
            interrupts: Interrupts::empty(),
        }
    }
}

impl DmaConfig {
    /// `CCR` register value, channel disabled.
    ///
    /// Circular mode is dropped for memory to memory transfers, the
    /// controller does not support the combination.
    pub fn ccr_bits(&self) -> u32 {
        let mem2mem = self.direction == Direction::MemoryToMemory;
        let mut ccr = 0;
        if self.interrupts.contains(Interrupts::COMPLETE) {
            ccr |= 1 << 1;
        }
        if self.interrupts.contains(Interrupts::HALF_COMPLETE) {
            ccr |= 1 << 2;
        }
        if self.interrupts.contains(Interrupts::ERROR) {
            ccr |= 1 << 3;
        }
        if self.direction == Direction::MemoryToPeripheral {
            ccr |= 1 << 4;
        }
        if self.circular && !mem2mem {
            ccr |= 1 << 5;
        }
        if self.peripheral_increment {
            ccr |= 1 << 6;
        }
        if self.memory_increment {
            ccr |= 1 << 7;
        }
        ccr |= (self.peripheral_size.bits() as u32) << 8;
        ccr |= (self.memory_size.bits() as u32) << 10;
        ccr |= (self.priority.bits() as u32) << 12;
        if mem2mem {
            ccr |= 1 << 14;
        }
        ccr
    }
}

/// Reloads the transfer after completion
#[derive(Clone, Copy, Debug)]
pub struct Circular;

impl Feature<DmaConfig> for Circular {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.circular = true;
        Ok(())
    }
}

/// Stops after one transfer
#[derive(Clone, Copy, Debug)]
pub struct OneShot;

impl Feature<DmaConfig> for OneShot {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.circular = false;
        Ok(())
    }
}

impl Feature<DmaConfig> for Direction {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.direction = *self;
        Ok(())
    }
}

impl Feature<DmaConfig> for Priority {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.priority = *self;
        Ok(())
    }
}

/// Enables the given interrupt sources at configuration time
impl Feature<DmaConfig> for Interrupts {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.interrupts.insert(*self);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WordSizes {
    pub memory: WordSize,
    pub peripheral: WordSize,
}

impl Feature<DmaConfig> for WordSizes {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.memory_size = self.memory;
        cfg.peripheral_size = self.peripheral;
        Ok(())
    }
}

/// Peripheral side address; `inc` increments it after every word
#[derive(Clone, Copy, Debug)]
pub struct PeripheralAddress {
    pub address: u32,
    pub inc: bool,
}

impl Feature<DmaConfig> for PeripheralAddress {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.peripheral_address = self.address;
        cfg.peripheral_increment = self.inc;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryIncrement(pub bool);

impl Feature<DmaConfig> for MemoryIncrement {
    #[inline]
    fn apply(&self, cfg: &mut DmaConfig) -> Result<(), Error> {
        cfg.memory_increment = self.0;
        Ok(())
    }
}

/// Register level access to one DMA channel
pub trait DmaChannel: Peripheral<Config = DmaConfig> {
    /// Associated peripheral `address`
    ///
    /// `inc` indicates whether the address will be incremented after every byte transfer
    fn set_peripheral_address(&mut self, address: u32, inc: bool);

    /// `address` where from/to data will be read/write
    ///
    /// `inc` indicates whether the address will be incremented after every byte transfer
    fn set_memory_address(&mut self, address: u32, inc: bool);

    /// Number of words to transfer
    fn set_transfer_length(&mut self, len: usize);

    /// Starts the DMA transfer
    fn start(&mut self);

    /// Disables the channel and clears its flags
    fn stop(&mut self);

    /// Words left in the current transfer
    fn remaining(&self) -> usize;

    /// Reads and clears the channel's status flags
    fn take_flags(&mut self) -> Interrupts;

    fn listen(&mut self, irq: Interrupts);

    fn unlisten(&mut self, irq: Interrupts);
}

/// DMA channel driver with interrupt driven completion
///
/// `N` is the subscriber capacity.
pub struct DmaChannelDriver<'a, CH, B, const N: usize = 2> {
    channel: CH,
    cfg: DmaConfig,
    state: State,
    buffer: Option<B>,
    events: Publisher<'a, DmaEvent, N>,
}

impl<'a, CH, B, const N: usize> DmaChannelDriver<'a, CH, B, N>
where
    CH: DmaChannel,
{
    /// Composes `features` and commits them to `channel`.
    pub fn new<F>(mut channel: CH, features: F) -> Result<Self, Error>
    where
        F: Feature<DmaConfig>,
    {
        let cfg = feature::compose(&features).map_err(|e| e.latch(Subsystem::Dma, 0))?;
        channel.commit(&cfg)?;
        Ok(Self {
            channel,
            cfg,
            state: State::Idle,
            buffer: None,
            events: Publisher::new(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &DmaConfig {
        &self.cfg
    }

    pub fn is_circular(&self) -> bool {
        self.cfg.circular
    }

    /// Words left in the current transfer
    pub fn remaining(&self) -> usize {
        self.channel.remaining()
    }

    pub fn subscribe(
        &mut self,
        receiver: &'a (dyn Subscriber<DmaEvent> + Sync),
    ) -> Result<SubscriptionHandle, Error> {
        self.events.subscribe(receiver)
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        self.events.unsubscribe(handle)
    }

    pub fn events(&self) -> &Publisher<'a, DmaEvent, N> {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Publisher<'a, DmaEvent, N> {
        &mut self.events
    }

    pub fn enable_interrupts(&mut self, irq: Interrupts) {
        self.cfg.interrupts.insert(irq);
        self.channel.listen(irq);
    }

    pub fn disable_interrupts(&mut self, irq: Interrupts) {
        self.cfg.interrupts.remove(irq);
        self.channel.unlisten(irq);
    }

    /// Arms a peripheral to memory transfer into `buffer` and enables the
    /// channel.
    ///
    /// The buffer is held until the driver is re-armed, released or the
    /// buffer is taken back with [`take_buffer`](Self::take_buffer). On
    /// failure it is handed back together with the error.
    pub fn begin_read(&mut self, mut buffer: B) -> Result<(), (Error, B)>
    where
        B: WriteBuffer,
    {
        if matches!(self.state, State::Armed | State::Transferring) {
            return Err((Error::Busy.latch(Subsystem::Dma, 0), buffer));
        }

        // NOTE(unsafe) the buffer is owned by the driver for as long as the
        // channel may write to it
        let (ptr, len) = unsafe { buffer.write_buffer() };
        if ptr.is_null() || len == 0 {
            warn!("dma: empty buffer");
            return Err((Error::NoBuffer.latch(Subsystem::Dma, len as u32), buffer));
        }
        if len > u16::MAX as usize {
            return Err((Error::InvalidLength.latch(Subsystem::Dma, len as u32), buffer));
        }
        if core::mem::size_of::<B::Word>() != self.cfg.memory_size.bytes() {
            return Err((Error::Unsupported.latch(Subsystem::Dma, 0), buffer));
        }

        self.channel.stop();
        self.channel
            .set_peripheral_address(self.cfg.peripheral_address, self.cfg.peripheral_increment);
        self.channel
            .set_memory_address(ptr as u32, self.cfg.memory_increment);
        self.channel.set_transfer_length(len);
        self.buffer = Some(buffer);
        self.state = State::Armed;

        compiler_fence(Ordering::Release);

        self.channel.start();
        self.state = State::Transferring;
        debug!("dma: transferring {=usize} words", len);
        Ok(())
    }

    /// Advances the state machine and publishes `event`.
    ///
    /// Events arriving while no transfer is running are dropped.
    pub fn on_event(&mut self, event: DmaEvent) {
        if self.state != State::Transferring {
            trace!("dma: event dropped in {}", self.state);
            return;
        }
        match event {
            DmaEvent::HalfComplete => {}
            DmaEvent::Complete => {
                if !self.cfg.circular {
                    self.channel.stop();
                    self.state = State::Complete;
                }
            }
            DmaEvent::Error => {
                self.channel.stop();
                self.state = State::Error;
                Error::Transfer.latch(Subsystem::Dma, 0);
            }
        }

        compiler_fence(Ordering::Acquire);

        self.events.publish(event);
    }

    /// Interrupt entry point: consumes the pending flags.
    ///
    /// Errors are handled before half and full completion. Returns the flags
    /// that were pending.
    pub fn on_interrupt(&mut self) -> Interrupts {
        let flags = self.channel.take_flags();
        if flags.contains(Interrupts::ERROR) {
            self.on_event(DmaEvent::Error);
        }
        if flags.contains(Interrupts::HALF_COMPLETE) {
            self.on_event(DmaEvent::HalfComplete);
        }
        if flags.contains(Interrupts::COMPLETE) {
            self.on_event(DmaEvent::Complete);
        }
        flags
    }

    /// Disables the channel from any state and returns to [`State::Idle`]
    pub fn stop(&mut self) {
        self.channel.stop();
        self.state = State::Idle;
        compiler_fence(Ordering::SeqCst);
    }

    /// Read view of the buffer
    pub fn buffer<T>(&self) -> Option<&[T]>
    where
        B: AsRef<[T]>,
    {
        compiler_fence(Ordering::Acquire);
        self.buffer.as_ref().map(|b| b.as_ref())
    }

    /// Hands the buffer back unless a transfer may still write to it
    pub fn take_buffer(&mut self) -> Option<B> {
        match self.state {
            State::Armed | State::Transferring => None,
            _ => self.buffer.take(),
        }
    }

    /// Stops the channel and returns it with the buffer
    pub fn release(mut self) -> (CH, Option<B>) {
        self.stop();
        (self.channel, self.buffer)
    }
}

impl Subscriber<DmaEvent> for ReadyFlag {
    #[inline]
    fn on_event(&self, event: DmaEvent) {
        if event == DmaEvent::Complete {
            self.set();
        }
    }
}
