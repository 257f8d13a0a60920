//! # Interrupt event dispatch
//!
//! A [`Publisher`] connects one interrupt source to a handful of receivers.
//! Receivers are registered before interrupts are enabled; the ISR then calls
//! [`Publisher::publish`], which invokes every receiver synchronously, in
//! registration order, and returns once all of them have run.
//!
//! The publisher stores plain references to its receivers, so a receiver must
//! outlive its subscription. Publishing never allocates and never filters:
//! receivers get every event and ignore the kinds they are not interested in.
//!
//! [`ReadyFlag`] is the usual receiver on the application side: the ISR sets
//! it, the main loop waits on it.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;
use fugit::MicrosDurationU32;
use heapless::Vec;

use crate::error::Subsystem;
use crate::Error;

/// Receiver of events of type `E`
///
/// Called from interrupt context: implementations must not block.
pub trait Subscriber<E> {
    fn on_event(&self, event: E);
}

impl<E, F> Subscriber<E> for F
where
    F: Fn(E),
{
    #[inline(always)]
    fn on_event(&self, event: E) {
        self(event)
    }
}

/// Identifies a subscription for [`Publisher::unsubscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscriptionHandle(u16);

struct Slot<'a, E> {
    handle: SubscriptionHandle,
    receiver: &'a (dyn Subscriber<E> + Sync),
}

/// Fixed capacity list of up to `N` subscribers
pub struct Publisher<'a, E, const N: usize> {
    slots: Vec<Slot<'a, E>, N>,
    next: u16,
}

impl<'a, E, const N: usize> Default for Publisher<'a, E, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, E, const N: usize> Publisher<'a, E, N> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            next: 0,
        }
    }

    /// Appends `receiver` to the notification list.
    ///
    /// Fails with [`Error::CapacityExceeded`] when `N` receivers are already
    /// registered.
    pub fn subscribe(
        &mut self,
        receiver: &'a (dyn Subscriber<E> + Sync),
    ) -> Result<SubscriptionHandle, Error> {
        if self.slots.is_full() {
            return Err(Error::CapacityExceeded.latch(Subsystem::Event, N as u32));
        }
        // skip handles still held after the counter wrapped
        while self.slots.iter().any(|s| s.handle.0 == self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let handle = SubscriptionHandle(self.next);
        self.slots
            .push(Slot { handle, receiver })
            .map_err(|_| Error::CapacityExceeded.latch(Subsystem::Event, N as u32))?;
        self.next = self.next.wrapping_add(1);
        trace!("subscribed #{=u16}", handle.0);
        Ok(handle)
    }

    /// Removes a subscription. The remaining receivers keep their order.
    ///
    /// Only call this with the publishing interrupt masked, or from that
    /// interrupt itself.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        match self.slots.iter().position(|s| s.handle == handle) {
            Some(idx) => {
                self.slots.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<'a, E: Copy, const N: usize> Publisher<'a, E, N> {
    /// Delivers `event` to every receiver, in registration order
    #[inline]
    pub fn publish(&self, event: E) {
        for slot in &self.slots {
            slot.receiver.on_event(event);
        }
    }
}

/// Readiness flag set from interrupt context and consumed by the main loop
pub struct ReadyFlag {
    ready: AtomicBool,
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyFlag {
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    /// Marks the flag ready. Never blocks.
    #[inline]
    pub fn set(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Returns `true` and resets the flag if it was set
    #[inline]
    pub fn take(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Waits for the flag and resets it.
    ///
    /// On Cortex-M the flag is checked with interrupts masked and the core
    /// sleeps (`wfi`) before unmasking them, so a flag set between the check
    /// and the sleep still wakes it. Must not be called with interrupts
    /// already masked.
    pub fn wait(&self) {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        self.wait_masked(
            cortex_m::interrupt::disable,
            cortex_m::asm::wfi,
            // NOTE(unsafe) not inside a critical section, see above
            || unsafe { cortex_m::interrupt::enable() },
        );
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        while !self.take() {
            core::hint::spin_loop();
        }
    }

    /// Check-then-sleep loop: `sleep` only ever runs between `mask` and
    /// `unmask`, and a pending interrupt must make it return.
    #[cfg(any(test, all(target_arch = "arm", target_os = "none")))]
    fn wait_masked(&self, mask: impl Fn(), sleep: impl Fn(), unmask: impl Fn()) {
        loop {
            mask();
            let ready = self.take();
            if !ready {
                sleep();
            }
            unmask();
            if ready {
                return;
            }
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Polls once per microsecond using `delay`.
    pub fn wait_timeout<D: DelayNs>(
        &self,
        delay: &mut D,
        timeout: MicrosDurationU32,
    ) -> Result<(), Error> {
        let mut left = timeout.ticks();
        loop {
            if self.take() {
                return Ok(());
            }
            if left == 0 {
                return Err(Error::Timeout.latch(Subsystem::Event, timeout.ticks()));
            }
            delay.delay_us(1);
            left -= 1;
        }
    }

    /// Adaptor that sets this flag only for events equal to `kind`
    pub fn on<E>(&self, kind: E) -> SetOn<'_, E> {
        SetOn { flag: self, kind }
    }
}

/// Sets a [`ReadyFlag`] when a given event kind is published
pub struct SetOn<'f, E> {
    flag: &'f ReadyFlag,
    kind: E,
}

impl<'f, E: PartialEq> Subscriber<E> for SetOn<'f, E> {
    #[inline]
    fn on_event(&self, event: E) {
        if event == self.kind {
            self.flag.set();
        }
    }
}
