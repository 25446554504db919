//! Collaborator interfaces the core calls out to.
//!
//! The machine layer provides one object implementing all of them; the core only
//! ever sees it as `&mut dyn Platform`.

pub use retro86_mmu::MemoryBus;

/// Port I/O.
pub trait IoBus {
    /// Read `size` bytes (1, 2 or 4) from `port`.
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);
}

/// External interrupt sources, polled at instruction boundaries.
pub trait InterruptController {
    /// Acknowledge and return the next deliverable maskable vector, if any.
    ///
    /// Only called while EFLAGS.IF is set and no interrupt shadow is active.
    fn poll_interrupt(&mut self) -> Option<u8>;

    /// Returns `true` once per NMI edge.
    fn take_nmi(&mut self) -> bool {
        false
    }
}

/// Host-side pacing hooks bracketing each scheduler slice. Never used for
/// architectural semantics.
pub trait TimerHooks {
    fn begin_period(&mut self, _cycle_budget: i64) {}
    fn end_period(&mut self, _cycles_executed: i64) {}
}

/// Everything the core needs from the machine.
pub trait Platform: MemoryBus + IoBus + InterruptController + TimerHooks {}

impl<T> Platform for T where T: MemoryBus + IoBus + InterruptController + TimerHooks + ?Sized {}
