//! Per-CPU interrupt state
//!
//! Spinlocks disable local interrupts while held. Acquisitions nest, so each
//! CPU tracks how deep it is and whether interrupts were enabled before the
//! outermost `push_off`; `pop_off` re-enables them only when the last lock
//! on this CPU is released.
//!
//! With the `baremetal` feature on x86-64 the real interrupt flag is used.
//! Hosted builds simulate it: under `std` every thread is its own CPU, and
//! without `std` there is a single simulated CPU.

#[derive(Debug, Clone, Copy)]
struct CpuState {
    /// Spinlock nesting depth
    noff: u32,
    /// Were interrupts enabled before the outermost push_off?
    intena: bool,
}

impl CpuState {
    const fn new() -> Self {
        Self { noff: 0, intena: false }
    }
}

// ============================================================================
// Interrupt flag
// ============================================================================

#[cfg(all(feature = "baremetal", target_arch = "x86_64"))]
mod arch {
    use super::CpuState;
    use spin::Mutex;

    const NCPU: usize = 64;

    static CPUS: [Mutex<CpuState>; NCPU] = [const { Mutex::new(CpuState::new()) }; NCPU];

    /// Initial local APIC ID of the executing CPU
    fn cpuid() -> usize {
        #[allow(unused_unsafe)]
        let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
        (leaf.ebx >> 24) as usize % NCPU
    }

    #[inline]
    pub fn intr_get() -> bool {
        let flags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) flags);
        }
        flags & 0x200 != 0
    }

    #[inline]
    pub fn intr_off() {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
    }

    #[inline]
    pub fn intr_on() {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }

    // Interrupts are off whenever this is called, so the CPU cannot change
    // underneath us and the per-slot mutex is never contended.
    pub fn with_cpu<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
        let mut cpu = CPUS[cpuid()].lock();
        f(&mut *cpu)
    }
}

#[cfg(all(not(all(feature = "baremetal", target_arch = "x86_64")), feature = "std"))]
mod arch {
    use super::CpuState;
    use core::cell::Cell;

    std::thread_local! {
        static INTR: Cell<bool> = const { Cell::new(true) };
        static CPU: Cell<CpuState> = const { Cell::new(CpuState::new()) };
    }

    #[inline]
    pub fn intr_get() -> bool {
        INTR.with(|i| i.get())
    }

    #[inline]
    pub fn intr_off() {
        INTR.with(|i| i.set(false));
    }

    #[inline]
    pub fn intr_on() {
        INTR.with(|i| i.set(true));
    }

    pub fn with_cpu<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
        CPU.with(|c| {
            let mut state = c.get();
            let r = f(&mut state);
            c.set(state);
            r
        })
    }
}

#[cfg(all(not(all(feature = "baremetal", target_arch = "x86_64")), not(feature = "std")))]
mod arch {
    use super::CpuState;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    static INTR: AtomicBool = AtomicBool::new(true);
    static CPU: Mutex<CpuState> = Mutex::new(CpuState::new());

    #[inline]
    pub fn intr_get() -> bool {
        INTR.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn intr_off() {
        INTR.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn intr_on() {
        INTR.store(true, Ordering::Relaxed);
    }

    pub fn with_cpu<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
        let mut cpu = CPU.lock();
        f(&mut *cpu)
    }
}

// ============================================================================
// Interrupt control with nesting
// ============================================================================

/// Disable interrupts and bump this CPU's spinlock depth
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();

    arch::with_cpu(|cpu| {
        if cpu.noff == 0 {
            cpu.intena = old;
        }
        cpu.noff += 1;
    });
}

/// Drop one level of nesting; re-enable interrupts at depth zero if they
/// were enabled before the outermost `push_off`
pub fn pop_off() {
    debug_assert!(!arch::intr_get(), "pop_off: interrupts enabled");

    let enable = arch::with_cpu(|cpu| {
        debug_assert!(cpu.noff >= 1, "pop_off: noff < 1");
        cpu.noff = cpu.noff.saturating_sub(1);
        cpu.noff == 0 && cpu.intena
    });
    if enable {
        arch::intr_on();
    }
}

/// Number of spinlocks currently held by this CPU
pub fn spinlock_depth() -> u32 {
    arch::with_cpu(|cpu| cpu.noff)
}

/// Are local interrupts enabled?
pub fn interrupts_enabled() -> bool {
    arch::intr_get()
}

#[cfg(all(test, feature = "std", not(feature = "baremetal")))]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_restores_on_outermost() {
        assert!(interrupts_enabled());
        push_off();
        push_off();
        assert_eq!(spinlock_depth(), 2);
        assert!(!interrupts_enabled());
        pop_off();
        assert!(!interrupts_enabled());
        pop_off();
        assert_eq!(spinlock_depth(), 0);
        assert!(interrupts_enabled());
    }

    #[test]
    fn test_disabled_before_stays_disabled() {
        arch::intr_off();
        push_off();
        pop_off();
        assert!(!interrupts_enabled());
        arch::intr_on();
    }
}
