//! Software model of the CPU interrupt flag for the single-CPU core.
//!
//! The platform interrupt stubs are outside this crate; they call into
//! `devices::timer::tick()` and honor the yield-on-return request when
//! unwinding back to the interrupted code. The core only needs the
//! level itself plus the external-handler marker.

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupt state, as returned by [`disable`] and restored by
/// [`set_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    Off,
    On,
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static IN_EXTERNAL: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

pub fn get_level() -> IntrLevel {
    if ENABLED.load(Ordering::SeqCst) {
        IntrLevel::On
    } else {
        IntrLevel::Off
    }
}

pub fn are_enabled() -> bool {
    get_level() == IntrLevel::On
}

/// Enable interrupts, returning the previous level. Must not be called
/// from an external handler.
pub fn enable() -> IntrLevel {
    assert!(!in_external());
    let old = get_level();
    ENABLED.store(true, Ordering::SeqCst);
    old
}

/// Disable interrupts, returning the previous level.
pub fn disable() -> IntrLevel {
    let old = get_level();
    ENABLED.store(false, Ordering::SeqCst);
    old
}

pub fn set_level(level: IntrLevel) -> IntrLevel {
    match level {
        IntrLevel::On => enable(),
        IntrLevel::Off => disable(),
    }
}

/// Run `f` with interrupts disabled, restoring the previous level
/// afterwards.
pub fn without<R>(f: impl FnOnce() -> R) -> R {
    let old = disable();
    let r = f();
    set_level(old);
    r
}

/// True while an external (device) interrupt handler is running.
pub fn in_external() -> bool {
    IN_EXTERNAL.load(Ordering::SeqCst)
}

/// Bracket an external handler. The stub calls these around the
/// device-specific body.
pub fn enter_external() {
    assert!(!are_enabled());
    IN_EXTERNAL.store(true, Ordering::SeqCst);
}

pub fn leave_external() {
    IN_EXTERNAL.store(false, Ordering::SeqCst);
}

/// Ask for a thread yield once the current external handler returns.
pub fn yield_on_return() {
    YIELD_ON_RETURN.store(true, Ordering::SeqCst);
}

/// Consume a pending yield request. The interrupt stub checks this on
/// its way out.
pub fn take_yield_request() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_restores_level() {
        let _ = enable();
        without(|| {
            assert!(!are_enabled());
            without(|| assert!(!are_enabled()));
            assert!(!are_enabled());
        });
        assert!(are_enabled());
        let _ = disable();
    }

    #[test]
    fn yield_request_is_consumed_once() {
        yield_on_return();
        assert!(take_yield_request());
        assert!(!take_yield_request());
    }
}
