//! The interrupt-enable bit as a scoped token.
//!
//! On a single CPU with no in-kernel preemption, any state that a
//! hardware interrupt handler may touch can be protected by masking
//! interrupts around the critical section. [`IrqFlag::save`] returns a
//! guard that masks and remembers the prior state; dropping the guard
//! restores it, on every exit path including panics. Nesting works the
//! obvious way: the innermost restore re-establishes "masked".

use core::cell::Cell;

/// The CPU's interrupt-enable state.
pub struct IrqFlag {
    enabled: Cell<bool>,
}

impl IrqFlag {
    pub const fn new() -> Self {
        Self {
            enabled: Cell::new(false),
        }
    }

    /// Unmask interrupts (the `sti` side of the boot path and the idle
    /// loop).
    pub fn enable(&self) {
        self.enabled.set(true);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Masks interrupts and returns a guard that restores the previous
    /// state when dropped.
    #[must_use = "dropping the guard immediately re-enables interrupts"]
    pub fn save(&self) -> IrqGuard<'_> {
        let prev = self.enabled.replace(false);
        IrqGuard { flag: self, prev }
    }
}

/// Proof that interrupts are masked; restores the saved state on drop.
pub struct IrqGuard<'a> {
    flag: &'a IrqFlag,
    prev: bool,
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.flag.enabled.set(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_masks_and_restores() {
        let flag = IrqFlag::new();
        flag.enable();
        {
            let _g = flag.save();
            assert!(!flag.is_enabled());
        }
        assert!(flag.is_enabled());
    }

    #[test]
    fn nested_saves_restore_in_order() {
        let flag = IrqFlag::new();
        flag.enable();
        let outer = flag.save();
        {
            let _inner = flag.save();
            assert!(!flag.is_enabled());
        }
        // Still masked: only the outer guard may re-enable.
        assert!(!flag.is_enabled());
        drop(outer);
        assert!(flag.is_enabled());
    }
}
