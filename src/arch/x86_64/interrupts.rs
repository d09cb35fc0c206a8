/*
 * Interrupt Management Module
 *
 * Provides the save/restore pair every critical section in the scheduler is
 * built on. irq_save() masks interrupts and reports whether they were
 * enabled; irq_restore() re-enables them only if they were.
 */

use x86_64::instructions::interrupts;

/// Mask interrupts, returning whether they were enabled before
pub fn irq_save() -> bool {
    let were_enabled = interrupts::are_enabled();
    if were_enabled {
        interrupts::disable();
    }
    were_enabled
}

/// Restore the state captured by irq_save
pub fn irq_restore(were_enabled: bool) {
    // Only re-enable if they were enabled before
    if were_enabled {
        interrupts::enable();
    }
}

/// Check if interrupts are masked on this CPU
pub fn irqs_masked() -> bool {
    !interrupts::are_enabled()
}
