use corten_devices::acpi_pm::{ACPI_PM_CLOCK_HZ, DEFAULT_PM_BASE, PM1_EN_TMR, PM1_STS_TMR};
use corten_pc_platform::PcPlatform;

const MASK_24BIT: u32 = 0x00FF_FFFF;
const NS_PER_SEC: u128 = 1_000_000_000;

#[test]
fn tick_advances_the_pm_timer_deterministically() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    let before = pc.io.read(DEFAULT_PM_BASE + 8, 4) & MASK_24BIT;
    assert_eq!(before, 0, "PM_TMR starts from a deterministic zero");

    // A large delta makes any accidental wall-clock dependency obvious.
    let delta_ns: u64 = 5_000_000_000;
    pc.tick(delta_ns);

    let after = pc.io.read(DEFAULT_PM_BASE + 8, 4) & MASK_24BIT;
    let expected = (delta_ns as u128 * ACPI_PM_CLOCK_HZ as u128 / NS_PER_SEC) as u32 & MASK_24BIT;
    assert_eq!(after.wrapping_sub(before) & MASK_24BIT, expected);
}

#[test]
fn pm_timer_wrap_latches_status_and_pulses_irq9() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    pc.interrupts.borrow_mut().pic_mut().set_offsets(0x20, 0x28);

    // Enable the timer SCI (PM1_EN bit 0 = byte 2 of the block).
    pc.io.write(DEFAULT_PM_BASE + 2, 1, 0x01);
    assert_eq!(
        pc.io.read(DEFAULT_PM_BASE, 4) & PM1_EN_TMR,
        PM1_EN_TMR
    );

    // One full 2^24-tick wrap of the 3.579545 MHz counter.
    let wrap_ns = ((MASK_24BIT as u128 + 1) * NS_PER_SEC / ACPI_PM_CLOCK_HZ as u128) as u64;

    // The scheduler polls at each intermediate deadline.
    pc.tick(wrap_ns / 2);
    assert!(!pc.interrupts.borrow().intr_asserted());

    pc.tick(wrap_ns / 2 + 1_000);
    assert!(pc.interrupts.borrow().intr_asserted(), "IRQ 9 after the wrap");
    assert_eq!(pc.interrupts.borrow_mut().acknowledge(), 0x29);
    assert_eq!(
        pc.io.read(DEFAULT_PM_BASE, 2) & PM1_STS_TMR,
        PM1_STS_TMR,
        "overflow status latched"
    );
}
