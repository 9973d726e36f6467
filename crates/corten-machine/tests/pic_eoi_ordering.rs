use corten_machine::{Machine, MachineConfig};

fn machine() -> Machine {
    Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        ..Default::default()
    })
    .unwrap()
}

/// Program both 8259s the way a PC BIOS does.
fn init_pics(m: &mut Machine) {
    for (cmd, data, icw2, icw3) in [(0x20u16, 0x21u16, 0x08u32, 0x04u32), (0xA0, 0xA1, 0x70, 0x02)]
    {
        m.io_write(cmd, 1, 0x11);
        m.io_write(data, 1, icw2);
        m.io_write(data, 1, icw3);
        m.io_write(data, 1, 0x01);
    }
}

/// The PIT fires IRQ 0 while it is masked, the RTC fires IRQ 8, then
/// IRQ 0 is unmasked. Under the default (reset) priority rotation IRQ 0
/// outranks the cascade, so the master's vector wins the first
/// acknowledge.
#[test]
fn masked_irq0_and_pending_irq8_acknowledge_in_priority_order() {
    let mut m = machine();
    init_pics(&mut m);

    // Mask IRQ 0 only.
    m.io_write(0x21, 1, 0x01);

    // PIT channel 0, mode 2, tiny reload -> IRQ 0 latches but stays
    // masked.
    m.io_write(0x43, 1, 0x34);
    m.io_write(0x40, 1, 0x20);
    m.io_write(0x40, 1, 0x00);
    // RTC: update-ended interrupt enable.
    m.io_write(0x70, 1, 0x0B);
    m.io_write(0x71, 1, 0x12);

    // Let both timers expire.
    m.platform_mut().tick(1_100_000_000);

    {
        let ints = m.platform().interrupts.borrow();
        assert!(ints.intr_asserted(), "IRQ 8 is deliverable while IRQ 0 is masked");
        assert_eq!(ints.pic().irr(0) & 0x01, 0x01, "IRQ 0 latched in the master IRR");
    }

    // Unmask IRQ 0; now both requests are pending and priority decides.
    m.io_write(0x21, 1, 0x00);

    let first = m.platform().interrupts.borrow_mut().acknowledge();
    assert_eq!(first, 0x08, "IRQ 0 outranks the cascade under reset rotation");
    // EOI the master; the slave request comes through next.
    m.io_write(0x20, 1, 0x20);
    let second = m.platform().interrupts.borrow_mut().acknowledge();
    assert_eq!(second, 0x70);
    m.io_write(0x20, 1, 0x20);
    m.io_write(0xA0, 1, 0x20);
}

/// Invariant: raise-then-lower with no acknowledge in between leaves the
/// IRR unchanged.
#[test]
fn raise_lower_is_a_net_noop_on_the_pic() {
    let mut m = machine();
    init_pics(&mut m);
    m.io_write(0x21, 1, 0xFF);
    m.io_write(0xA1, 1, 0xFF);

    let before = {
        let ints = m.platform().interrupts.borrow();
        (ints.pic().irr(0), ints.pic().irr(1))
    };
    m.raise_irq(5);
    m.lower_irq(5);
    m.raise_irq(10);
    m.lower_irq(10);
    let after = {
        let ints = m.platform().interrupts.borrow();
        (ints.pic().irr(0), ints.pic().irr(1))
    };
    assert_eq!(before, after);
}
