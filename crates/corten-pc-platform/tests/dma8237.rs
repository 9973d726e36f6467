use std::cell::RefCell;
use std::rc::Rc;

use corten_devices::dma::DmaChannelClient;
use corten_pc_platform::PcPlatform;

struct Pattern {
    bytes: Vec<u8>,
    done: bool,
}

impl DmaChannelClient for Pattern {
    fn dma_provide(&mut self, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.bytes[i % self.bytes.len()];
        }
    }
    fn dma_accept(&mut self, _data: &[u8]) {}
    fn dma_complete(&mut self) {
        self.done = true;
    }
}

#[test]
fn dma_ports_are_registered_and_reset_clears_state() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);

    // Adjacent unmapped port floats high; the DMA register files do not.
    assert_eq!(pc.io.read_u8(0x10), 0xFF);
    assert_eq!(pc.io.read_u8(0x00), 0);
    assert_eq!(pc.io.read_u8(0xC0), 0);

    // Program channel 0's address through the flip-flop, then read back.
    pc.io.write_u8(0x0C, 0); // clear flip-flop
    pc.io.write_u8(0x00, 0x12);
    pc.io.write_u8(0x00, 0x34);
    pc.io.write_u8(0x0C, 0);
    assert_eq!(pc.io.read_u8(0x00), 0x12);
    assert_eq!(pc.io.read_u8(0x00), 0x34);

    pc.reset();
    pc.io.write_u8(0x0C, 0);
    assert_eq!(pc.io.read_u8(0x00), 0x12, "reset leaves address registers");
    // Master reset through the register interface clears them? No: only
    // the control state. The mask register returns to all-masked.
    assert_eq!(pc.io.read_u8(0x0F), 0x0F);
}

#[test]
fn dreq_transfer_lands_in_guest_ram_via_page_register() {
    let mut pc = PcPlatform::new(2 * 1024 * 1024);
    let client = Rc::new(RefCell::new(Pattern {
        bytes: vec![0xDE, 0xAD],
        done: false,
    }));
    pc.dma().borrow_mut().attach_client(2, client.clone());

    // Channel 2: single-mode write transfer at 0x1234 + page 0x01.
    pc.io.write_u8(0x0B, 0x46);
    pc.io.write_u8(0x0C, 0);
    pc.io.write_u8(0x04, 0x34);
    pc.io.write_u8(0x04, 0x12);
    pc.io.write_u8(0x05, 0x03); // count 3 -> four bytes
    pc.io.write_u8(0x05, 0x00);
    pc.io.write_u8(0x81, 0x01);
    pc.io.write_u8(0x0A, 0x02); // unmask

    pc.dma().borrow_mut().raise_dreq(2);
    pc.service();

    let ram = pc.ram.borrow();
    for i in 0..4u32 {
        assert_eq!(ram.read(0x1_1234 + i), [0xDE, 0xAD][i as usize % 2]);
    }
    drop(ram);
    assert!(client.borrow().done);
    // Terminal-count bit visible in the status register.
    assert_eq!(pc.io.read_u8(0x08) & 0x0F, 1 << 2);
}
