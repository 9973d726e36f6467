use corten_io_snapshot::{IoSnapshot, SnapshotError, StateObject};
use corten_pc_constants::{SHADOW_BASE, SHADOW_WINDOW_SIZE};

/// PAM shadow permissions: sixteen 16 KiB windows over C0000..FFFFF, two
/// bits each ({read, write}). Reads pass through to RAM regardless (the
/// firmware image is preloaded there, standing in for the ROM chip);
/// writes land only when the window is write-enabled.
pub struct PamState {
    perms: [u8; 16],
}

impl Default for PamState {
    fn default() -> Self {
        Self::new()
    }
}

impl PamState {
    pub fn new() -> Self {
        Self { perms: [0; 16] }
    }

    pub fn reset(&mut self) {
        self.perms = [0; 16];
    }

    pub fn perms(&self, window: usize) -> u8 {
        self.perms[window & 15]
    }

    pub fn set_perms(&mut self, window: usize, perms: u8) {
        self.perms[window & 15] = perms & 3;
    }

    pub fn window_of(addr: u32) -> usize {
        ((addr - SHADOW_BASE) / SHADOW_WINDOW_SIZE) as usize & 15
    }

    pub fn window_range(window: usize) -> (u32, u32) {
        let begin = SHADOW_BASE + window as u32 * SHADOW_WINDOW_SIZE;
        (begin, begin + SHADOW_WINDOW_SIZE)
    }

    pub fn write_allowed(&self, addr: u32) -> bool {
        self.perms[Self::window_of(addr)] & 2 != 0
    }

    pub fn read_allowed(&self, addr: u32) -> bool {
        self.perms[Self::window_of(addr)] & 1 != 0
    }
}

impl IoSnapshot for PamState {
    const NAME: &'static str = "pam";

    fn save_state(&self) -> StateObject {
        let mut obj = StateObject::new();
        obj.put_bytes("perms", &self.perms);
        obj
    }

    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError> {
        state.copy_into("perms", &mut self.perms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_mapping_covers_the_shadow_region() {
        assert_eq!(PamState::window_of(0xC0000), 0);
        assert_eq!(PamState::window_of(0xC3FFF), 0);
        assert_eq!(PamState::window_of(0xC4000), 1);
        assert_eq!(PamState::window_of(0xF0000), 12);
        assert_eq!(PamState::window_of(0xFFFFF), 15);
        assert_eq!(PamState::window_range(12), (0xF0000, 0xF4000));
    }

    #[test]
    fn write_permission_is_per_window() {
        let mut pam = PamState::new();
        pam.set_perms(2, 3);
        assert!(pam.write_allowed(0xC8000));
        assert!(!pam.write_allowed(0xCC000));
    }
}
