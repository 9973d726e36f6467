//! Decoded-trace cache.
//!
//! Traces are keyed by `(physical EIP, state hash)` so that a mode change
//! (operand size, CPL, paging, VM86) can never replay stale decodes. A
//! trace records the write-version of every physical page it decodes from
//! (two, when its final instruction straddles a page); lookups revalidate
//! the versions, so any write to a marked code page invalidates covering
//! traces without a flush scan on the store path.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::decode::Instr;
use crate::mem::CpuBus;

/// Decode stops after this many instructions even without control flow.
pub const MAX_TRACE_INSTRS: usize = 32;
/// Safety valve: beyond this many cached traces the cache is cleared.
const MAX_CACHED_TRACES: usize = 1 << 16;

pub struct Trace {
    pub instrs: Vec<Instr>,
    /// Backing pages and the versions they were decoded against.
    pages: [(u32, u32); 2],
    page_count: u8,
}

impl Trace {
    pub fn new(instrs: Vec<Instr>, pages: &[(u32, u32)]) -> Self {
        let mut t = Self {
            instrs,
            pages: [(0, 0); 2],
            page_count: pages.len().min(2) as u8,
        };
        t.pages[..pages.len().min(2)].copy_from_slice(&pages[..pages.len().min(2)]);
        t
    }

    fn pages(&self) -> &[(u32, u32)] {
        &self.pages[..self.page_count as usize]
    }
}

#[derive(Default)]
pub struct TraceCache {
    map: HashMap<(u32, u8), Trace>,
    /// Physical page -> number of traces decoded from it.
    page_refs: HashMap<u32, u32>,
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, phys_eip: u32, state_hash: u8) -> bool {
        self.map.contains_key(&(phys_eip, state_hash))
    }

    /// Cached trace for the location, dropping it if any backing page has
    /// been written since decode.
    pub fn lookup(
        &mut self,
        bus: &mut dyn CpuBus,
        phys_eip: u32,
        state_hash: u8,
    ) -> Option<&Trace> {
        let key = (phys_eip, state_hash);
        let stale_page = match self.map.get(&key) {
            None => return None,
            Some(trace) => trace
                .pages()
                .iter()
                .find(|(page, version)| bus.code_page_version(*page) != *version)
                .map(|(page, _)| *page),
        };
        if let Some(page) = stale_page {
            // One write invalidates every trace covering the page.
            self.invalidate_page(bus, page);
            return None;
        }
        self.map.get(&key)
    }

    pub fn insert(
        &mut self,
        bus: &mut dyn CpuBus,
        phys_eip: u32,
        state_hash: u8,
        trace: Trace,
    ) {
        if self.map.len() >= MAX_CACHED_TRACES {
            self.clear(bus);
        }
        for (page, _) in trace.pages() {
            *self.page_refs.entry(*page).or_insert(0) += 1;
            bus.mark_code_page(*page);
        }
        if let Some(old) = self.map.insert((phys_eip, state_hash), trace) {
            self.release_pages(bus, &old);
        }
    }

    fn release_pages(&mut self, bus: &mut dyn CpuBus, trace: &Trace) {
        for (page, _) in trace.pages() {
            if let Entry::Occupied(mut e) = self.page_refs.entry(*page) {
                *e.get_mut() -= 1;
                if *e.get() == 0 {
                    e.remove();
                    bus.unmark_code_page(*page);
                }
            }
        }
    }

    /// Drops every trace decoded from `page` and clears its SMC bit once
    /// nothing references it.
    pub fn invalidate_page(&mut self, bus: &mut dyn CpuBus, page: u32) {
        let keys: Vec<_> = self
            .map
            .iter()
            .filter(|(_, t)| t.pages().iter().any(|(p, _)| *p == page))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(trace) = self.map.remove(&key) {
                self.release_pages(bus, &trace);
            }
        }
    }

    /// Drops every trace whose physical EIP lies inside `[begin, end)`;
    /// used when PAM shadow permissions change under decoded code.
    pub fn invalidate_phys_range(&mut self, bus: &mut dyn CpuBus, begin: u32, end: u32) {
        let keys: Vec<_> = self
            .map
            .iter()
            .filter(|((phys, _), t)| {
                (*phys >= begin && *phys < end)
                    || t.pages().iter().any(|(p, _)| *p >= begin & !0xFFF && *p < end)
            })
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(trace) = self.map.remove(&key) {
                self.release_pages(bus, &trace);
            }
        }
    }

    pub fn clear(&mut self, bus: &mut dyn CpuBus) {
        for page in self.page_refs.keys() {
            bus.unmark_code_page(*page);
        }
        self.page_refs.clear();
        self.map.clear();
    }
}
