//! Software TLB with lazy fill (spec §4.4, component C4): a 68030-style
//! PMMU that walks guest page tables on a [`crate::memmap::MemoryMap`]
//! fast-path miss and fills the SoA entries so the retry hits.

use crate::memmap::{FaultHandler, MemoryMap};

/// `TC` register fields (spec §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationControl {
    pub enable: bool,
    pub sre: bool,
    pub initial_shift: u32,
    /// Per-level index widths A, B, C, D; zero ends the walk early.
    pub level_widths: [u32; 4],
}

/// Descriptor type encoded in the low two bits of a root/table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorType {
    Invalid,
    Page,
    ShortTable,
    LongTable,
}

impl DescriptorType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => DescriptorType::Invalid,
            1 => DescriptorType::Page,
            2 => DescriptorType::ShortTable,
            3 => DescriptorType::LongTable,
            _ => unreachable!(),
        }
    }
}

/// A 64-bit root pointer (`CRP`/`SRP`): high 32 bits carry the descriptor
/// type in their low two bits, low 32 bits carry the table base (spec
/// §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct RootPointer {
    pub upper: u32,
    pub lower: u32,
}

impl RootPointer {
    fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::from_bits(self.upper)
    }

    fn table_base(&self) -> u32 {
        self.lower & !3
    }
}

/// A transparent translation range register (`TT0`/`TT1`, spec §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransparentTranslation {
    pub enable: bool,
    pub addr_base: u8,
    pub addr_mask: u8,
    pub fc_base: u8,
    pub fc_mask: u8,
    /// `None` = match any R/W; `Some(true)` = write-only; `Some(false)` =
    /// read-only.
    pub rw_match: Option<bool>,
    pub cache_inhibit: bool,
}

impl TransparentTranslation {
    /// True if `logical_addr`/`is_write`/function-code `fc` match this
    /// range and the R/W field (when set) doesn't conflict.
    fn matches(&self, logical_addr: u32, is_write: bool, fc: u8) -> bool {
        if !self.enable {
            return false;
        }
        let top_byte = (logical_addr >> 24) as u8;
        if top_byte & self.addr_mask != self.addr_base & self.addr_mask {
            return false;
        }
        if fc & self.fc_mask != self.fc_base & self.fc_mask {
            return false;
        }
        match self.rw_match {
            Some(write_only) => write_only == is_write,
            None => true,
        }
    }
}

/// Accumulated probe result (spec §4.4 "Table walk" / "Probe").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuStatus {
    pub invalid: bool,
    pub write_protected: bool,
    pub modified: bool,
    pub supervisor_only: bool,
    pub tt_match: bool,
    pub levels_walked: u8,
}

const PAGE_SHIFT: u32 = 12;
const PAGE_MASK: u32 = (1 << PAGE_SHIFT) - 1;

/// The software TLB / PMMU. Holds no SoA storage of its own: it borrows the
/// memory map's SoA vectors for the duration of each call (spec §9 "Cyclic
/// dependency between memory and MMU").
#[derive(Debug, Clone, Default)]
pub struct Mmu {
    pub tc: TranslationControl,
    pub crp: RootPointer,
    pub srp: RootPointer,
    pub tt0: TransparentTranslation,
    pub tt1: TransparentTranslation,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    fn root_for(&self, supervisor: bool) -> RootPointer {
        if self.tc.sre && supervisor {
            self.srp
        } else {
            self.crp
        }
    }

    /// Walk the page table for `logical_addr`, accumulating `MmuStatus`
    /// and returning the resolved physical page number on success (spec
    /// §4.4 "Table walk").
    fn walk(&self, memory: &MemoryMap, logical_addr: u32) -> (MmuStatus, Option<u32>) {
        let mut status = MmuStatus::default();
        let root = self.root_for(false);
        let mut table_addr = root.table_base();
        let mut descriptor_size: u32 = match root.descriptor_type() {
            DescriptorType::LongTable => 8,
            _ => 4,
        };
        if matches!(root.descriptor_type(), DescriptorType::Invalid) {
            status.invalid = true;
            return (status, None);
        }

        let mut bit_pos = 32 - self.tc.initial_shift;
        let mut levels_walked = 0u8;

        for &index_bits in &self.tc.level_widths {
            if index_bits == 0 {
                break;
            }
            levels_walked += 1;
            bit_pos -= index_bits;
            let mask = (1u32 << index_bits) - 1;
            let index = (logical_addr >> bit_pos) & mask;
            let descriptor = read_descriptor(memory, table_addr, index, descriptor_size);

            match DescriptorType::from_bits(descriptor) {
                DescriptorType::Invalid => {
                    status.invalid = true;
                    status.levels_walked = levels_walked;
                    return (status, None);
                }
                DescriptorType::Page => {
                    let page_mask = (1u32 << bit_pos) - 1;
                    let base = descriptor & !page_mask & !3;
                    let physical_addr = base | (logical_addr & page_mask);
                    status.write_protected = descriptor & (1 << 2) != 0;
                    status.modified = descriptor & (1 << 3) != 0;
                    if descriptor_size == 8 {
                        status.supervisor_only = descriptor & (1 << 7) != 0;
                    }
                    status.levels_walked = levels_walked;
                    return (status, Some(physical_addr >> PAGE_SHIFT));
                }
                DescriptorType::ShortTable => {
                    table_addr = descriptor & !3;
                    descriptor_size = 4;
                }
                DescriptorType::LongTable => {
                    table_addr = descriptor & !3;
                    descriptor_size = 8;
                }
            }
        }

        status.invalid = true;
        status.levels_walked = levels_walked;
        (status, None)
    }

    /// Handle a memory fault (spec §4.4 "Fault handling"). Returns `true`
    /// if the SoA entries were filled and the caller should retry the fast
    /// path; `false` means a bus error should be raised.
    pub fn handle_fault(&self, memory: &mut MemoryMap, logical_addr: u32, is_write: bool, supervisor: bool) -> bool {
        if !self.tc.enable {
            return false;
        }

        let emu_page = (logical_addr >> PAGE_SHIFT) as usize;
        let fc = if supervisor { 0x4 } else { 0x0 };

        if self.tt0.matches(logical_addr, is_write, fc) || self.tt1.matches(logical_addr, is_write, fc) {
            memory.fill_soa(emu_page, logical_addr >> PAGE_SHIFT, false, false);
            return true;
        }

        let (status, phys_page) = self.walk(memory, logical_addr);
        let Some(phys_page) = phys_page else {
            return false;
        };
        if status.supervisor_only && !supervisor {
            return false;
        }
        if status.write_protected && is_write {
            return false;
        }

        memory.fill_soa(emu_page, phys_page, status.supervisor_only, status.write_protected);
        true
    }

    /// `PTEST`: walk without filling SoA entries (spec §4.4 "Probe").
    pub fn test_address(&self, memory: &MemoryMap, logical_addr: u32, is_write: bool, supervisor: bool) -> MmuStatus {
        let fc = if supervisor { 0x4 } else { 0x0 };
        if self.tt0.matches(logical_addr, is_write, fc) || self.tt1.matches(logical_addr, is_write, fc) {
            return MmuStatus { tt_match: true, ..MmuStatus::default() };
        }
        let (status, _) = self.walk(memory, logical_addr);
        status
    }
}

impl FaultHandler for Mmu {
    fn handle_fault(&mut self, map: &mut MemoryMap, logical_addr: u32, is_write: bool, supervisor: bool) -> bool {
        Mmu::handle_fault(self, map, logical_addr, is_write, supervisor)
    }
}

fn read_descriptor(memory: &MemoryMap, table_addr: u32, index: u32, descriptor_size: u32) -> u32 {
    let addr = table_addr + index * descriptor_size;
    let buffer = memory.raw_buffer();
    let offset = addr as usize;
    if offset + 4 > buffer.len() {
        return 0;
    }
    u32::from_be_bytes(buffer[offset..offset + 4].try_into().unwrap())
}
