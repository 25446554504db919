//! Guest memory access: segment checks, paging through the MMU/MAC, dirty-code
//! notification, stack helpers, and instruction fetch.

use std::collections::VecDeque;

use retro86_mmu::{AccessType, MemoryBus, Requester, Translation, PAGE_SIZE};

use crate::exception::Fault;
use crate::flags::Width;
use crate::model::CpuClass;
use crate::platform::{InterruptController, IoBus, TimerHooks};
use crate::state::{SegReg, SegmentCache, ESP};
use crate::CpuCore;

/// Longest legal instruction on 386 and later cores.
pub const MAX_INSN_LEN: usize = 15;

/// Bytes of the instruction currently being decoded, with their physical
/// location, for the recompiler.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FetchLog {
    pub bytes: [u8; 16],
    pub len: u8,
    pub first_phys: u32,
    pub last_phys: u32,
}

impl FetchLog {
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    fn record(&mut self, byte: u8, paddr: u32) {
        let i = usize::from(self.len);
        if i < self.bytes.len() {
            self.bytes[i] = byte;
            if i == 0 {
                self.first_phys = paddr;
            }
            self.len += 1;
        }
        self.last_phys = paddr;
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

/// Segment type and limit check for an access through `cache`.
///
/// `typed` enables the protected-mode type checks (read from execute-only code,
/// write to code or read-only data).
pub(crate) fn check_segment(
    cache: &SegmentCache,
    stack: bool,
    typed: bool,
    offset: u32,
    len: u32,
    access: AccessType,
) -> Result<(), Fault> {
    let limit_fault = if stack { Fault::ss(0) } else { Fault::gp0() };
    if !cache.is_usable() {
        return Err(limit_fault);
    }
    if typed {
        let ok = match access {
            AccessType::Read => cache.readable(),
            AccessType::Write => cache.writable(),
            AccessType::Execute => cache.is_code(),
        };
        if !ok {
            return Err(Fault::gp0());
        }
    }
    if !cache.contains(offset, len) {
        return Err(limit_fault);
    }
    Ok(())
}

impl CpuCore {
    #[inline]
    pub(crate) fn requester(&self) -> Requester {
        Requester::Cpl(self.state.cpl())
    }

    #[inline]
    fn typed_checks(&self) -> bool {
        self.state.protected() && !self.state.v86()
    }

    /// 8086-class cores do not check limits; offsets wrap at 64 KB.
    #[inline]
    fn wraps_offsets(&self) -> bool {
        self.model().class < CpuClass::I286
    }

    /// Linear address of `seg:offset` after segment checks.
    pub fn seg_linear(
        &self,
        seg: SegReg,
        offset: u32,
        len: u32,
        access: AccessType,
    ) -> Result<u32, Fault> {
        let cache = self.state.seg(seg);
        if !self.wraps_offsets() {
            check_segment(
                cache,
                seg == SegReg::Ss,
                self.typed_checks(),
                offset,
                len,
                access,
            )?;
        }
        Ok(cache.base.wrapping_add(offset))
    }

    #[inline]
    pub(crate) fn translate<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        access: AccessType,
        who: Requester,
    ) -> Result<Translation, Fault> {
        let t = self.mmu.translate(bus, linear, access, who);
        for addr in self.mmu.drain_table_writes() {
            self.code_pages.mark_dirty(addr, 4);
        }
        t.map_err(Fault::from)
    }

    /// Read `len` (1, 2 or 4) bytes at a linear address.
    pub fn read_linear<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        len: u32,
        who: Requester,
    ) -> Result<u32, Fault> {
        let page_off = linear & (PAGE_SIZE - 1);
        if page_off + len <= PAGE_SIZE {
            let t = self.translate(bus, linear, AccessType::Read, who)?;
            let p = u64::from(t.paddr);
            return Ok(match len {
                1 => u32::from(bus.read_u8(p)),
                2 => u32::from(bus.read_u16(p)),
                _ => bus.read_u32(p),
            });
        }
        let split = PAGE_SIZE - page_off;
        let first = self.translate(bus, linear, AccessType::Read, who)?;
        let second = self.translate(bus, linear.wrapping_add(split), AccessType::Read, who)?;
        let mut v = 0u32;
        for i in 0..len {
            let p = if i < split {
                first.paddr.wrapping_add(i)
            } else {
                second.paddr.wrapping_add(i - split)
            };
            v |= u32::from(bus.read_u8(u64::from(p))) << (i * 8);
        }
        Ok(v)
    }

    /// Write `len` (1, 2 or 4) bytes at a linear address. Both pages of a
    /// page-crossing write are translated before anything is stored.
    pub fn write_linear<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        len: u32,
        value: u32,
        who: Requester,
    ) -> Result<(), Fault> {
        let page_off = linear & (PAGE_SIZE - 1);
        if page_off + len <= PAGE_SIZE {
            let t = self.translate(bus, linear, AccessType::Write, who)?;
            let p = u64::from(t.paddr);
            match len {
                1 => bus.write_u8(p, value as u8),
                2 => bus.write_u16(p, value as u16),
                _ => bus.write_u32(p, value),
            }
            self.after_write(t, len);
            return Ok(());
        }
        let split = PAGE_SIZE - page_off;
        let first = self.translate(bus, linear, AccessType::Write, who)?;
        let second = self.translate(bus, linear.wrapping_add(split), AccessType::Write, who)?;
        for i in 0..len {
            let p = if i < split {
                first.paddr.wrapping_add(i)
            } else {
                second.paddr.wrapping_add(i - split)
            };
            bus.write_u8(u64::from(p), (value >> (i * 8)) as u8);
        }
        self.after_write(first, split);
        self.after_write(second, len - split);
        Ok(())
    }

    #[inline]
    fn after_write(&mut self, t: Translation, len: u32) {
        if t.code_page {
            self.code_pages.mark_dirty(t.paddr, len);
        }
        self.mmu.on_phys_write(t.paddr);
    }

    /// Notification of a write that bypassed the CPU (DMA, device models).
    pub fn notify_phys_write(&mut self, paddr: u32, len: u32) {
        let mut addr = paddr;
        let end = u64::from(paddr) + u64::from(len.max(1));
        while u64::from(addr) < end {
            let chunk_end = (u64::from(addr) | u64::from(PAGE_SIZE - 1)) + 1;
            let n = (chunk_end.min(end) - u64::from(addr)) as u32;
            self.code_pages.mark_dirty(addr, n);
            self.mmu.on_phys_write(addr);
            match addr.checked_add(n) {
                Some(next) => addr = next,
                None => break,
            }
        }
    }

    /// Data read through a segment register.
    pub fn read_mem<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
        w: Width,
    ) -> Result<u32, Fault> {
        let len = w.bytes();
        self.prefetch.note_data_access(len);
        if self.wraps_offsets() && (offset & 0xFFFF) + len > 0x1_0000 {
            let mut v = 0;
            for i in 0..len {
                let off = offset.wrapping_add(i) & 0xFFFF;
                let lin = self.seg_linear(seg, off, 1, AccessType::Read)?;
                v |= self.read_linear(bus, lin, 1, Requester::Cpl(0))? << (i * 8);
            }
            return Ok(v);
        }
        let linear = self.seg_linear(seg, offset, len, AccessType::Read)?;
        let who = self.requester();
        self.read_linear(bus, linear, len, who)
    }

    /// Data write through a segment register.
    pub fn write_mem<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
        w: Width,
        value: u32,
    ) -> Result<(), Fault> {
        let len = w.bytes();
        self.prefetch.note_data_access(len);
        if self.wraps_offsets() && (offset & 0xFFFF) + len > 0x1_0000 {
            for i in 0..len {
                let off = offset.wrapping_add(i) & 0xFFFF;
                let lin = self.seg_linear(seg, off, 1, AccessType::Write)?;
                self.write_linear(bus, lin, 1, value >> (i * 8), Requester::Cpl(0))?;
            }
            return Ok(());
        }
        let linear = self.seg_linear(seg, offset, len, AccessType::Write)?;
        let who = self.requester();
        self.write_linear(bus, linear, len, value, who)
    }

    /// Check that a write would succeed without performing it (string
    /// instructions and read-modify-write operands).
    pub fn probe_write<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
        w: Width,
    ) -> Result<(), Fault> {
        let linear = self.seg_linear(seg, offset, w.bytes(), AccessType::Write)?;
        let who = self.requester();
        self.translate(bus, linear, AccessType::Write, who)?;
        Ok(())
    }

    #[inline]
    pub fn read_u8<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
    ) -> Result<u8, Fault> {
        Ok(self.read_mem(bus, seg, offset, Width::Byte)? as u8)
    }

    #[inline]
    pub fn read_u16<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
    ) -> Result<u16, Fault> {
        Ok(self.read_mem(bus, seg, offset, Width::Word)? as u16)
    }

    #[inline]
    pub fn read_u32<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        offset: u32,
    ) -> Result<u32, Fault> {
        self.read_mem(bus, seg, offset, Width::Dword)
    }

    /// Read a system structure (descriptor table, IDT, TSS) as a supervisor access.
    pub fn read_system<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        len: u32,
    ) -> Result<u32, Fault> {
        self.read_linear(bus, linear, len, Requester::System)
    }

    pub fn write_system<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        linear: u32,
        len: u32,
        value: u32,
    ) -> Result<(), Fault> {
        self.write_linear(bus, linear, len, value, Requester::System)
    }

    #[inline]
    fn sp_mask(&self) -> u32 {
        if self.state.stack32() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn push<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        value: u32,
        op32: bool,
    ) -> Result<(), Fault> {
        let w = Width::from_op32(op32);
        let sp = self.state.sp().wrapping_sub(w.bytes()) & self.sp_mask();
        self.write_mem(bus, SegReg::Ss, sp, w, value)?;
        self.state.set_sp(sp);
        Ok(())
    }

    pub fn pop<B: MemoryBus + ?Sized>(&mut self, bus: &mut B, op32: bool) -> Result<u32, Fault> {
        let w = Width::from_op32(op32);
        let sp = self.state.sp();
        let v = self.read_mem(bus, SegReg::Ss, sp, w)?;
        self.state.set_sp(sp.wrapping_add(w.bytes()) & self.sp_mask());
        Ok(v)
    }

    /// Read the stack at `SP + offset` without popping.
    pub fn peek<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        offset: u32,
        op32: bool,
    ) -> Result<u32, Fault> {
        let sp = self.state.sp().wrapping_add(offset) & self.sp_mask();
        self.read_mem(bus, SegReg::Ss, sp, Width::from_op32(op32))
    }

    /// Fetch the next instruction byte at CS:EIP.
    pub(crate) fn fetch_u8<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> Result<u8, Fault> {
        let code32 = self.state.code32();
        let offset = if code32 {
            self.state.eip
        } else {
            self.state.eip & 0xFFFF
        };
        let cs = *self.state.seg(SegReg::Cs);
        if !self.wraps_offsets() {
            if !cs.contains(offset, 1) {
                return Err(Fault::gp0());
            }
            if usize::from(self.fetch.len) >= MAX_INSN_LEN {
                return Err(Fault::gp0());
            }
        }
        let linear = cs.base.wrapping_add(offset);
        let who = self.requester();
        let t = self.translate(bus, linear, AccessType::Execute, who)?;
        let byte = bus.read_u8(u64::from(t.paddr));
        self.fetch.record(byte, t.paddr);
        let stall = self.prefetch.consume(1);
        self.state.cycles -= i64::from(stall);
        self.state.eip = if code32 {
            offset.wrapping_add(1)
        } else {
            offset.wrapping_add(1) & 0xFFFF
        };
        Ok(byte)
    }

    pub(crate) fn fetch_u16<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> Result<u16, Fault> {
        let lo = self.fetch_u8(bus)?;
        let hi = self.fetch_u8(bus)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub(crate) fn fetch_u32<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> Result<u32, Fault> {
        let lo = self.fetch_u16(bus)?;
        let hi = self.fetch_u16(bus)?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    /// Fetch an immediate of operand width `w`.
    pub(crate) fn fetch_imm<B: MemoryBus + ?Sized>(
        &mut self,
        bus: &mut B,
        w: Width,
    ) -> Result<u32, Fault> {
        Ok(match w {
            Width::Byte => u32::from(self.fetch_u8(bus)?),
            Width::Word => u32::from(self.fetch_u16(bus)?),
            Width::Dword => self.fetch_u32(bus)?,
        })
    }

    /// Physical address of CS:EIP for the code cache, without side effects on
    /// the guest.
    pub(crate) fn code_phys<B: MemoryBus + ?Sized>(&mut self, bus: &mut B) -> Result<u32, Fault> {
        let offset = if self.state.code32() {
            self.state.eip
        } else {
            self.state.eip & 0xFFFF
        };
        let cs = *self.state.seg(SegReg::Cs);
        if !cs.contains(offset, 1) {
            return Err(Fault::gp0());
        }
        let who = self.requester();
        Ok(self
            .translate(bus, cs.base.wrapping_add(offset), AccessType::Execute, who)?
            .paddr)
    }
}

/// A stack being built on a segment that is not (yet) SS: interrupt frames, call
/// gates and privilege-changing returns. Nothing is committed to SS:ESP until
/// [`StackFrame::commit`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackFrame {
    pub ss: SegmentCache,
    pub esp: u32,
    pub who: Requester,
    typed: bool,
}

impl StackFrame {
    pub fn current(core: &CpuCore) -> Self {
        Self {
            ss: *core.state.seg(SegReg::Ss),
            esp: core.state.gpr[ESP],
            who: core.requester(),
            typed: core.typed_checks(),
        }
    }

    pub fn new(ss: SegmentCache, esp: u32, cpl: u8) -> Self {
        Self {
            ss,
            esp,
            who: Requester::Cpl(cpl),
            typed: true,
        }
    }

    #[inline]
    fn mask(&self) -> u32 {
        if self.ss.big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    #[inline]
    fn set_sp(&mut self, sp: u32) {
        let mask = self.mask();
        self.esp = (self.esp & !mask) | (sp & mask);
    }

    pub fn push<B: MemoryBus + ?Sized>(
        &mut self,
        core: &mut CpuCore,
        bus: &mut B,
        value: u32,
        len: u32,
    ) -> Result<(), Fault> {
        let sp = (self.esp & self.mask()).wrapping_sub(len) & self.mask();
        check_segment(&self.ss, true, self.typed, sp, len, AccessType::Write)?;
        core.write_linear(bus, self.ss.base.wrapping_add(sp), len, value, self.who)?;
        self.set_sp(sp);
        Ok(())
    }

    pub fn pop<B: MemoryBus + ?Sized>(
        &mut self,
        core: &mut CpuCore,
        bus: &mut B,
        len: u32,
    ) -> Result<u32, Fault> {
        let sp = self.esp & self.mask();
        check_segment(&self.ss, true, self.typed, sp, len, AccessType::Read)?;
        let v = core.read_linear(bus, self.ss.base.wrapping_add(sp), len, self.who)?;
        self.set_sp(sp.wrapping_add(len));
        Ok(v)
    }

    pub fn skip(&mut self, bytes: u32) {
        let sp = (self.esp & self.mask()).wrapping_add(bytes);
        self.set_sp(sp);
    }

    /// Make this the live stack.
    pub fn commit(self, core: &mut CpuCore) {
        core.state.segs[SegReg::Ss.index()] = self.ss;
        core.state.gpr[ESP] = self.esp;
    }
}

/// Identity-mapped RAM plus port/interrupt stubs, for tests and benches.
#[derive(Debug, Clone, Default)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    /// Every port write, in order: (port, size, value).
    pub io_writes: Vec<(u16, u8, u32)>,
    /// Value returned by port reads.
    pub io_read_value: u32,
    pub pending_irqs: VecDeque<u8>,
    pub nmi: bool,
    pub periods: u64,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            io_read_value: 0xFFFF_FFFF,
            ..Self::default()
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    pub fn raise_irq(&mut self, vector: u8) {
        self.pending_irqs.push_back(vector);
    }
}

impl MemoryBus for FlatTestBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.mem.get(paddr as usize).copied().unwrap_or(0xFF)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(paddr), self.read_u8(paddr + 1)])
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        u32::from(self.read_u16(paddr)) | (u32::from(self.read_u16(paddr + 2)) << 16)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from(self.read_u32(paddr)) | (u64::from(self.read_u32(paddr + 4)) << 32)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(slot) = self.mem.get_mut(paddr as usize) {
            *slot = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

impl IoBus for FlatTestBus {
    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => self.io_read_value & 0xFF,
            2 => self.io_read_value & 0xFFFF,
            _ => self.io_read_value,
        }
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.io_writes.push((port, size, value));
    }
}

impl InterruptController for FlatTestBus {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.pending_irqs.pop_front()
    }

    fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi)
    }
}

impl TimerHooks for FlatTestBus {
    fn begin_period(&mut self, _cycle_budget: i64) {
        self.periods += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CR0_PG;
    use crate::test_util::protected_core;

    #[test]
    fn page_walk_write_back_dirties_code_sharing_the_table_frame() {
        let (mut core, mut bus) = protected_core("486DX");
        bus.load(0x10000, &(0x11000u32 | 3).to_le_bytes());
        for page in 0..0x20u32 {
            bus.load(0x11000 + page * 4, &(page << 12 | 3).to_le_bytes());
        }
        core.set_cr3(0x10000);
        core.set_cr0(core.state.cr0 | CR0_PG);
        core.register_code(0x11000, 16);

        // PTE for linear 0x5000 sits at 0x11014, inside the code chunk.
        core.read_linear(&mut bus, 0x5000, 4, Requester::Cpl(0)).unwrap();
        assert_eq!(core.code_write_count(), 1);

        // PTE at 0x11050 is in a chunk with no code.
        core.read_linear(&mut bus, 0x14000, 4, Requester::Cpl(0)).unwrap();
        assert_eq!(core.code_write_count(), 1);
    }
}
