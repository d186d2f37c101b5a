//! x86-64 patch-point writer
//!
//! A patch point is a reserved code region that starts out as
//! `movabs r11, imm64; call r11` (13 bytes). Initialization checks that
//! exact encoding, moves the call sequence to the tail of the region and
//! fills the rest with NOPs. The head is then free for guard code an inline
//! cache writes, while the call target can be repointed in place with one
//! atomic 8-byte store.
//!
//! The sequence goes at the last offset where its immediate is 8-byte
//! aligned in memory, so up to 7 NOPs may follow it. Regions must not move
//! between initialization and repointing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Length of `movabs r11, imm64; call r11`
pub const CALL_SEQUENCE_LEN: usize = 13;

const MOVABS_R11: [u8; 2] = [0x49, 0xBB];
const CALL_R11: [u8; 3] = [0x41, 0xFF, 0xD3];
const NOP: u8 = 0x90;
/// Offset of the immediate within the call sequence
const IMM_OFFSET: usize = MOVABS_R11.len();
const IMM_ALIGN: usize = std::mem::align_of::<AtomicU64>();

/// Smallest region that fits an aligned call sequence wherever it starts
pub const MIN_PATCHPOINT_SIZE: usize = CALL_SEQUENCE_LEN + IMM_ALIGN - 1;

/// Error while writing machine code into a reserved region
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchpointError {
    #[error("patch point of {size} bytes has no room for an aligned {CALL_SEQUENCE_LEN}-byte call sequence")]
    TooSmall { size: usize },
    #[error("expected `movabs r11, imm64; call r11` at offset {offset}, found {found:02x?}")]
    UnexpectedEncoding { offset: usize, found: Vec<u8> },
    #[error("{needed} bytes at offset {offset} overrun a {size}-byte buffer")]
    OutOfBounds { offset: usize, needed: usize, size: usize },
    #[error("jump displacement {0} does not fit in 32 bits")]
    DisplacementOutOfRange(i64),
}

fn check_call_sequence(buf: &[u8], offset: usize) -> Result<(), PatchpointError> {
    let seq = &buf[offset..offset + CALL_SEQUENCE_LEN];
    if seq[..IMM_OFFSET] != MOVABS_R11 || seq[IMM_OFFSET + 8..] != CALL_R11 {
        return Err(PatchpointError::UnexpectedEncoding { offset, found: seq.to_vec() });
    }
    Ok(())
}

/// Offset of the call sequence once the patch point is initialized
fn tail_offset(buf: &[u8]) -> Result<usize, PatchpointError> {
    let too_small = || PatchpointError::TooSmall { size: buf.len() };
    let last = buf.len().checked_sub(CALL_SEQUENCE_LEN).ok_or_else(too_small)?;
    let misalignment = (buf.as_ptr() as usize + last + IMM_OFFSET) % IMM_ALIGN;
    last.checked_sub(misalignment).ok_or_else(too_small)
}

/// Verify the call sequence at the start of `buf`, move it to the tail and
/// NOP-fill the rest. Returns the offset of the moved sequence.
pub fn initialize_patchpoint(buf: &mut [u8]) -> Result<usize, PatchpointError> {
    let tail = tail_offset(buf)?;
    check_call_sequence(buf, 0)?;
    buf.copy_within(0..CALL_SEQUENCE_LEN, tail);
    buf[..tail].fill(NOP);
    buf[tail + CALL_SEQUENCE_LEN..].fill(NOP);
    tracing::trace!(size = buf.len(), tail, "initialized patch point");
    Ok(tail)
}

/// Current call target of an initialized patch point
pub fn call_target(buf: &[u8]) -> Result<u64, PatchpointError> {
    let tail = tail_offset(buf)?;
    check_call_sequence(buf, tail)?;
    let at = tail + IMM_OFFSET;
    let mut imm = [0u8; 8];
    imm.copy_from_slice(&buf[at..at + 8]);
    Ok(u64::from_le_bytes(imm))
}

/// Point an initialized patch point at `target` with a single atomic
/// store, so a thread running the code sees either the old or the new target.
pub fn repoint(buf: &mut [u8], target: u64) -> Result<(), PatchpointError> {
    let tail = tail_offset(buf)?;
    check_call_sequence(buf, tail)?;
    let ptr = buf[tail + IMM_OFFSET..tail + IMM_OFFSET + 8].as_mut_ptr();
    if ptr as usize % IMM_ALIGN != 0 {
        crate::ice!("patch point immediate at {:p} is not {}-byte aligned", ptr, IMM_ALIGN);
    }
    // Safety: ptr is aligned, in bounds for 8 bytes and exclusively borrowed
    unsafe { AtomicU64::from_ptr(ptr.cast::<u64>()) }.store(target, Ordering::Release);
    Ok(())
}

/// General-purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    fn low(self) -> u8 {
        self as u8 & 7
    }

    fn extended(self) -> bool {
        self as u8 >= 8
    }
}

/// Condition of a conditional jump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
    Below,
    AboveOrEqual,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl Cond {
    fn opcode(self) -> u8 {
        match self {
            Cond::Below => 0x82,
            Cond::AboveOrEqual => 0x83,
            Cond::Equal => 0x84,
            Cond::NotEqual => 0x85,
            Cond::Less => 0x8C,
            Cond::GreaterOrEqual => 0x8D,
            Cond::LessOrEqual => 0x8E,
            Cond::Greater => 0x8F,
        }
    }
}

/// Sequential encoder into a fixed buffer. Every write is bounds-checked;
/// jump targets are offsets into the same buffer.
pub struct X86Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> X86Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        X86Writer { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), PatchpointError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(PatchpointError::OutOfBounds { offset: self.pos, needed: bytes.len(), size: self.buf.len() });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn ensure(&self, needed: usize) -> Result<(), PatchpointError> {
        if self.pos + needed > self.buf.len() {
            return Err(PatchpointError::OutOfBounds { offset: self.pos, needed, size: self.buf.len() });
        }
        Ok(())
    }

    /// rel32 from the end of an instruction of `len` bytes at the cursor
    fn rel32(&self, len: usize, target: usize) -> Result<[u8; 4], PatchpointError> {
        let rel = target as i64 - (self.pos + len) as i64;
        let rel = i32::try_from(rel).map_err(|_| PatchpointError::DisplacementOutOfRange(rel))?;
        Ok(rel.to_le_bytes())
    }

    /// `movabs reg, imm64`
    pub fn mov_imm64(&mut self, reg: Reg, imm: u64) -> Result<(), PatchpointError> {
        self.ensure(10)?;
        let rex = 0x48 | u8::from(reg.extended());
        self.emit(&[rex, 0xB8 + reg.low()])?;
        self.emit(&imm.to_le_bytes())
    }

    /// `call reg`
    pub fn call_reg(&mut self, reg: Reg) -> Result<(), PatchpointError> {
        if reg.extended() {
            self.emit(&[0x41, 0xFF, 0xD0 | reg.low()])
        } else {
            self.emit(&[0xFF, 0xD0 | reg.low()])
        }
    }

    /// The call sequence patch points start out with
    pub fn call_sequence(&mut self, target: u64) -> Result<(), PatchpointError> {
        self.ensure(CALL_SEQUENCE_LEN)?;
        self.mov_imm64(Reg::R11, target)?;
        self.call_reg(Reg::R11)
    }

    /// `cmp qword [base + disp], imm32`
    pub fn cmp_mem_imm32(&mut self, base: Reg, disp: i32, imm: i32) -> Result<(), PatchpointError> {
        let needs_sib = base.low() == 4;
        self.ensure(11 + usize::from(needs_sib))?;
        let rex = 0x48 | u8::from(base.extended());
        // mod=10 (disp32), reg=/7 (cmp)
        let modrm = 0x80 | (7 << 3) | base.low();
        self.emit(&[rex, 0x81, modrm])?;
        if needs_sib {
            self.emit(&[0x24])?;
        }
        self.emit(&disp.to_le_bytes())?;
        self.emit(&imm.to_le_bytes())
    }

    /// `jcc rel32` to the buffer offset `target`
    pub fn jcc(&mut self, cond: Cond, target: usize) -> Result<(), PatchpointError> {
        self.ensure(6)?;
        let rel = self.rel32(6, target)?;
        self.emit(&[0x0F, cond.opcode()])?;
        self.emit(&rel)
    }

    /// `jmp rel32` to the buffer offset `target`
    pub fn jmp(&mut self, target: usize) -> Result<(), PatchpointError> {
        self.ensure(5)?;
        let rel = self.rel32(5, target)?;
        self.emit(&[0xE9])?;
        self.emit(&rel)
    }

    /// Pad with NOPs up to `offset`
    pub fn nop_until(&mut self, offset: usize) -> Result<(), PatchpointError> {
        if offset < self.pos {
            return Ok(());
        }
        self.ensure(offset - self.pos)?;
        self.buf[self.pos..offset].fill(NOP);
        self.pos = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// 16-byte aligned backing store, so a test controls where a region starts
    #[repr(align(16))]
    struct Backing([u8; 64]);

    fn fresh_patchpoint(backing: &mut Backing, start: usize, size: usize, target: u64) -> &mut [u8] {
        let buf = &mut backing.0[start..start + size];
        buf.fill(0xCC);
        X86Writer::new(buf).call_sequence(target).unwrap();
        buf
    }

    #[test]
    fn test_call_sequence_encoding() {
        let mut backing = Backing([0; 64]);
        let buf = fresh_patchpoint(&mut backing, 0, 13, 0x1122_3344_5566_7788);
        assert_eq!(
            &buf[..],
            &[0x49, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x41, 0xFF, 0xD3][..]
        );
    }

    #[test]
    fn test_initialize_moves_call_to_aligned_tail() {
        let mut backing = Backing([0; 64]);
        let buf = fresh_patchpoint(&mut backing, 0, 32, 0xdead_beef);
        // the last start, 19, would put the immediate at 21
        let tail = initialize_patchpoint(buf).unwrap();
        assert_eq!(tail, 14);
        assert!(buf[..14].iter().all(|b| *b == NOP));
        assert_eq!(&buf[14..16], &[0x49, 0xBB]);
        assert_eq!(&buf[24..27], &[0x41, 0xFF, 0xD3]);
        assert!(buf[27..].iter().all(|b| *b == NOP));
        assert_eq!(call_target(buf).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_immediate_is_aligned_wherever_the_region_starts() {
        for start in 0..8 {
            for size in [MIN_PATCHPOINT_SIZE, 24, 27, 40] {
                let mut backing = Backing([0; 64]);
                let buf = fresh_patchpoint(&mut backing, start, size, 0x1000);
                let tail = initialize_patchpoint(buf).unwrap();
                assert_eq!((buf.as_ptr() as usize + tail + IMM_OFFSET) % 8, 0, "start {} size {}", start, size);
                assert!(size - (tail + CALL_SEQUENCE_LEN) < 8);
                repoint(buf, 0x7fff_0000_2000).unwrap();
                assert_eq!(call_target(buf).unwrap(), 0x7fff_0000_2000);
            }
        }
    }

    #[test]
    fn test_exact_fit_is_unchanged_when_aligned() {
        let mut backing = Backing([0; 64]);
        // immediate at 6 + 2
        let buf = fresh_patchpoint(&mut backing, 6, CALL_SEQUENCE_LEN, 42);
        let before = buf.to_vec();
        assert_eq!(initialize_patchpoint(buf).unwrap(), 0);
        assert_eq!(buf.to_vec(), before);
    }

    #[test]
    fn test_exact_fit_is_rejected_when_misaligned() {
        let mut backing = Backing([0; 64]);
        let buf = fresh_patchpoint(&mut backing, 0, CALL_SEQUENCE_LEN, 42);
        assert_eq!(initialize_patchpoint(buf), Err(PatchpointError::TooSmall { size: CALL_SEQUENCE_LEN }));
    }

    #[test]
    fn test_initialize_rejects_other_encodings() {
        let mut backing = Backing([0; 64]);
        let buf = fresh_patchpoint(&mut backing, 0, 20, 1);
        buf[12] = 0xD2; // call r10
        let err = initialize_patchpoint(buf).unwrap_err();
        assert!(matches!(err, PatchpointError::UnexpectedEncoding { offset: 0, .. }));
    }

    #[test]
    fn test_initialize_rejects_small_buffer() {
        let mut buf = vec![0x90; 12];
        assert_eq!(initialize_patchpoint(&mut buf), Err(PatchpointError::TooSmall { size: 12 }));
    }

    #[test]
    fn test_cmp_mem_imm32() {
        let mut buf = [0u8; 32];
        let mut w = X86Writer::new(&mut buf);
        w.cmp_mem_imm32(Reg::Rdi, 8, 0x1234).unwrap();
        w.cmp_mem_imm32(Reg::R12, 16, 5).unwrap();
        let end = w.position();
        assert_eq!(
            &buf[..end],
            &[
                0x48, 0x81, 0xBF, 0x08, 0x00, 0x00, 0x00, 0x34, 0x12, 0x00, 0x00, //
                0x49, 0x81, 0xBC, 0x24, 0x10, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn test_guard_with_slow_path_jumps() {
        let mut buf = [0u8; 32];
        let mut w = X86Writer::new(&mut buf);
        w.jcc(Cond::NotEqual, 0x20).unwrap();
        w.nop_until(10).unwrap();
        w.jmp(0).unwrap();
        assert_eq!(w.position(), 15);
        assert_eq!(&buf[..6], &[0x0F, 0x85, 0x1A, 0x00, 0x00, 0x00]);
        assert!(buf[6..10].iter().all(|b| *b == NOP));
        assert_eq!(&buf[10..15], &[0xE9, 0xF1, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_writes_are_bounds_checked() {
        let mut buf = [0u8; 4];
        let mut w = X86Writer::new(&mut buf);
        assert_eq!(w.jmp(0), Err(PatchpointError::OutOfBounds { offset: 0, needed: 5, size: 4 }));
        assert_eq!(w.position(), 0);
        assert!(w.mov_imm64(Reg::Rax, 1).is_err());
        assert_eq!(w.remaining(), 4);
    }
}
