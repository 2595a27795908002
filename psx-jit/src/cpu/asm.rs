//! Minimal instruction encoder.
//!
//! Used to build guest programs for tests and for debugger patching. Branch
//! offsets are in instructions relative to the delay slot, jump targets are
//! absolute byte addresses.

pub const ZERO: u8 = 0;
pub const AT: u8 = 1;
pub const V0: u8 = 2;
pub const V1: u8 = 3;
pub const A0: u8 = 4;
pub const A1: u8 = 5;
pub const A2: u8 = 6;
pub const A3: u8 = 7;
pub const T0: u8 = 8;
pub const T1: u8 = 9;
pub const T2: u8 = 10;
pub const T3: u8 = 11;
pub const T5: u8 = 13;
pub const S0: u8 = 16;
pub const S1: u8 = 17;
pub const SP: u8 = 29;
pub const RA: u8 = 31;

fn r_type(rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> u32 {
    ((rs as u32 & 31) << 21)
        | ((rt as u32 & 31) << 16)
        | ((rd as u32 & 31) << 11)
        | ((sa as u32 & 31) << 6)
        | (funct & 63)
}

fn i_type(opcode: u32, rs: u8, rt: u8, imm: u16) -> u32 {
    (opcode << 26) | ((rs as u32 & 31) << 21) | ((rt as u32 & 31) << 16) | imm as u32
}

pub fn nop() -> u32 {
    0
}

pub fn sll(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x00)
}
pub fn srl(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x02)
}
pub fn sra(rd: u8, rt: u8, sa: u8) -> u32 {
    r_type(0, rt, rd, sa, 0x03)
}
pub fn sllv(rd: u8, rt: u8, rs: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x04)
}
pub fn srav(rd: u8, rt: u8, rs: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x07)
}
pub fn jr(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, 0x08)
}
pub fn jalr(rd: u8, rs: u8) -> u32 {
    r_type(rs, 0, rd, 0, 0x09)
}
pub fn syscall(code: u32) -> u32 {
    ((code & 0xF_FFFF) << 6) | 0x0C
}
pub fn brk(code: u32) -> u32 {
    ((code & 0xF_FFFF) << 6) | 0x0D
}
pub fn mfhi(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, 0x10)
}
pub fn mthi(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, 0x11)
}
pub fn mflo(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, 0x12)
}
pub fn mtlo(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, 0x13)
}
pub fn mult(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x18)
}
pub fn multu(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x19)
}
pub fn div(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x1A)
}
pub fn divu(rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, 0, 0, 0x1B)
}
pub fn add(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x20)
}
pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}
pub fn sub(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x22)
}
pub fn subu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}
pub fn and(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}
pub fn or(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}
pub fn xor(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x26)
}
pub fn nor(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x27)
}
pub fn slt(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2A)
}
pub fn sltu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2B)
}
/// `move rd, rs`
pub fn mov(rd: u8, rs: u8) -> u32 {
    addu(rd, rs, ZERO)
}

pub fn bltz(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x00, offset as u16)
}
pub fn bgez(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x01, offset as u16)
}
pub fn bltzal(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x10, offset as u16)
}
pub fn bgezal(rs: u8, offset: i16) -> u32 {
    i_type(0x01, rs, 0x11, offset as u16)
}
pub fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF)
}
pub fn jal(target: u32) -> u32 {
    (0x03 << 26) | ((target >> 2) & 0x03FF_FFFF)
}
pub fn beq(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x04, rs, rt, offset as u16)
}
pub fn bne(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x05, rs, rt, offset as u16)
}
pub fn blez(rs: u8, offset: i16) -> u32 {
    i_type(0x06, rs, 0, offset as u16)
}
pub fn bgtz(rs: u8, offset: i16) -> u32 {
    i_type(0x07, rs, 0, offset as u16)
}
pub fn addi(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x08, rs, rt, imm as u16)
}
pub fn addiu(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm as u16)
}
pub fn slti(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x0A, rs, rt, imm as u16)
}
pub fn sltiu(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x0B, rs, rt, imm as u16)
}
pub fn andi(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0C, rs, rt, imm)
}
pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0D, rs, rt, imm)
}
pub fn xori(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0E, rs, rt, imm)
}
pub fn lui(rt: u8, imm: u16) -> u32 {
    i_type(0x0F, 0, rt, imm)
}

/// `li rt, value` as a lui/ori pair.
pub fn li(rt: u8, value: u32) -> [u32; 2] {
    [lui(rt, (value >> 16) as u16), ori(rt, rt, value as u16)]
}

pub fn mfc0(rt: u8, rd: u8) -> u32 {
    (0x10 << 26) | r_type(0x00, rt, rd, 0, 0)
}
pub fn mtc0(rt: u8, rd: u8) -> u32 {
    (0x10 << 26) | r_type(0x04, rt, rd, 0, 0)
}
pub fn rfe() -> u32 {
    (0x10 << 26) | (0x10 << 21) | 0x10
}

pub fn mfc1(rt: u8, fs: u8) -> u32 {
    (0x11 << 26) | r_type(0x00, rt, fs, 0, 0)
}
pub fn cfc1(rt: u8, fs: u8) -> u32 {
    (0x11 << 26) | r_type(0x02, rt, fs, 0, 0)
}
pub fn mtc1(rt: u8, fs: u8) -> u32 {
    (0x11 << 26) | r_type(0x04, rt, fs, 0, 0)
}
pub fn ctc1(rt: u8, fs: u8) -> u32 {
    (0x11 << 26) | r_type(0x06, rt, fs, 0, 0)
}
fn fpu_s(funct: u32, fd: u8, fs: u8, ft: u8) -> u32 {
    (0x11 << 26) | r_type(0x10, ft, fs, fd, funct)
}
pub fn add_s(fd: u8, fs: u8, ft: u8) -> u32 {
    fpu_s(0x00, fd, fs, ft)
}
pub fn sub_s(fd: u8, fs: u8, ft: u8) -> u32 {
    fpu_s(0x01, fd, fs, ft)
}
pub fn mul_s(fd: u8, fs: u8, ft: u8) -> u32 {
    fpu_s(0x02, fd, fs, ft)
}
pub fn div_s(fd: u8, fs: u8, ft: u8) -> u32 {
    fpu_s(0x03, fd, fs, ft)
}
pub fn neg_s(fd: u8, fs: u8) -> u32 {
    fpu_s(0x07, fd, fs, 0)
}
pub fn cvt_w_s(fd: u8, fs: u8) -> u32 {
    fpu_s(0x24, fd, fs, 0)
}
pub fn cvt_s_w(fd: u8, fs: u8) -> u32 {
    (0x11 << 26) | r_type(0x14, 0, fs, fd, 0x20)
}

pub fn lb(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x20, base, rt, offset as u16)
}
pub fn lh(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x21, base, rt, offset as u16)
}
pub fn lwl(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x22, base, rt, offset as u16)
}
pub fn lw(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x23, base, rt, offset as u16)
}
pub fn lbu(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x24, base, rt, offset as u16)
}
pub fn lhu(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x25, base, rt, offset as u16)
}
pub fn lwr(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x26, base, rt, offset as u16)
}
pub fn sb(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x28, base, rt, offset as u16)
}
pub fn sh(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x29, base, rt, offset as u16)
}
pub fn swl(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2A, base, rt, offset as u16)
}
pub fn sw(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2B, base, rt, offset as u16)
}
pub fn swr(rt: u8, base: u8, offset: i16) -> u32 {
    i_type(0x2E, base, rt, offset as u16)
}
pub fn lwc1(ft: u8, base: u8, offset: i16) -> u32 {
    i_type(0x31, base, ft, offset as u16)
}
pub fn swc1(ft: u8, base: u8, offset: i16) -> u32 {
    i_type(0x39, base, ft, offset as u16)
}

fn vector_op(major: u32, sub: u32, vd: u8, vs: u8, vt: u8) -> u32 {
    (major << 26)
        | ((sub & 7) << 23)
        | ((vt as u32 & 0x7F) << 16)
        | ((vs as u32 & 0x7F) << 8)
        | (vd as u32 & 0x7F)
}
pub fn vadd_s(vd: u8, vs: u8, vt: u8) -> u32 {
    vector_op(0x18, 0, vd, vs, vt)
}
pub fn vsub_s(vd: u8, vs: u8, vt: u8) -> u32 {
    vector_op(0x18, 1, vd, vs, vt)
}
pub fn vdiv_s(vd: u8, vs: u8, vt: u8) -> u32 {
    vector_op(0x18, 7, vd, vs, vt)
}
pub fn vmul_s(vd: u8, vs: u8, vt: u8) -> u32 {
    vector_op(0x19, 0, vd, vs, vt)
}
fn vpfx(kind: u32, data: u32) -> u32 {
    (0x37 << 26) | (kind << 24) | (data & 0x000F_FFFF)
}
pub fn vpfxs(data: u32) -> u32 {
    vpfx(0, data)
}
pub fn vpfxt(data: u32) -> u32 {
    vpfx(1, data)
}
pub fn vpfxd(data: u32) -> u32 {
    vpfx(2, data & 0xFFF)
}
fn vector_mem(major: u32, vt: u8, base: u8, offset: i16) -> u32 {
    (major << 26)
        | ((base as u32 & 31) << 21)
        | ((vt as u32 & 31) << 16)
        | (offset as u16 as u32 & 0xFFFC)
        | ((vt as u32 >> 5) & 3)
}
pub fn lv_s(vt: u8, base: u8, offset: i16) -> u32 {
    vector_mem(0x32, vt, base, offset)
}
pub fn sv_s(vt: u8, base: u8, offset: i16) -> u32 {
    vector_mem(0x3A, vt, base, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        // addiu $t0, $t0, 1
        assert_eq!(addiu(T0, T0, 1), 0x2508_0001);
        // jr $ra
        assert_eq!(jr(RA), 0x03E0_0008);
        // lui $at, 0x1f80
        assert_eq!(lui(AT, 0x1F80), 0x3C01_1F80);
        // j 0x00010010
        assert_eq!(j(0x0001_0010), 0x0800_4004);
        // sw $ra, 16($sp)
        assert_eq!(sw(RA, SP, 16), 0xAFBF_0010);
        // rfe
        assert_eq!(rfe(), 0x4200_0010);
    }
}
