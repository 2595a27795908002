//! Guest CPU exceptions.

use std::fmt;

use super::state::{cop0, GuestRegisters};

/// CAUSE.ExcCode values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    AddressLoad = 4,
    AddressStore = 5,
    InstructionBus = 6,
    DataBus = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
}

impl ExceptionCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            ExceptionCode::Interrupt => "INT",
            ExceptionCode::AddressLoad => "AdEL",
            ExceptionCode::AddressStore => "AdES",
            ExceptionCode::InstructionBus => "IBE",
            ExceptionCode::DataBus => "DBE",
            ExceptionCode::Syscall => "Sys",
            ExceptionCode::Breakpoint => "Bp",
            ExceptionCode::ReservedInstruction => "RI",
            ExceptionCode::CoprocessorUnusable => "CpU",
            ExceptionCode::Overflow => "Ov",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A pending guest exception, before it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestException {
    pub code: ExceptionCode,
    /// Faulting data or instruction address (address errors only).
    pub bad_vaddr: Option<u32>,
    /// Coprocessor number for CpU.
    pub coprocessor: Option<u8>,
}

impl GuestException {
    pub const fn new(code: ExceptionCode) -> Self {
        Self {
            code,
            bad_vaddr: None,
            coprocessor: None,
        }
    }

    pub const fn address(code: ExceptionCode, addr: u32) -> Self {
        Self {
            code,
            bad_vaddr: Some(addr),
            coprocessor: None,
        }
    }

    pub const fn unusable(cop: u8) -> Self {
        Self {
            code: ExceptionCode::CoprocessorUnusable,
            bad_vaddr: None,
            coprocessor: Some(cop),
        }
    }
}

pub const GENERAL_VECTOR: u32 = 0x8000_0080;
pub const BOOT_VECTOR: u32 = 0xBFC0_0180;

/// Deliver `exc` raised by the instruction at `pc`. Updates EPC, CAUSE, SR
/// and the fault registers, and returns the handler address.
pub fn enter_exception(
    regs: &mut GuestRegisters,
    exc: GuestException,
    pc: u32,
    in_delay_slot: bool,
) -> u32 {
    let mut epc = pc;
    if in_delay_slot {
        epc = epc.wrapping_sub(4);
        regs.set_cop0(cop0::TAR, pc);
    }
    regs.set_cop0(cop0::EPC, epc);

    let sr = regs.cop0(cop0::SR);
    regs.set_cop0(cop0::SR, (sr & !0x3F) | ((sr << 2) & 0x3F));

    let bd = in_delay_slot as u32;
    let mut cause = regs.cop0(cop0::CAUSE) & 0xFF00;
    cause |= (exc.code as u32) << 2;
    cause |= (bd << 31) | (bd << 30);
    if let Some(cop) = exc.coprocessor {
        cause |= ((cop as u32) & 3) << 28;
    }
    regs.set_cop0(cop0::CAUSE, cause);

    if let Some(addr) = exc.bad_vaddr {
        regs.set_cop0(cop0::BADA, addr);
    }

    regs.set_in_delay_slot(false);
    if sr & cop0::SR_BEV != 0 {
        BOOT_VECTOR
    } else {
        GENERAL_VECTOR
    }
}

/// Return from exception: pop the KU/IE stack.
pub fn return_from_exception(regs: &mut GuestRegisters) {
    let sr = regs.cop0(cop0::SR);
    regs.set_cop0(cop0::SR, (sr & !0x0F) | ((sr >> 2) & 0x0F));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_selection() {
        let mut regs = GuestRegisters::new();
        let syscall = GuestException::new(ExceptionCode::Syscall);
        let vector = enter_exception(&mut regs, syscall, 0x100, false);
        assert_eq!(vector, BOOT_VECTOR);

        regs.set_cop0(cop0::SR, 0);
        let syscall = GuestException::new(ExceptionCode::Syscall);
        let vector = enter_exception(&mut regs, syscall, 0x100, false);
        assert_eq!(vector, GENERAL_VECTOR);
        assert_eq!(regs.cop0(cop0::EPC), 0x100);
        assert_eq!(regs.cop0(cop0::CAUSE), 8 << 2);
    }

    #[test]
    fn test_delay_slot_adjustment() {
        let mut regs = GuestRegisters::new();
        regs.set_cop0(cop0::SR, 0);
        regs.set_cop0(cop0::CAUSE, 0x0000_0300 | 0x7C);
        enter_exception(
            &mut regs,
            GuestException::new(ExceptionCode::Overflow),
            0x8000_1004,
            true,
        );
        assert_eq!(regs.cop0(cop0::EPC), 0x8000_1000);
        assert_eq!(regs.cop0(cop0::TAR), 0x8000_1004);
        let cause = regs.cop0(cop0::CAUSE);
        assert_eq!(cause >> 30, 0b11);
        assert_eq!((cause >> 2) & 0x1F, ExceptionCode::Overflow as u32);
        assert_eq!(cause & 0x300, 0x300);
    }

    #[test]
    fn test_sr_stack_push_pop() {
        let mut regs = GuestRegisters::new();
        regs.set_cop0(cop0::SR, 0b00_01_01);
        enter_exception(&mut regs, GuestException::new(ExceptionCode::Breakpoint), 0, false);
        assert_eq!(regs.cop0(cop0::SR) & 0x3F, 0b01_01_00);
        return_from_exception(&mut regs);
        assert_eq!(regs.cop0(cop0::SR) & 0x3F, 0b01_01_01);
    }

    #[test]
    fn test_address_error_records_bad_vaddr() {
        let mut regs = GuestRegisters::new();
        enter_exception(
            &mut regs,
            GuestException::address(ExceptionCode::AddressLoad, 0x1001),
            0x200,
            false,
        );
        assert_eq!(regs.cop0(cop0::BADA), 0x1001);
    }

    #[test]
    fn test_coprocessor_unusable_sets_ce() {
        let mut regs = GuestRegisters::new();
        enter_exception(&mut regs, GuestException::unusable(2), 0, false);
        assert_eq!((regs.cop0(cop0::CAUSE) >> 28) & 3, 2);
    }
}
