//! Physical registers.
//!
//! The allocator knows very little about registers: each register has a dense [RegIdx], belongs
//! to a [RegClass], may or may not be available for allocation, and is either caller or callee
//! saved in the target's standard ABI. Everything else (e.g. encodings) is carried along for the
//! benefit of code emission.

use dynasmrt::{
    Register,
    x64::{Rq, Rx},
};
use index_vec::IndexVec;
use std::fmt::{Display, Formatter};
use strum::Display;

index_vec::define_index_type! {
    pub struct RegIdx = u8;
}

/// The class of values a register can hold.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum RegClass {
    /// General purpose registers: integers and references.
    #[strum(to_string = "gp")]
    Gp,
    /// Floating point registers.
    #[strum(to_string = "fp")]
    Fp,
}

#[derive(Clone, Debug)]
pub struct RegInfo {
    name: String,
    class: RegClass,
    allocatable: bool,
    caller_saved: bool,
    /// The DWARF register number, used when describing locations to the runtime.
    dwarf: u16,
    /// The hardware encoding of the register.
    hw_code: u8,
}

impl RegInfo {
    pub fn new(
        name: &str,
        class: RegClass,
        allocatable: bool,
        caller_saved: bool,
        dwarf: u16,
        hw_code: u8,
    ) -> Self {
        Self {
            name: name.to_owned(),
            class,
            allocatable,
            caller_saved,
            dwarf,
            hw_code,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> RegClass {
        self.class
    }

    pub fn is_allocatable(&self) -> bool {
        self.allocatable
    }

    /// Is this register clobbered by a call in the target's standard ABI?
    pub fn is_caller_saved(&self) -> bool {
        self.caller_saved
    }

    pub fn dwarf(&self) -> u16 {
        self.dwarf
    }

    pub fn hw_code(&self) -> u8 {
        self.hw_code
    }
}

/// The set of physical registers of a target. The order of registers in the catalog is the order
/// in which the allocators prefer them.
#[derive(Clone, Debug)]
pub struct RegisterCatalog {
    regs: IndexVec<RegIdx, RegInfo>,
}

impl RegisterCatalog {
    pub fn new(regs: Vec<RegInfo>) -> Self {
        Self {
            regs: IndexVec::from_vec(regs),
        }
    }

    /// The registers of SysV x64. `rsp` and `rbp` are part of the catalog (so that they can be
    /// named as fixed registers) but are never allocated.
    pub fn x64_sysv() -> Self {
        let mut regs = Vec::new();
        for rq in [
            Rq::RAX,
            Rq::RCX,
            Rq::RDX,
            Rq::RSI,
            Rq::RDI,
            Rq::R8,
            Rq::R9,
            Rq::R10,
            Rq::R11,
            Rq::RBX,
            Rq::R12,
            Rq::R13,
            Rq::R14,
            Rq::R15,
            Rq::RSP,
            Rq::RBP,
        ] {
            let (name, dwarf) = rq_name_dwarf(rq);
            let allocatable = !matches!(rq, Rq::RSP | Rq::RBP);
            let caller_saved = matches!(
                rq,
                Rq::RAX
                    | Rq::RDI
                    | Rq::RSI
                    | Rq::RDX
                    | Rq::RCX
                    | Rq::R8
                    | Rq::R9
                    | Rq::R10
                    | Rq::R11
            );
            regs.push(RegInfo::new(
                name,
                RegClass::Gp,
                allocatable,
                caller_saved,
                dwarf,
                rq.code(),
            ));
        }
        for (i, rx) in [
            Rx::XMM0,
            Rx::XMM1,
            Rx::XMM2,
            Rx::XMM3,
            Rx::XMM4,
            Rx::XMM5,
            Rx::XMM6,
            Rx::XMM7,
            Rx::XMM8,
            Rx::XMM9,
            Rx::XMM10,
            Rx::XMM11,
            Rx::XMM12,
            Rx::XMM13,
            Rx::XMM14,
            Rx::XMM15,
        ]
        .into_iter()
        .enumerate()
        {
            // SysV has no callee-saved floating point registers.
            regs.push(RegInfo::new(
                &format!("xmm{i}"),
                RegClass::Fp,
                true,
                true,
                17 + u16::try_from(i).unwrap(),
                rx.code(),
            ));
        }
        Self::new(regs)
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn info(&self, reg: RegIdx) -> &RegInfo {
        &self.regs[reg]
    }

    pub fn name(&self, reg: RegIdx) -> &str {
        self.regs[reg].name()
    }

    pub fn is_caller_saved(&self, reg: RegIdx) -> bool {
        self.regs[reg].is_caller_saved()
    }

    /// Return the register called `name`, if there is one.
    pub fn by_name(&self, name: &str) -> Option<RegIdx> {
        self.regs
            .iter_enumerated()
            .find(|(_, x)| x.name == name)
            .map(|(reg, _)| reg)
    }

    /// Iterate, in preference order, over the allocatable registers of class `class`.
    pub fn allocatable(&self, class: RegClass) -> impl Iterator<Item = RegIdx> + '_ {
        self.regs
            .iter_enumerated()
            .filter(move |(_, x)| x.allocatable && x.class == class)
            .map(|(reg, _)| reg)
    }

    /// Return an object that displays `reg` by name.
    pub fn display(&self, reg: RegIdx) -> DisplayableReg<'_> {
        DisplayableReg { cat: self, reg }
    }
}

pub struct DisplayableReg<'a> {
    cat: &'a RegisterCatalog,
    reg: RegIdx,
}

impl Display for DisplayableReg<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cat.name(self.reg))
    }
}

fn rq_name_dwarf(rq: Rq) -> (&'static str, u16) {
    match rq {
        Rq::RAX => ("rax", 0),
        Rq::RDX => ("rdx", 1),
        Rq::RCX => ("rcx", 2),
        Rq::RBX => ("rbx", 3),
        Rq::RSI => ("rsi", 4),
        Rq::RDI => ("rdi", 5),
        Rq::RBP => ("rbp", 6),
        Rq::RSP => ("rsp", 7),
        Rq::R8 => ("r8", 8),
        Rq::R9 => ("r9", 9),
        Rq::R10 => ("r10", 10),
        Rq::R11 => ("r11", 11),
        Rq::R12 => ("r12", 12),
        Rq::R13 => ("r13", 13),
        Rq::R14 => ("r14", 14),
        Rq::R15 => ("r15", 15),
    }
}

/// A small catalog for tests: `ngp` general purpose registers `r0..` and `nfp` floating point
/// registers `f0..`. The first half (rounded up) of each class is caller saved.
#[cfg(test)]
pub(crate) fn test_catalog(ngp: usize, nfp: usize) -> RegisterCatalog {
    let mut regs = Vec::new();
    for i in 0..ngp {
        let code = u8::try_from(i).unwrap();
        regs.push(RegInfo::new(
            &format!("r{i}"),
            RegClass::Gp,
            true,
            i < ngp.div_ceil(2),
            u16::from(code),
            code,
        ));
    }
    for i in 0..nfp {
        let code = u8::try_from(i).unwrap();
        regs.push(RegInfo::new(
            &format!("f{i}"),
            RegClass::Fp,
            true,
            i < nfp.div_ceil(2),
            17 + u16::from(code),
            code,
        ));
    }
    RegisterCatalog::new(regs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x64_sysv() {
        let cat = RegisterCatalog::x64_sysv();
        assert_eq!(cat.len(), 32);
        let rax = cat.by_name("rax").unwrap();
        assert!(cat.is_caller_saved(rax));
        assert_eq!(cat.info(rax).dwarf(), 0);
        let rbx = cat.by_name("rbx").unwrap();
        assert!(!cat.is_caller_saved(rbx));
        assert_eq!(cat.info(rbx).dwarf(), 3);
        assert_eq!(cat.info(cat.by_name("xmm15").unwrap()).dwarf(), 32);
        assert!(cat.by_name("eax").is_none());

        let gp = cat.allocatable(RegClass::Gp).collect::<Vec<_>>();
        assert_eq!(gp.len(), 14);
        assert!(!gp.contains(&cat.by_name("rsp").unwrap()));
        assert!(!gp.contains(&cat.by_name("rbp").unwrap()));
        assert_eq!(cat.allocatable(RegClass::Fp).count(), 16);
    }

    #[test]
    fn test_catalog_caller_saved() {
        let cat = test_catalog(3, 2);
        assert_eq!(
            cat.allocatable(RegClass::Gp)
                .map(|x| cat.is_caller_saved(x))
                .collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(
            cat.allocatable(RegClass::Fp)
                .map(|x| cat.name(x).to_owned())
                .collect::<Vec<_>>(),
            vec!["f0", "f1"]
        );
        assert_eq!(cat.display(RegIdx::from_usize(1)).to_string(), "r1");
    }
}
