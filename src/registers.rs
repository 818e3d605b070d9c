//! The x86-64 register catalog and the per-inferior register shadow.
//!
//! Every register the engine exposes is described by one [`RegisterInfo`]
//! entry: its DWARF number, its byte offset in the kernel's virtual `user`
//! struct, its size, and how its bytes are interpreted. The offsets are
//! computed from the `libc` layouts, so the catalog stays in lockstep with
//! the structs the kernel actually fills.
//!
//! A [`Registers`] value shadows the whole `user` area for one inferior.
//! Reads are served from the shadow; writes patch the shadow and flush the
//! affected register class back through ptrace. The process controller
//! refreshes the shadow in full on every stop.

use std::mem;
use std::slice;

use memoffset::offset_of;
use nix::sys::ptrace::{self, regset};
use nix::unistd::Pid;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Which kernel register block a catalog entry lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterType {
    Gpr,
    SubGpr,
    Fpr,
    Dr,
}

/// How a register's bytes are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterFormat {
    Uint,
    Sint,
    LongDouble,
    Vector,
}

/// Catalog entry describing a single register.
#[derive(Clone, Copy, Debug)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: &'static str,
    pub dwarf_id: i32,
    pub offset: usize,
    pub size: usize,
    pub format: RegisterFormat,
    pub ty: RegisterType,
}

macro_rules! gpr_offset {
    ($field:ident) => {
        offset_of!(libc::user, regs) + offset_of!(libc::user_regs_struct, $field)
    };
}

macro_rules! fpr_offset {
    ($field:ident) => {
        offset_of!(libc::user, i387) + offset_of!(libc::user_fpregs_struct, $field)
    };
}

fn dr_offset(slot: usize) -> usize {
    offset_of!(libc::user, u_debugreg) + slot * 8
}

macro_rules! register_entry {
    ($name:ident, gpr64, $dwarf:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: $dwarf,
            offset: gpr_offset!($name),
            size: 8,
            format: RegisterFormat::Uint,
            ty: RegisterType::Gpr,
        }
    };
    ($name:ident, gpr32, $base:ident) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            offset: gpr_offset!($base),
            size: 4,
            format: RegisterFormat::Uint,
            ty: RegisterType::SubGpr,
        }
    };
    ($name:ident, gpr16, $base:ident) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            offset: gpr_offset!($base),
            size: 2,
            format: RegisterFormat::Uint,
            ty: RegisterType::SubGpr,
        }
    };
    ($name:ident, gpr8l, $base:ident) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            offset: gpr_offset!($base),
            size: 1,
            format: RegisterFormat::Uint,
            ty: RegisterType::SubGpr,
        }
    };
    ($name:ident, gpr8h, $base:ident) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            offset: gpr_offset!($base) + 1,
            size: 1,
            format: RegisterFormat::Uint,
            ty: RegisterType::SubGpr,
        }
    };
    ($name:ident, fpr, $field:ident, $size:expr, $dwarf:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: $dwarf,
            offset: fpr_offset!($field),
            size: $size,
            format: RegisterFormat::Uint,
            ty: RegisterType::Fpr,
        }
    };
    ($name:ident, fp_st, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 33 + $n,
            offset: fpr_offset!(st_space) + 16 * $n,
            size: 16,
            format: RegisterFormat::LongDouble,
            ty: RegisterType::Fpr,
        }
    };
    ($name:ident, fp_mm, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 41 + $n,
            offset: fpr_offset!(st_space) + 16 * $n,
            size: 8,
            format: RegisterFormat::Vector,
            ty: RegisterType::Fpr,
        }
    };
    ($name:ident, fp_xmm, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 17 + $n,
            offset: fpr_offset!(xmm_space) + 16 * $n,
            size: 16,
            format: RegisterFormat::Vector,
            ty: RegisterType::Fpr,
        }
    };
    ($name:ident, dr, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            offset: dr_offset($n),
            size: 8,
            format: RegisterFormat::Uint,
            ty: RegisterType::Dr,
        }
    };
}

macro_rules! register_catalog {
    ($( $name:ident : $kind:ident ( $($arg:tt)* ) ; )*) => {
        /// Stable identifier for every register in the catalog.
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum RegisterId {
            $( $name ),*
        }

        static CATALOG: Lazy<Vec<RegisterInfo>> = Lazy::new(|| {
            vec![ $( register_entry!($name, $kind, $($arg)*) ),* ]
        });
    };
}

register_catalog! {
    // 64-bit general purpose
    rax: gpr64(0);
    rdx: gpr64(1);
    rcx: gpr64(2);
    rbx: gpr64(3);
    rsi: gpr64(4);
    rdi: gpr64(5);
    rbp: gpr64(6);
    rsp: gpr64(7);
    r8: gpr64(8);
    r9: gpr64(9);
    r10: gpr64(10);
    r11: gpr64(11);
    r12: gpr64(12);
    r13: gpr64(13);
    r14: gpr64(14);
    r15: gpr64(15);
    rip: gpr64(16);
    eflags: gpr64(49);
    cs: gpr64(51);
    fs: gpr64(54);
    gs: gpr64(55);
    ss: gpr64(52);
    ds: gpr64(53);
    es: gpr64(50);
    fs_base: gpr64(58);
    gs_base: gpr64(59);
    orig_rax: gpr64(-1);

    // 32-bit aliases
    eax: gpr32(rax);
    edx: gpr32(rdx);
    ecx: gpr32(rcx);
    ebx: gpr32(rbx);
    esi: gpr32(rsi);
    edi: gpr32(rdi);
    ebp: gpr32(rbp);
    esp: gpr32(rsp);
    r8d: gpr32(r8);
    r9d: gpr32(r9);
    r10d: gpr32(r10);
    r11d: gpr32(r11);
    r12d: gpr32(r12);
    r13d: gpr32(r13);
    r14d: gpr32(r14);
    r15d: gpr32(r15);

    // 16-bit aliases
    ax: gpr16(rax);
    dx: gpr16(rdx);
    cx: gpr16(rcx);
    bx: gpr16(rbx);
    si: gpr16(rsi);
    di: gpr16(rdi);
    bp: gpr16(rbp);
    sp: gpr16(rsp);
    r8w: gpr16(r8);
    r9w: gpr16(r9);
    r10w: gpr16(r10);
    r11w: gpr16(r11);
    r12w: gpr16(r12);
    r13w: gpr16(r13);
    r14w: gpr16(r14);
    r15w: gpr16(r15);

    // 8-bit high aliases
    ah: gpr8h(rax);
    dh: gpr8h(rdx);
    ch: gpr8h(rcx);
    bh: gpr8h(rbx);

    // 8-bit low aliases
    al: gpr8l(rax);
    dl: gpr8l(rdx);
    cl: gpr8l(rcx);
    bl: gpr8l(rbx);
    sil: gpr8l(rsi);
    dil: gpr8l(rdi);
    bpl: gpr8l(rbp);
    spl: gpr8l(rsp);
    r8b: gpr8l(r8);
    r9b: gpr8l(r9);
    r10b: gpr8l(r10);
    r11b: gpr8l(r11);
    r12b: gpr8l(r12);
    r13b: gpr8l(r13);
    r14b: gpr8l(r14);
    r15b: gpr8l(r15);

    // x87 control and status
    fcw: fpr(cwd, 2, 65);
    fsw: fpr(swd, 2, 66);
    ftw: fpr(ftw, 2, -1);
    fop: fpr(fop, 2, -1);
    frip: fpr(rip, 8, -1);
    frdp: fpr(rdp, 8, -1);
    mxcsr: fpr(mxcsr, 4, 64);
    mxcsrmask: fpr(mxcr_mask, 4, -1);

    // x87 stack (80-bit values in 16-byte slots)
    st0: fp_st(0);
    st1: fp_st(1);
    st2: fp_st(2);
    st3: fp_st(3);
    st4: fp_st(4);
    st5: fp_st(5);
    st6: fp_st(6);
    st7: fp_st(7);

    // MMX aliases of the x87 stack
    mm0: fp_mm(0);
    mm1: fp_mm(1);
    mm2: fp_mm(2);
    mm3: fp_mm(3);
    mm4: fp_mm(4);
    mm5: fp_mm(5);
    mm6: fp_mm(6);
    mm7: fp_mm(7);

    // SSE
    xmm0: fp_xmm(0);
    xmm1: fp_xmm(1);
    xmm2: fp_xmm(2);
    xmm3: fp_xmm(3);
    xmm4: fp_xmm(4);
    xmm5: fp_xmm(5);
    xmm6: fp_xmm(6);
    xmm7: fp_xmm(7);
    xmm8: fp_xmm(8);
    xmm9: fp_xmm(9);
    xmm10: fp_xmm(10);
    xmm11: fp_xmm(11);
    xmm12: fp_xmm(12);
    xmm13: fp_xmm(13);
    xmm14: fp_xmm(14);
    xmm15: fp_xmm(15);

    // debug registers
    dr0: dr(0);
    dr1: dr(1);
    dr2: dr(2);
    dr3: dr(3);
    dr4: dr(4);
    dr5: dr(5);
    dr6: dr(6);
    dr7: dr(7);
}

impl RegisterId {
    /// The id of debug address register `slot` (0..=7).
    pub fn debug(slot: usize) -> Option<RegisterId> {
        use RegisterId::*;
        [dr0, dr1, dr2, dr3, dr4, dr5, dr6, dr7].get(slot).copied()
    }
}

/// The whole catalog, in declaration order.
pub fn register_catalog() -> &'static [RegisterInfo] {
    &CATALOG
}

pub fn register_info_by_id(id: RegisterId) -> &'static RegisterInfo {
    let info = &CATALOG[id as usize];
    debug_assert_eq!(info.id, id);
    info
}

pub fn register_info_by_name(name: &str) -> Result<&'static RegisterInfo> {
    CATALOG
        .iter()
        .find(|info| info.name == name)
        .ok_or_else(|| Error::UnknownRegister { name: name.into() })
}

pub fn register_info_by_dwarf(dwarf_id: i32) -> Option<&'static RegisterInfo> {
    if dwarf_id < 0 {
        return None;
    }
    CATALOG.iter().find(|info| info.dwarf_id == dwarf_id)
}

/// A register value tagged with its interpretation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    LongDouble([u8; 16]),
    Byte64([u8; 8]),
    Byte128([u8; 16]),
}

impl RegisterValue {
    pub fn size(&self) -> usize {
        match self {
            Self::U8(_) | Self::I8(_) => 1,
            Self::U16(_) | Self::I16(_) => 2,
            Self::U32(_) | Self::I32(_) => 4,
            Self::U64(_) | Self::I64(_) => 8,
            Self::Byte64(_) => 8,
            Self::LongDouble(_) | Self::Byte128(_) => 16,
        }
    }

    // Widen into a 16-byte little-endian buffer: zero-extended for unsigned
    // values, sign-extended for signed ones, copied for raw bytes.
    fn widen(&self) -> [u8; 16] {
        match *self {
            Self::U8(v) => (v as u128).to_le_bytes(),
            Self::U16(v) => (v as u128).to_le_bytes(),
            Self::U32(v) => (v as u128).to_le_bytes(),
            Self::U64(v) => (v as u128).to_le_bytes(),
            Self::I8(v) => (v as i128).to_le_bytes(),
            Self::I16(v) => (v as i128).to_le_bytes(),
            Self::I32(v) => (v as i128).to_le_bytes(),
            Self::I64(v) => (v as i128).to_le_bytes(),
            Self::LongDouble(bytes) | Self::Byte128(bytes) => bytes,
            Self::Byte64(bytes) => {
                let mut out = [0u8; 16];
                out[..8].copy_from_slice(&bytes);
                out
            }
        }
    }
}

/// Extraction of a concrete integer from a [`RegisterValue`].
pub trait FromRegisterValue: Sized {
    fn from_register_value(value: RegisterValue) -> Option<Self>;
}

macro_rules! impl_from_register_value {
    ($( $ty:ty => $variant:ident ),* $(,)?) => {
        $(
            impl FromRegisterValue for $ty {
                fn from_register_value(value: RegisterValue) -> Option<Self> {
                    match value {
                        RegisterValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_register_value! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
}

fn chunk<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Shadow of one inferior's kernel `user` area.
#[derive(Debug)]
pub struct Registers {
    pid: Pid,
    data: libc::user,
}

impl Registers {
    pub(crate) fn new(pid: Pid) -> Self {
        // SAFETY: `user` is a plain kernel data struct for which the
        // all-zeroes pattern is a valid value.
        let data = unsafe { mem::zeroed() };
        Self { pid, data }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `user` is repr(C) with no uninitialized padding observed;
        // we only view it as bytes within its own size.
        unsafe {
            slice::from_raw_parts(
                (&self.data as *const libc::user).cast::<u8>(),
                mem::size_of::<libc::user>(),
            )
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_bytes`; byte-level writes cannot produce an
        // invalid `user` value.
        unsafe {
            slice::from_raw_parts_mut(
                (&mut self.data as *mut libc::user).cast::<u8>(),
                mem::size_of::<libc::user>(),
            )
        }
    }

    /// Interpret the shadow bytes of `info` per its catalog entry.
    pub fn read(&self, info: &RegisterInfo) -> Result<RegisterValue> {
        let bytes = &self.as_bytes()[info.offset..info.offset + info.size];
        let value = match (info.format, info.size) {
            (RegisterFormat::Uint, 1) => RegisterValue::U8(bytes[0]),
            (RegisterFormat::Uint, 2) => RegisterValue::U16(u16::from_le_bytes(chunk(bytes))),
            (RegisterFormat::Uint, 4) => RegisterValue::U32(u32::from_le_bytes(chunk(bytes))),
            (RegisterFormat::Uint, 8) => RegisterValue::U64(u64::from_le_bytes(chunk(bytes))),
            (RegisterFormat::Sint, 1) => RegisterValue::I8(bytes[0] as i8),
            (RegisterFormat::Sint, 2) => RegisterValue::I16(i16::from_le_bytes(chunk(bytes))),
            (RegisterFormat::Sint, 4) => RegisterValue::I32(i32::from_le_bytes(chunk(bytes))),
            (RegisterFormat::Sint, 8) => RegisterValue::I64(i64::from_le_bytes(chunk(bytes))),
            (RegisterFormat::LongDouble, 16) => RegisterValue::LongDouble(chunk(bytes)),
            (RegisterFormat::Vector, 8) => RegisterValue::Byte64(chunk(bytes)),
            (RegisterFormat::Vector, 16) => RegisterValue::Byte128(chunk(bytes)),
            (format, size) => internal_error!("unsupported register shape {format:?}/{size}"),
        };
        Ok(value)
    }

    pub fn read_by_id(&self, id: RegisterId) -> Result<RegisterValue> {
        self.read(register_info_by_id(id))
    }

    pub fn read_by_id_as<T: FromRegisterValue>(&self, id: RegisterId) -> Result<T> {
        let info = register_info_by_id(id);
        let value = self.read(info)?;
        T::from_register_value(value).ok_or(Error::RegisterValue {
            register: info.name,
        })
    }

    // Patch the shadow without flushing to the kernel.
    pub(crate) fn store(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        if value.size() > info.size {
            return Err(Error::RegisterValue {
                register: info.name,
            });
        }
        let widened = value.widen();
        self.as_bytes_mut()[info.offset..info.offset + info.size]
            .copy_from_slice(&widened[..info.size]);
        Ok(())
    }

    /// Patch the shadow and flush the affected register class.
    pub fn write(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        self.store(info, value)?;
        self.flush(info)
    }

    pub fn write_by_id(&mut self, id: RegisterId, value: RegisterValue) -> Result<()> {
        self.write(register_info_by_id(id), value)
    }

    // GPR and sub-register writes flush the whole GPR block, FPR writes the
    // whole FPR block, and debug register writes a single user-area word.
    fn flush(&mut self, info: &RegisterInfo) -> Result<()> {
        match info.ty {
            RegisterType::Gpr | RegisterType::SubGpr => ptrace::setregs(self.pid, self.data.regs)
                .map_err(|source| Error::Ptrace {
                    request: "SETREGS",
                    pid: self.pid,
                    source,
                }),
            RegisterType::Fpr => {
                ptrace::setregset::<regset::NT_PRFPREG>(self.pid, self.data.i387).map_err(
                    |source| Error::Ptrace {
                        request: "SETREGSET",
                        pid: self.pid,
                        source,
                    },
                )
            }
            RegisterType::Dr => {
                let word = u64::from_le_bytes(chunk(&self.as_bytes()[info.offset..info.offset + 8]));
                ptrace::write_user(
                    self.pid,
                    info.offset as ptrace::AddressType,
                    word as libc::c_long,
                )
                .map_err(|source| Error::Ptrace {
                    request: "POKEUSER",
                    pid: self.pid,
                    source,
                })
            }
        }
    }

    // Refresh the whole shadow from the kernel: the GPR block, the FPR
    // block, and each debug register word.
    pub(crate) fn read_all(&mut self) -> Result<()> {
        self.data.regs = ptrace::getregs(self.pid).map_err(|source| Error::Ptrace {
            request: "GETREGS",
            pid: self.pid,
            source,
        })?;
        self.data.i387 = ptrace::getregset::<regset::NT_PRFPREG>(self.pid).map_err(|source| {
            Error::Ptrace {
                request: "GETREGSET",
                pid: self.pid,
                source,
            }
        })?;
        for slot in 0..8 {
            let offset = dr_offset(slot);
            let word = ptrace::read_user(self.pid, offset as ptrace::AddressType).map_err(
                |source| Error::Ptrace {
                    request: "PEEKUSER",
                    pid: self.pid,
                    source,
                },
            )?;
            self.data.u_debugreg[slot] = word as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shadow() -> Registers {
        Registers::new(Pid::from_raw(0))
    }

    #[test]
    fn catalog_offsets_follow_the_user_layout() {
        let rax = register_info_by_id(RegisterId::rax);
        assert_eq!(rax.offset, gpr_offset!(rax));
        assert_eq!(rax.size, 8);

        let al = register_info_by_id(RegisterId::al);
        let ah = register_info_by_id(RegisterId::ah);
        assert_eq!(al.offset, rax.offset);
        assert_eq!(ah.offset, rax.offset + 1);

        let dr0 = register_info_by_id(RegisterId::dr0);
        let dr7 = register_info_by_id(RegisterId::dr7);
        assert_eq!(dr7.offset - dr0.offset, 56);

        let st0 = register_info_by_id(RegisterId::st0);
        let mm0 = register_info_by_id(RegisterId::mm0);
        assert_eq!(st0.offset, mm0.offset);
        assert_eq!(st0.size, 16);
        assert_eq!(mm0.size, 8);
    }

    #[test]
    fn lookup_by_name_and_dwarf() {
        assert_eq!(register_info_by_name("rip").unwrap().id, RegisterId::rip);
        assert_eq!(register_info_by_name("mxcsr").unwrap().dwarf_id, 64);
        assert!(matches!(
            register_info_by_name("r42"),
            Err(Error::UnknownRegister { .. })
        ));

        assert_eq!(register_info_by_dwarf(0).unwrap().id, RegisterId::rax);
        assert_eq!(register_info_by_dwarf(17).unwrap().id, RegisterId::xmm0);
        assert!(register_info_by_dwarf(-1).is_none());
    }

    #[test]
    fn sub_register_reads_view_the_containing_slot() {
        let mut regs = shadow();
        regs.store(
            register_info_by_id(RegisterId::rax),
            RegisterValue::U64(0x1122_3344_5566_7788),
        )
        .unwrap();

        assert_eq!(
            regs.read_by_id(RegisterId::eax).unwrap(),
            RegisterValue::U32(0x5566_7788)
        );
        assert_eq!(
            regs.read_by_id(RegisterId::ax).unwrap(),
            RegisterValue::U16(0x7788)
        );
        assert_eq!(regs.read_by_id(RegisterId::al).unwrap(), RegisterValue::U8(0x88));
        assert_eq!(regs.read_by_id(RegisterId::ah).unwrap(), RegisterValue::U8(0x77));
    }

    #[test]
    fn sub_register_writes_preserve_untouched_bytes() {
        let mut regs = shadow();
        regs.store(
            register_info_by_id(RegisterId::rax),
            RegisterValue::U64(0x1122_3344_5566_7788),
        )
        .unwrap();
        regs.store(register_info_by_id(RegisterId::al), RegisterValue::U8(0xff))
            .unwrap();

        assert_eq!(
            regs.read_by_id_as::<u64>(RegisterId::rax).unwrap(),
            0x1122_3344_5566_77ff
        );
    }

    #[test]
    fn narrow_writes_widen_per_signedness() {
        let mut regs = shadow();

        regs.store(register_info_by_id(RegisterId::rsi), RegisterValue::I8(-1))
            .unwrap();
        assert_eq!(regs.read_by_id_as::<u64>(RegisterId::rsi).unwrap(), u64::MAX);

        regs.store(register_info_by_id(RegisterId::rdi), RegisterValue::U8(0x80))
            .unwrap();
        assert_eq!(regs.read_by_id_as::<u64>(RegisterId::rdi).unwrap(), 0x80);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut regs = shadow();
        let err = regs
            .store(register_info_by_id(RegisterId::al), RegisterValue::U64(1))
            .unwrap_err();
        assert!(matches!(err, Error::RegisterValue { register: "al" }));
    }

    #[test]
    fn vector_and_long_double_shapes() {
        let mut regs = shadow();

        let bytes = *b"0123456789abcdef";
        regs.store(
            register_info_by_id(RegisterId::xmm3),
            RegisterValue::Byte128(bytes),
        )
        .unwrap();
        assert_eq!(
            regs.read_by_id(RegisterId::xmm3).unwrap(),
            RegisterValue::Byte128(bytes)
        );

        assert!(matches!(
            regs.read_by_id(RegisterId::st0).unwrap(),
            RegisterValue::LongDouble(_)
        ));
        assert!(matches!(
            regs.read_by_id(RegisterId::mm1).unwrap(),
            RegisterValue::Byte64(_)
        ));
    }
}
