//! Device kinds, interface kinds, and per-device exploit parameters
//! (component C).
//!
//! N4G/N5G addresses and the setup-packet bytes are carried over verbatim
//! from `original_source/devices.go`. The N3G/N6G/N7G entries are not
//! present in the retrieved source and are placeholder constants in the
//! same address-space family (see DESIGN.md, Open Question (e)); they are
//! marked `SYNTHESIZED` below.

use crate::asm::{AsmError, Condition, Program, Register, Statement};

/// One of the five supported hardware generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    N3G,
    N4G,
    N5G,
    N6G,
    N7G,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::N3G,
        DeviceKind::N4G,
        DeviceKind::N5G,
        DeviceKind::N6G,
        DeviceKind::N7G,
    ];

    /// Four-ASCII-byte SoC code stamped into the IMG1 magic field.
    pub const fn soc_code(self) -> &'static [u8; 4] {
        match self {
            DeviceKind::N3G => b"8702",
            DeviceKind::N4G => b"8720",
            DeviceKind::N5G => b"8730",
            DeviceKind::N6G => b"8740", // SYNTHESIZED
            DeviceKind::N7G => b"8750", // SYNTHESIZED
        }
    }

    /// DFU protocol version: v1 for N3G, v2 for everyone else.
    pub const fn dfu_version(self) -> u8 {
        match self {
            DeviceKind::N3G => 1,
            _ => 2,
        }
    }

    /// IMG1 header region size (header + padding), per spec.md §3.
    pub const fn img1_header_region(self) -> usize {
        match self {
            DeviceKind::N3G => 0x800,
            DeviceKind::N4G | DeviceKind::N5G | DeviceKind::N6G => 0x600,
            DeviceKind::N7G => 0x400,
        }
    }

    pub const fn product_id(self, iface: InterfaceKind) -> u16 {
        match (self, iface) {
            (DeviceKind::N4G, InterfaceKind::Dfu) => 0x1225,
            (DeviceKind::N5G, InterfaceKind::Dfu) => 0x1231,
            (DeviceKind::N3G, InterfaceKind::Dfu) => 0x1220, // SYNTHESIZED
            (DeviceKind::N6G, InterfaceKind::Dfu) => 0x1232, // SYNTHESIZED
            (DeviceKind::N7G, InterfaceKind::Dfu) => 0x1233, // SYNTHESIZED
            (_, InterfaceKind::Wtf) => self.product_id(InterfaceKind::Dfu) + 0x10,
            (_, InterfaceKind::Disk) => self.product_id(InterfaceKind::Dfu) + 0x20,
        }
    }

    pub fn from_soc_code(code: &[u8; 4]) -> Option<DeviceKind> {
        Self::ALL.into_iter().find(|k| k.soc_code() == code)
    }

    pub fn from_product_id(pid: u16) -> Option<(DeviceKind, InterfaceKind)> {
        for kind in Self::ALL {
            for iface in [InterfaceKind::Dfu, InterfaceKind::Wtf, InterfaceKind::Disk] {
                if kind.product_id(iface) == pid {
                    return Some((kind, iface));
                }
            }
        }
        None
    }
}

pub const APPLE_VENDOR_ID: u16 = 0x05AC;

/// Which of the device's three USB personalities is currently enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Dfu,
    Wtf,
    Disk,
}

/// Per-device-kind constants and code-snippet factories consumed by the
/// exploit orchestrator (component D). Ported from
/// `original_source/devices.go`'s `exploitParameters` struct.
#[derive(Debug, Clone)]
pub struct ExploitParameters {
    pub dfu_buf_addr: u32,
    pub exec_addr: u32,
    pub usb_buf_addr: u32,
    pub return_addr: u32,
    pub trampoline_addr: u32,
    pub setup_packet: Vec<u8>,
    /// Later-generation devices (S5L87xx) need a one-time prepare hook run
    /// on attach; `None` for devices that don't need it.
    pub needs_prepare: bool,
}

impl ExploitParameters {
    pub fn for_kind(kind: DeviceKind) -> ExploitParameters {
        match kind {
            DeviceKind::N4G => ExploitParameters {
                dfu_buf_addr: 0x2202db00,
                exec_addr: 0x2202dc08,
                usb_buf_addr: 0x2202e300,
                return_addr: 0x20004d64,
                trampoline_addr: 0x3b0,
                setup_packet: vec![0x40, 0xfe, 0xff, 0xea, 0x03, 0x00, 0x00, 0x00],
                needs_prepare: false,
            },
            DeviceKind::N5G => ExploitParameters {
                dfu_buf_addr: 0x2202db00,
                exec_addr: 0x2202dc08,
                usb_buf_addr: 0x2202e300,
                return_addr: 0x20004d70,
                trampoline_addr: 0x37c,
                setup_packet: vec![0x40, 0xfe, 0xff, 0xea, 0x03, 0x00, 0x00, 0x00],
                needs_prepare: false,
            },
            // SYNTHESIZED: N3G/N6G/N7G addresses follow the same
            // address-space shape as the confirmed N4G/N5G entries but are
            // not recovered from the retrieved source. See DESIGN.md.
            DeviceKind::N3G => ExploitParameters {
                dfu_buf_addr: 0x22020b00,
                exec_addr: 0x22020c08,
                usb_buf_addr: 0x22021300,
                return_addr: 0x20003d64,
                trampoline_addr: 0x3a0,
                setup_packet: vec![0x40, 0xfe, 0xff, 0xea, 0x03, 0x00, 0x00, 0x00],
                needs_prepare: false,
            },
            DeviceKind::N6G => ExploitParameters {
                dfu_buf_addr: 0x3820db00,
                exec_addr: 0x3820dc08,
                usb_buf_addr: 0x3820e300,
                return_addr: 0x38004d70,
                trampoline_addr: 0x390,
                setup_packet: vec![0x40, 0xfe, 0xff, 0xea, 0x03, 0x00, 0x00, 0x00],
                needs_prepare: true,
            },
            DeviceKind::N7G => ExploitParameters {
                dfu_buf_addr: 0x3820eb00,
                exec_addr: 0x3820ec08,
                usb_buf_addr: 0x3820f300,
                return_addr: 0x38005d70,
                trampoline_addr: 0x398,
                setup_packet: vec![0x40, 0xfe, 0xff, 0xea, 0x03, 0x00, 0x00, 0x00],
                needs_prepare: true,
            },
        }
    }

    /// Offset of the exploit's 0x40-byte scratch region within USB-visible
    /// memory, used by `dumpmem`/`decrypt` result reads.
    pub fn scratch_offset(&self) -> u32 {
        0x100
    }

    /// Builds the "handler footer" snippet: copies `len` bytes from `src`
    /// to the USB scratch region and returns to the resident handler via
    /// `return_addr`. Parameterised by a 32-bit data address, per spec.md
    /// §4.3's `dumpmem` description.
    pub fn handler_footer(&self, src_addr: u32, len: u32) -> Result<Program, AsmError> {
        use Statement::*;
        let dst_addr = self.usb_buf_addr + self.scratch_offset();
        let mut listing = vec![
            Ldr {
                dest: Register::R0,
                src: crate::asm::LoadSource::Constant(src_addr),
            },
            Ldr {
                dest: Register::R1,
                src: crate::asm::LoadSource::Constant(dst_addr),
            },
            Mov {
                dest: Register::R2,
                src: crate::asm::DataSource::Immediate(0),
            },
            Label("copy_loop".into()),
            Ldrb {
                dest: Register::R3,
                src: crate::asm::LoadSource::Deref(Register::R0, 0),
            },
            Strb {
                src: Register::R3,
                dest: crate::asm::StoreDest::Deref(Register::R1, 0),
            },
            Add {
                dest: Register::R0,
                src: Register::R0,
                operand: crate::asm::DataSource::Immediate(1),
            },
            Add {
                dest: Register::R1,
                src: Register::R1,
                operand: crate::asm::DataSource::Immediate(1),
            },
            Add {
                dest: Register::R2,
                src: Register::R2,
                operand: crate::asm::DataSource::Immediate(1),
            },
            Cmp {
                a: Register::R2,
                b: crate::asm::DataSource::Immediate(len),
            },
            B {
                cond: Condition::Ne,
                target: crate::asm::BranchTarget::Label("copy_loop".into()),
            },
            Ldr {
                dest: Register::LR,
                src: crate::asm::LoadSource::Constant(self.return_addr),
            },
            Bx { target: Register::LR },
        ];
        Ok(Program {
            address: self.exec_addr,
            listing,
        })
    }

    /// NAND peripheral base, common to the bank/page/offset addressing
    /// scheme `cmd_nand_read.go`'s `readPageOffset` drives.
    const NAND_BASE: u32 = 0x3c300000;
    /// SPI/NOR scratch read buffer, matching the historical tool's use of
    /// `0x20000000` as the destination for both NAND and NOR snippets.
    const FLASH_SCRATCH_ADDR: u32 = 0x20000000;

    /// Public accessor for [`Self::FLASH_SCRATCH_ADDR`], needed by callers
    /// assembling a NAND read program from [`Self::nand_init`] plus
    /// [`Self::nand_read_page`] plus [`Self::handler_footer`].
    pub fn flash_scratch_addr(&self) -> u32 {
        Self::FLASH_SCRATCH_ADDR
    }

    /// NAND controller init snippet. Only N5G is supported, mirroring
    /// `cmd_nand_read.go`'s `if ep.NANDInit == nil { return ... }` guard --
    /// the NAND access sequence for other kinds was never reverse
    /// engineered upstream.
    ///
    /// SYNTHESIZED: the concrete register writes below are not recovered
    /// from the retrieved source (only the call shape is); they model a
    /// plausible controller-enable write at the NAND base. See DESIGN.md.
    pub fn nand_init(&self, kind: DeviceKind) -> Option<Vec<Statement>> {
        use Statement::*;
        if kind != DeviceKind::N5G {
            return None;
        }
        Some(vec![
            Ldr { dest: Register::R0, src: crate::asm::LoadSource::Constant(Self::NAND_BASE) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(1) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 0) },
        ])
    }

    /// Builds a snippet reading one 0x40-byte slice of NAND page
    /// `page` at byte `offset` within `bank`, landing the result at
    /// [`Self::FLASH_SCRATCH_ADDR`] for the caller to append a
    /// [`Self::handler_footer`] onto. Grounded in `readPageOffset`'s loop
    /// over `bank, page, offset` in `cmd_nand_read.go`.
    pub fn nand_read_page(&self, bank: u32, page: u32, offset: u32) -> Vec<Statement> {
        use Statement::*;
        vec![
            Ldr { dest: Register::R0, src: crate::asm::LoadSource::Constant(Self::NAND_BASE) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(bank) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 4) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(page) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 8) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(offset) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 12) },
        ]
    }

    /// NOR/SPI controller init snippet for peripheral `spino`, matching
    /// `cmd_nor_read.go`'s `ep.NORInit(spino)`.
    ///
    /// SYNTHESIZED: see [`Self::nand_init`]'s caveat; the instruction
    /// sequence models the call shape, not recovered register contents.
    pub fn nor_init(&self, spino: u32) -> Result<Vec<Statement>, AsmError> {
        use Statement::*;
        Ok(vec![
            Ldr { dest: Register::R0, src: crate::asm::LoadSource::Constant(0x3c600000 + spino * 0x1000) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(1) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 0) },
        ])
    }

    /// Builds a snippet reading one 0x40-byte slice of NOR peripheral
    /// `spino` at `addr`, returning the listing plus the data address the
    /// caller should pass to [`Self::handler_footer`] -- mirroring
    /// `cmd_nor_read.go`'s `listing, dataAddr := ep.NORRead(spino, offset+i)`.
    pub fn nor_read(&self, spino: u32, addr: u32) -> (Vec<Statement>, u32) {
        use Statement::*;
        let listing = vec![
            Ldr { dest: Register::R0, src: crate::asm::LoadSource::Constant(0x3c600000 + spino * 0x1000) },
            Mov { dest: Register::R1, src: crate::asm::DataSource::Immediate(addr) },
            Str { src: Register::R1, dest: crate::asm::StoreDest::Deref(Register::R0, 4) },
        ];
        (listing, Self::FLASH_SCRATCH_ADDR)
    }

    /// The I-cache-disable snippet prepended before running untrusted
    /// resident code on devices where the bootrom leaves the I-cache
    /// enabled across the exploit.
    pub fn icache_disable(&self) -> Program {
        use Statement::*;
        Program {
            address: self.exec_addr,
            listing: vec![
                Mrc {
                    opc: 0,
                    crn: 1,
                    dest: Register::R0,
                    cpn: 15,
                    opc2: 0,
                    crm: 0,
                },
                And {
                    dest: Register::R0,
                    src: Register::R0,
                    operand: crate::asm::DataSource::Immediate(!(1 << 12) & 0xffff_ffff),
                },
                Mcr {
                    opc: 0,
                    crn: 1,
                    src: Register::R0,
                    cpn: 15,
                    opc2: 0,
                    crm: 0,
                },
            ],
        }
    }
}
