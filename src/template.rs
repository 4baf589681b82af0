//! Code templates written into every slot of a trampoline table.
//!
//! The allocator never interprets stub bytes, it only asks a [`StubTemplate`] to fill a slot
//! sized buffer. Every stub finds its slot's configuration exactly one page below itself in the
//! executable window.

use crate::{Error, HOST_SLOT_SIZE};
use target_lexicon::Architecture;

pub trait StubTemplate: Send + Sync {
    /// Size in bytes of a slot. Both the stub and the configuration region of a slot have this
    /// size.
    fn slot_size(&self) -> usize;

    /// Code shared by all stubs of a page, placed at the very start of the code page. Slots
    /// begin after the preamble, rounded up to the slot size.
    fn preamble(&self) -> &[u8] {
        &[]
    }

    /// Writes the stub for the slot at `stub_offset` of the code page into `stub`.
    ///
    /// `stub` is exactly [`slot_size`](Self::slot_size) bytes long and zeroed. The configuration
    /// of the slot lives at `stub_offset - page_size` relative to the code page, i.e. `page_size`
    /// bytes below the first byte of the stub.
    fn emit(&self, stub: &mut [u8], stub_offset: usize, page_size: usize);
}

/// The built-in template for the host architecture.
///
/// A slot's configuration holds two words: the closure context followed by the address of the
/// dispatcher. The stub loads the context into a scratch register and tail-jumps to the
/// dispatcher, all argument registers are left untouched.
///
/// | architecture | context register | padding  |
/// |--------------|------------------|----------|
/// | x86_64       | `r10`            | `int3`   |
/// | aarch64      | `x16`            | `brk #0` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTemplate {
    arch: Arch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arch {
    X86_64,
    Aarch64,
}

impl HostTemplate {
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedArchitecture`] on hosts without a built-in template.
    pub fn new() -> crate::Result<Self> {
        Self::for_architecture(target_lexicon::HOST.architecture)
    }

    /// # Errors
    ///
    /// Returns [`Error::UnsupportedArchitecture`] if there is no template for `arch`.
    pub fn for_architecture(arch: Architecture) -> crate::Result<Self> {
        let arch = match arch {
            Architecture::X86_64 => Arch::X86_64,
            Architecture::Aarch64(_) => Arch::Aarch64,
            arch => return Err(Error::UnsupportedArchitecture { arch }),
        };
        Ok(Self { arch })
    }

    /// Encodes the configuration blob a host stub expects.
    pub fn config_blob(context: usize, dispatcher: usize) -> [u8; HOST_SLOT_SIZE] {
        let mut blob = [0; HOST_SLOT_SIZE];
        let word = core::mem::size_of::<usize>();
        blob[..word].copy_from_slice(&context.to_ne_bytes());
        blob[word..2 * word].copy_from_slice(&dispatcher.to_ne_bytes());
        blob
    }
}

impl StubTemplate for HostTemplate {
    fn slot_size(&self) -> usize {
        HOST_SLOT_SIZE
    }

    fn emit(&self, stub: &mut [u8], _stub_offset: usize, page_size: usize) {
        match self.arch {
            Arch::X86_64 => emit_x86_64(stub, page_size),
            Arch::Aarch64 => emit_aarch64(stub, page_size),
        }
    }
}

fn emit_x86_64(stub: &mut [u8], page_size: usize) {
    let page = i32::try_from(page_size).expect("page size exceeds rip-relative range");

    // mov r10, [rip + disp32], the context sits one page below the start of the stub
    stub[0..3].copy_from_slice(&[0x4c, 0x8b, 0x15]);
    stub[3..7].copy_from_slice(&(-page - 7).to_le_bytes());
    // jmp [rip + disp32], the dispatcher follows the context
    stub[7..9].copy_from_slice(&[0xff, 0x25]);
    stub[9..13].copy_from_slice(&(8 - page - 13).to_le_bytes());
    stub[13..].fill(0xcc);
}

fn emit_aarch64(stub: &mut [u8], page_size: usize) {
    const BR_X17: u32 = 0xd61f_0220;
    const BRK_0: u32 = 0xd420_0000;

    let page = i64::try_from(page_size).expect("page size too big for i64");
    assert!(page <= 1 << 20, "page size exceeds ldr literal range");

    let insns = [
        ldr_literal(16, -page),
        ldr_literal(17, 8 - page - 4),
        BR_X17,
        BRK_0,
    ];
    for (chunk, insn) in stub.chunks_exact_mut(4).zip(insns) {
        chunk.copy_from_slice(&insn.to_le_bytes());
    }
}

/// `ldr x<rt>, <pc + offset>`
fn ldr_literal(rt: u32, offset: i64) -> u32 {
    debug_assert_eq!(offset % 4, 0);
    let imm19 = u32::try_from((offset >> 2) & 0x7_ffff).expect("masked to 19 bits");
    0x5800_0000 | (imm19 << 5) | rt
}

#[cfg(test)]
pub(crate) mod testing {
    use super::StubTemplate;
    use alloc::vec::Vec;

    /// Fills every stub with its own code page offset followed by `0xab` padding.
    #[derive(Debug, Clone)]
    pub struct MarkerTemplate {
        pub slot_size: usize,
        pub preamble: Vec<u8>,
    }

    impl MarkerTemplate {
        pub fn new(slot_size: usize) -> Self {
            Self {
                slot_size,
                preamble: Vec::new(),
            }
        }
    }

    impl StubTemplate for MarkerTemplate {
        fn slot_size(&self) -> usize {
            self.slot_size
        }

        fn preamble(&self) -> &[u8] {
            &self.preamble
        }

        fn emit(&self, stub: &mut [u8], stub_offset: usize, _page_size: usize) {
            stub.fill(0xab);
            let offset = u32::try_from(stub_offset).unwrap();
            stub[..4].copy_from_slice(&offset.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use target_lexicon::Aarch64Architecture;

    fn emit(template: HostTemplate, page_size: usize) -> [u8; HOST_SLOT_SIZE] {
        let mut stub = [0; HOST_SLOT_SIZE];
        template.emit(&mut stub, 0, page_size);
        stub
    }

    #[test]
    fn x86_64_stub() {
        let template = HostTemplate::for_architecture(Architecture::X86_64).unwrap();
        let stub = emit(template, 0x1000);

        assert_eq!(
            stub,
            [
                0x4c, 0x8b, 0x15, 0xf9, 0xef, 0xff, 0xff, // mov r10, [rip - 0x1007]
                0xff, 0x25, 0xfb, 0xef, 0xff, 0xff, // jmp [rip - 0x1005]
                0xcc, 0xcc, 0xcc,
            ]
        );
    }

    #[test]
    fn aarch64_stub() {
        let template =
            HostTemplate::for_architecture(Architecture::Aarch64(Aarch64Architecture::Aarch64))
                .unwrap();
        let stub = emit(template, 0x4000);

        let words: Vec<u32> = stub
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        // ldr x16, #-0x4000
        assert_eq!(words[0], 0x5800_0000 | (((-0x4000_i64 >> 2) & 0x7_ffff) as u32) << 5 | 16);
        // ldr x17, #-0x3ffc
        assert_eq!(words[1], 0x5800_0000 | (((-0x3ffc_i64 >> 2) & 0x7_ffff) as u32) << 5 | 17);
        assert_eq!(words[2], 0xd61f_0220);
        assert_eq!(words[3], 0xd420_0000);
    }

    #[test]
    fn unsupported_architecture() {
        let err = HostTemplate::for_architecture(Architecture::Riscv32(
            target_lexicon::Riscv32Architecture::Riscv32,
        ))
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture { .. }));
    }

    #[test]
    fn config_blob_layout() {
        let blob = HostTemplate::config_blob(0x1122, 0x3344);
        let word = core::mem::size_of::<usize>();
        assert_eq!(usize::from_ne_bytes(blob[..word].try_into().unwrap()), 0x1122);
        assert_eq!(
            usize::from_ne_bytes(blob[word..2 * word].try_into().unwrap()),
            0x3344
        );
    }
}
