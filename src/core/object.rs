//! Loadable objects and their minimal ELF32 container
//!
//! A binary image carries exactly three things: code, an entry point and a
//! load address. On the way out they are wrapped in an executable ELF32
//! file with a single `.text` section and one `PT_LOAD` segment; on the way
//! in the same three values are read back from any ELF32 object.
//!
//! ```text
//! 0x00  ELF header        (52 bytes)
//! 0x34  program header    (32 bytes, PT_LOAD R+X)
//! 0x54  .text contents
//!       .shstrtab         ("\0.text\0.shstrtab\0")
//!       section headers   (null, .text, .shstrtab; 40 bytes each)
//! ```

use crate::error::{FlashError, Result};

/// SPARC, the architecture of the module's application processor
pub const EM_SPARC: u16 = 2;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_R: u32 = 4;

const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_NOBITS: u32 = 8;
const SHF_ALLOC: u32 = 2;
const SHF_EXECINSTR: u32 = 4;

const SHSTRTAB: &[u8] = b"\0.text\0.shstrtab\0";
const TEXT_NAME_OFFSET: u32 = 1;
const SHSTRTAB_NAME_OFFSET: u32 = 7;

/// Default section holding the code
pub const TEXT_SECTION: &str = ".text";

/// Code plus the metadata needed to run it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadableObject {
    pub code: Vec<u8>,
    pub entry_point: u32,
    pub load_address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn u16(self, bytes: &[u8], at: usize) -> Result<u16> {
        let raw: [u8; 2] = field(bytes, at)?;
        Ok(match self {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        })
    }

    fn u32(self, bytes: &[u8], at: usize) -> Result<u32> {
        let raw: [u8; 4] = field(bytes, at)?;
        Ok(match self {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }
}

fn field<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N]> {
    bytes
        .get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| invalid(format!("field at offset {at:#x} past end of file")))
}

fn invalid(msg: impl Into<String>) -> FlashError {
    FlashError::InvalidObject(msg.into())
}

fn range(bytes: &[u8], offset: u32, size: u32) -> Result<&[u8]> {
    let start = offset as usize;
    start
        .checked_add(size as usize)
        .and_then(|end| bytes.get(start..end))
        .ok_or_else(|| invalid(format!("range {offset:#x}+{size:#x} past end of file")))
}

struct Section {
    name: u32,
    kind: u32,
    addr: u32,
    offset: u32,
    size: u32,
}

impl LoadableObject {
    pub fn new(code: Vec<u8>, entry_point: u32, load_address: u32) -> Self {
        LoadableObject {
            code,
            entry_point,
            load_address,
        }
    }

    /// Read code, entry point and load address from an ELF32 object
    ///
    /// The code comes from the section called `section`; its `sh_addr` is the
    /// load address.
    pub fn from_elf(bytes: &[u8], section: &str) -> Result<Self> {
        if bytes.len() < EHDR_SIZE || bytes[..4] != ELF_MAGIC {
            return Err(invalid("not an ELF file"));
        }
        if bytes[4] != ELFCLASS32 {
            return Err(invalid(format!("unsupported ELF class {}", bytes[4])));
        }
        let order = match bytes[5] {
            ELFDATA2MSB => ByteOrder::Big,
            ELFDATA2LSB => ByteOrder::Little,
            other => return Err(invalid(format!("unknown ELF data encoding {other}"))),
        };

        let entry_point = order.u32(bytes, 24)?;
        let shoff = order.u32(bytes, 32)? as usize;
        let shentsize = order.u16(bytes, 46)? as usize;
        let shnum = order.u16(bytes, 48)? as usize;
        let shstrndx = order.u16(bytes, 50)? as usize;

        if shentsize < SHDR_SIZE {
            return Err(invalid(format!("section header size {shentsize} too small")));
        }

        let read_section = |i: usize| -> Result<Section> {
            let at = shoff + i * shentsize;
            Ok(Section {
                name: order.u32(bytes, at)?,
                kind: order.u32(bytes, at + 4)?,
                addr: order.u32(bytes, at + 12)?,
                offset: order.u32(bytes, at + 16)?,
                size: order.u32(bytes, at + 20)?,
            })
        };

        if shstrndx >= shnum {
            return Err(invalid("missing section name table"));
        }
        let names = read_section(shstrndx)?;
        let names = range(bytes, names.offset, names.size)?;

        for i in 0..shnum {
            let candidate = read_section(i)?;
            let name = names
                .get(candidate.name as usize..)
                .and_then(|rest| rest.split(|&b| b == 0).next())
                .unwrap_or_default();

            if name != section.as_bytes() {
                continue;
            }
            if candidate.kind == SHT_NOBITS {
                return Err(invalid(format!("section {section} has no file contents")));
            }

            return Ok(LoadableObject {
                code: range(bytes, candidate.offset, candidate.size)?.to_vec(),
                entry_point,
                load_address: candidate.addr,
            });
        }

        Err(invalid(format!("section {section} not found")))
    }

    /// Build an executable big-endian ELF32 file for `machine`
    pub fn to_elf(&self, machine: u16) -> Result<Vec<u8>> {
        let code_len =
            u32::try_from(self.code.len()).map_err(|_| FlashError::PayloadTooLarge(self.code.len()))?;

        let text_offset = EHDR_SIZE + PHDR_SIZE;
        let shstrtab_offset = text_offset + self.code.len();
        let shoff = (shstrtab_offset + SHSTRTAB.len() + 3) & !3;
        let total = shoff + 3 * SHDR_SIZE;
        let shoff_u32 = u32::try_from(shoff).map_err(|_| FlashError::PayloadTooLarge(total))?;

        let mut out = Vec::with_capacity(total);
        let put16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_be_bytes());
        let put32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_be_bytes());

        // ELF header
        out.extend_from_slice(&ELF_MAGIC);
        out.extend_from_slice(&[ELFCLASS32, ELFDATA2MSB, EV_CURRENT]);
        out.resize(16, 0);
        put16(&mut out, ET_EXEC);
        put16(&mut out, machine);
        put32(&mut out, u32::from(EV_CURRENT));
        put32(&mut out, self.entry_point);
        put32(&mut out, EHDR_SIZE as u32); // e_phoff
        put32(&mut out, shoff_u32);
        put32(&mut out, 0); // e_flags
        put16(&mut out, EHDR_SIZE as u16);
        put16(&mut out, PHDR_SIZE as u16);
        put16(&mut out, 1);
        put16(&mut out, SHDR_SIZE as u16);
        put16(&mut out, 3);
        put16(&mut out, 2); // e_shstrndx

        // PT_LOAD covering .text
        put32(&mut out, PT_LOAD);
        put32(&mut out, text_offset as u32);
        put32(&mut out, self.load_address);
        put32(&mut out, self.load_address);
        put32(&mut out, code_len);
        put32(&mut out, code_len);
        put32(&mut out, PF_R | PF_X);
        put32(&mut out, 4);

        out.extend_from_slice(&self.code);
        out.extend_from_slice(SHSTRTAB);
        out.resize(shoff, 0);

        let shdr = |out: &mut Vec<u8>, fields: [u32; 10]| {
            for v in fields {
                put32(out, v);
            }
        };
        shdr(&mut out, [0; 10]);
        shdr(
            &mut out,
            [
                TEXT_NAME_OFFSET,
                SHT_PROGBITS,
                SHF_ALLOC | SHF_EXECINSTR,
                self.load_address,
                text_offset as u32,
                code_len,
                0,
                0,
                4,
                0,
            ],
        );
        shdr(
            &mut out,
            [
                SHSTRTAB_NAME_OFFSET,
                SHT_STRTAB,
                0,
                0,
                shstrtab_offset as u32,
                SHSTRTAB.len() as u32,
                0,
                0,
                1,
                0,
            ],
        );

        debug_assert_eq!(out.len(), total);
        Ok(out)
    }
}
