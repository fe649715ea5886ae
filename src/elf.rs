// This module implements the executable writer. It lays out a minimal static ELF64
// executable using object's low-level ELF writer: the file header (ET_EXEC, EM_X86_64, no
// section headers), two PT_LOAD program headers, the raw .text bytes immediately after the
// headers, zero padding up to the next 4 KiB boundary and the raw .data bytes. The first
// segment is R+X, starts at file offset 0 and maps the headers together with .text at
// TEXT_VADDR, so the first code byte lives at CODE_VADDR. The second segment is R+W and maps
// .data at DATA_VADDR. There are no relocations: every absolute address baked into the code
// was computed against these same constants.

//! ELF64 executable writer.

use crate::core::{CodeBuffer, CompileError, CompileResult};
use object::elf;
use object::write::elf::{FileHeader, ProgramHeader, Writer};
use object::Endianness;
use std::path::Path;

/// Load address of the first segment (file offset 0).
pub const TEXT_VADDR: u64 = 0x40_0000;
/// Load address of `.data`.
pub const DATA_VADDR: u64 = 0x60_0000;
pub const PAGE_SIZE: u64 = 0x1000;

const ELF64_EHDR_SIZE: u64 = 64;
const ELF64_PHDR_SIZE: u64 = 56;
const PROGRAM_HEADER_COUNT: u32 = 2;

/// Size of the file header plus both program headers.
pub const HEADERS_SIZE: u64 = ELF64_EHDR_SIZE + PROGRAM_HEADER_COUNT as u64 * ELF64_PHDR_SIZE;
/// Virtual address of `.text` offset 0.
pub const CODE_VADDR: u64 = TEXT_VADDR + HEADERS_SIZE;
/// Largest `.text` that still ends below `DATA_VADDR`.
pub const MAX_TEXT_SIZE: usize = (DATA_VADDR - CODE_VADDR) as usize;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// File offset of `.data` for a given `.text` length.
pub fn data_file_offset(text_len: usize) -> u64 {
    align_up(HEADERS_SIZE + text_len as u64, PAGE_SIZE)
}

/// A finished executable: both sections plus the entry address.
#[derive(Debug, Clone)]
pub struct ElfImage {
    text: CodeBuffer,
    data: CodeBuffer,
    entry: u64,
}

impl ElfImage {
    /// Build an image whose entry point is `.text` offset `entry_offset`.
    pub fn new(text: CodeBuffer, data: CodeBuffer, entry_offset: usize) -> CompileResult<Self> {
        if text.len() > MAX_TEXT_SIZE {
            return Err(CompileError::SegmentOverlap {
                text_size: text.len(),
                data_vaddr: DATA_VADDR,
            });
        }
        Ok(Self {
            entry: CODE_VADDR + entry_offset as u64,
            text,
            data,
        })
    }

    pub fn text(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Entry virtual address written to `e_entry`.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Serialize the image.
    pub fn to_bytes(&self) -> CompileResult<Vec<u8>> {
        let text = self.text.as_bytes();
        let data = self.data.as_bytes();

        let mut out = Vec::new();
        let mut writer = Writer::new(Endianness::Little, true, &mut out);

        writer.reserve_file_header();
        writer.reserve_program_headers(PROGRAM_HEADER_COUNT);
        let text_offset = writer.reserve(text.len(), 1);
        debug_assert!(text.is_empty() || text_offset as u64 == HEADERS_SIZE);
        // Explicit, since an empty reservation is not aligned.
        let data_offset = data_file_offset(text.len()) as usize;
        writer.reserve_until(data_offset);
        writer.reserve(data.len(), 1);

        writer.write_file_header(&FileHeader {
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            e_type: elf::ET_EXEC,
            e_machine: elf::EM_X86_64,
            e_entry: self.entry,
            e_flags: 0,
        })?;

        let text_segment_size = HEADERS_SIZE + text.len() as u64;
        writer.write_align_program_headers();
        writer.write_program_header(&ProgramHeader {
            p_type: elf::PT_LOAD,
            p_flags: elf::PF_R | elf::PF_X,
            p_offset: 0,
            p_vaddr: TEXT_VADDR,
            p_paddr: TEXT_VADDR,
            p_filesz: text_segment_size,
            p_memsz: text_segment_size,
            p_align: PAGE_SIZE,
        });
        writer.write_program_header(&ProgramHeader {
            p_type: elf::PT_LOAD,
            p_flags: elf::PF_R | elf::PF_W,
            p_offset: data_offset as u64,
            p_vaddr: DATA_VADDR,
            p_paddr: DATA_VADDR,
            p_filesz: data.len() as u64,
            p_memsz: data.len() as u64,
            p_align: PAGE_SIZE,
        });

        writer.write(text);
        writer.pad_until(data_offset);
        writer.write(data);

        log::info!(
            "ELF layout: .text {} bytes at {:#x}, .data {} bytes at {:#x} (file offset {:#x}), entry {:#x}",
            text.len(),
            CODE_VADDR,
            data.len(),
            DATA_VADDR,
            data_offset,
            self.entry
        );

        Ok(out)
    }

    /// Write the executable to `path`, marking it executable on Unix.
    pub fn write_to(&self, path: &Path) -> CompileResult<()> {
        let bytes = self.to_bytes()?;
        let io_error = |source| CompileError::Io {
            path: path.to_path_buf(),
            source,
        };

        std::fs::write(path, &bytes).map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
                .map_err(io_error)?;
        }

        Ok(())
    }
}
