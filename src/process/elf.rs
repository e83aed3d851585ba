//! ELF64 parsing and lazy loading of `PT_LOAD` segments into a process's
//! supplemental page table. Unlike an eager loader, nothing is copied here:
//! each 4 KiB chunk of a segment becomes a `Backing::File` page that
//! populates itself from the executable the first time it's touched.

use crate::fs::VFS;
use crate::vm::{Page, SupplementalPageTable};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use x86_64::{PhysAddr, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 0x2;
const PGSIZE: u64 = 4096;

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 64 {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 {
            return Err(ExecError::UnsupportedArch);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }

        Ok(Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 56 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "file not found"),
            ExecError::InvalidFormat => write!(f, "invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "unsupported ELF type (need ET_EXEC)"),
            ExecError::ReadError => write!(f, "file read error"),
        }
    }
}

pub struct LoadedElf {
    pub entry: u64,
}

/// Read the ELF header and program header table of `path`, then insert one
/// lazily-loaded page per 4 KiB chunk of every `PT_LOAD` segment into `spt`.
/// Segments are assumed page-aligned in `p_vaddr`, true of every binary this
/// kernel's toolchain produces.
pub fn load(path: &str, spt: &mut SupplementalPageTable, p4: PhysAddr) -> Result<LoadedElf, ExecError> {
    let header_buf = read_at(path, 0, 64)?;
    let ehdr = Elf64Ehdr::parse(&header_buf)?;

    let phtable_len = ehdr.e_phnum as usize * ehdr.e_phentsize as usize;
    let phtable = read_at(path, ehdr.e_phoff as usize, phtable_len)?;

    let file_size = file_size(path)?;

    for i in 0..ehdr.e_phnum as usize {
        let off = i * ehdr.e_phentsize as usize;
        let phdr = Elf64Phdr::parse(&phtable[off..])?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        insert_segment_pages(spt, &phdr, path, file_size, p4);
    }

    Ok(LoadedElf { entry: ehdr.e_entry })
}

fn insert_segment_pages(
    spt: &mut SupplementalPageTable,
    phdr: &Elf64Phdr,
    path: &str,
    file_size: usize,
    p4: PhysAddr,
) {
    let writable = phdr.p_flags & PF_W != 0;
    let base = phdr.p_vaddr & !(PGSIZE - 1);
    let segment_end = phdr.p_vaddr + phdr.p_memsz;

    let mut va = base;
    while va < segment_end {
        let page_file_offset_within_segment = va.saturating_sub(phdr.p_vaddr);
        let file_off = phdr.p_offset + page_file_offset_within_segment;

        let page_data_len = core::cmp::min(PGSIZE, segment_end - va) as usize;
        let read_bytes = if page_file_offset_within_segment < phdr.p_filesz {
            let remaining_file_bytes = (phdr.p_filesz - page_file_offset_within_segment) as usize;
            core::cmp::min(page_data_len, remaining_file_bytes)
        } else {
            0
        };
        let zero_bytes = page_data_len - read_bytes;

        if (file_off as usize) < file_size {
            let page = Page::new_file(
                VirtAddr::new(va),
                writable,
                p4,
                String::from(path),
                file_off as usize,
                read_bytes,
                zero_bytes,
                false,
                false,
            );
            spt.insert(page);
        }

        va += PGSIZE;
    }
}

fn file_size(path: &str) -> Result<usize, ExecError> {
    let vfs = VFS.lock();
    let inode = vfs.lookup(path).map_err(|_| ExecError::FileNotFound)?;
    Ok(inode.size)
}

fn read_at(path: &str, offset: usize, len: usize) -> Result<Vec<u8>, ExecError> {
    let vfs = VFS.lock();
    let mut buf = vec![0u8; len];
    let n = vfs.read_file(path, offset, &mut buf).map_err(|_| ExecError::ReadError)?;
    buf.truncate(n);
    if buf.len() < len {
        return Err(ExecError::InvalidFormat);
    }
    Ok(buf)
}

pub fn extract_filename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehdr_bytes(e_entry: u64, e_phoff: u64, e_phnum: u16) -> Vec<u8> {
        let mut b = vec![0u8; 64];
        b[0..4].copy_from_slice(&ELF_MAGIC);
        b[4] = ELFCLASS64;
        b[5] = ELFDATA2LSB;
        b[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        b[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        b[24..32].copy_from_slice(&e_entry.to_le_bytes());
        b[32..40].copy_from_slice(&e_phoff.to_le_bytes());
        b[54..56].copy_from_slice(&56u16.to_le_bytes());
        b[56..58].copy_from_slice(&e_phnum.to_le_bytes());
        b
    }

    #[test]
    fn rejects_bad_magic() {
        let mut b = ehdr_bytes(0x1000, 64, 0);
        b[0] = 0;
        assert!(matches!(Elf64Ehdr::parse(&b), Err(ExecError::InvalidFormat)));
    }

    #[test]
    fn rejects_non_exec_type() {
        let mut b = ehdr_bytes(0x1000, 64, 0);
        b[16..18].copy_from_slice(&3u16.to_le_bytes());
        assert!(matches!(Elf64Ehdr::parse(&b), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn parses_valid_header() {
        let b = ehdr_bytes(0x401000, 64, 2);
        let ehdr = Elf64Ehdr::parse(&b).unwrap();
        assert_eq!(ehdr.e_entry, 0x401000);
        assert_eq!(ehdr.e_phnum, 2);
    }

    #[test]
    fn extract_filename_strips_directories() {
        assert_eq!(extract_filename("/bin/echo"), "echo");
        assert_eq!(extract_filename("echo"), "echo");
    }
}
