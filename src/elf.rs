//! Minimal ELF64 reader: enough of the image to place stoppoints and
//! translate between file-relative and run-time addresses.
//!
//! The file is memory-mapped read-only and parsed once at construction.
//! Section headers and the symbol table are indexed up front; queries after
//! that never touch the disk again.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use memmap2::Mmap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{FileAddr, VirtAddr};

const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const STT_TLS: u8 = 6;
const SHF_ALLOC: u64 = 0x2;

/// ELF64 file header.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    pub ident: [u8; 16],
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// ELF64 section header.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SectionHeader {
    pub name: u32,
    pub ty: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

/// ELF64 symbol table entry.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Symbol {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn symbol_type(&self) -> u8 {
        self.info & 0xf
    }
}

/// A memory-mapped, parsed ELF image.
pub struct Elf {
    path: PathBuf,
    map: Mmap,
    header: FileHeader,
    section_headers: Vec<SectionHeader>,
    symbol_table: Vec<Symbol>,
    section_map: HashMap<String, usize>,
    symbol_name_map: HashMap<String, Vec<usize>>,
    // symbol start file address -> symbol table index, for symbols with a
    // nonzero [st_value, st_value + st_size) extent
    symbol_addr_map: BTreeMap<u64, usize>,
    load_bias: VirtAddr,
}

impl Elf {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let malformed = |message: String| Error::Elf {
            path: path.clone(),
            message,
        };

        let file = File::open(&path).map_err(|err| malformed(format!("open failed: {err}")))?;

        // SAFETY: the mapping is private and read-only; the image is treated
        // as an immutable snapshot of the file at open time.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|err| malformed(format!("mmap failed: {err}")))?;

        if map.len() < mem::size_of::<FileHeader>() {
            return Err(malformed("file shorter than the ELF header".into()));
        }
        let header: FileHeader =
            bytemuck::pod_read_unaligned(&map[..mem::size_of::<FileHeader>()]);

        if header.ident[0..4] != ELF_MAGIC {
            return Err(malformed("bad magic".into()));
        }
        if header.ident[4] != ELFCLASS64 {
            return Err(malformed("not a 64-bit image".into()));
        }
        if header.ident[5] != ELFDATA2LSB {
            return Err(malformed("not little-endian".into()));
        }

        let section_headers = parse_section_headers(&map, &header).map_err(&malformed)?;
        let section_map = build_section_map(&map, &header, &section_headers).map_err(&malformed)?;
        let symbol_table =
            parse_symbol_table(&map, &section_headers, &section_map).map_err(&malformed)?;

        let mut elf = Self {
            path,
            map,
            header,
            section_headers,
            symbol_table,
            section_map,
            symbol_name_map: HashMap::new(),
            symbol_addr_map: BTreeMap::new(),
            load_bias: VirtAddr::new(0),
        };
        elf.build_symbol_maps();

        debug!(
            path = %elf.path.display(),
            sections = elf.section_headers.len(),
            symbols = elf.symbol_table.len(),
            "parsed ELF image"
        );

        Ok(elf)
    }

    fn build_symbol_maps(&mut self) {
        let strtab = self.strtab_base();
        for (index, symbol) in self.symbol_table.iter().enumerate() {
            let Some(name) = read_cstr(&self.map, strtab, symbol.name as usize) else {
                continue;
            };
            if !name.is_empty() {
                self.symbol_name_map
                    .entry(name.to_owned())
                    .or_default()
                    .push(index);
            }
            if symbol.value != 0 && symbol.size != 0 && symbol.symbol_type() != STT_TLS {
                // first insertion wins on duplicate start addresses
                self.symbol_addr_map.entry(symbol.value).or_insert(index);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Delta between the image's link-time addresses and where the loader
    /// actually placed it. Zero until [`Elf::notify_loaded`] is called.
    pub fn load_bias(&self) -> VirtAddr {
        self.load_bias
    }

    /// Record the loader's placement of this image.
    pub fn notify_loaded(&mut self, bias: VirtAddr) {
        self.load_bias = bias;
    }

    /// Section name for a section-header string table index.
    pub fn section_name(&self, index: usize) -> Result<&str> {
        let base = self
            .section_headers
            .get(self.header.shstrndx as usize)
            .map(|sh| sh.offset as usize)
            .ok_or(Error::StringIndex { index })?;
        read_cstr(&self.map, base, index).ok_or(Error::StringIndex { index })
    }

    /// Entry from the symbol string table (`.strtab`, else `.dynstr`).
    pub fn string(&self, index: usize) -> Result<&str> {
        read_cstr(&self.map, self.strtab_base(), index).ok_or(Error::StringIndex { index })
    }

    /// Name of a symbol table entry.
    pub fn symbol_name(&self, symbol: &Symbol) -> Result<&str> {
        self.string(symbol.name as usize)
    }

    fn strtab_base(&self) -> usize {
        self.section_header_by_name(".strtab")
            .or_else(|| self.section_header_by_name(".dynstr"))
            .map(|sh| sh.offset as usize)
            .unwrap_or(usize::MAX)
    }

    pub fn section_header_by_name(&self, name: &str) -> Option<&SectionHeader> {
        let index = *self.section_map.get(name)?;
        self.section_headers.get(index)
    }

    /// Raw bytes of the named section; empty when the section is absent or
    /// has no file extent.
    pub fn section_contents(&self, name: &str) -> &[u8] {
        let Some(section) = self.section_header_by_name(name) else {
            return &[];
        };
        let start = section.offset as usize;
        let end = start.saturating_add(section.size as usize);
        self.map.get(start..end).unwrap_or(&[])
    }

    pub fn section_start_file_addr(&self, name: &str) -> Option<FileAddr<'_>> {
        let section = self.section_header_by_name(name)?;
        Some(FileAddr::new(self, section.addr))
    }

    pub fn section_containing_file_addr(&self, addr: FileAddr<'_>) -> Option<&SectionHeader> {
        if !std::ptr::eq(addr.elf(), self) {
            return None;
        }
        self.section_containing(addr.addr())
    }

    pub fn section_containing_virt_addr(&self, addr: VirtAddr) -> Option<&SectionHeader> {
        let file_addr = addr.addr().checked_sub(self.load_bias.addr())?;
        self.section_containing(file_addr)
    }

    // only loaded sections occupy the address space
    fn section_containing(&self, file_addr: u64) -> Option<&SectionHeader> {
        self.section_headers.iter().find(|sh| {
            sh.flags & SHF_ALLOC != 0
                && sh.addr <= file_addr
                && file_addr < sh.addr.wrapping_add(sh.size)
        })
    }

    /// All symbol table entries with the given name.
    pub fn symbols_by_name(&self, name: &str) -> Vec<&Symbol> {
        self.symbol_name_map
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.symbol_table[i]).collect())
            .unwrap_or_default()
    }

    /// Symbol whose `st_value` is exactly `addr`.
    pub fn symbol_at_file_addr(&self, addr: FileAddr<'_>) -> Option<&Symbol> {
        if !std::ptr::eq(addr.elf(), self) {
            return None;
        }
        self.symbol_at(addr.addr())
    }

    pub fn symbol_at_virt_addr(&self, addr: VirtAddr) -> Option<&Symbol> {
        let file_addr = addr.addr().checked_sub(self.load_bias.addr())?;
        self.symbol_at(file_addr)
    }

    fn symbol_at(&self, file_addr: u64) -> Option<&Symbol> {
        let index = *self.symbol_addr_map.get(&file_addr)?;
        Some(&self.symbol_table[index])
    }

    /// Symbol whose `[st_value, st_value + st_size)` extent contains `addr`.
    pub fn symbol_containing_file_addr(&self, addr: FileAddr<'_>) -> Option<&Symbol> {
        if !std::ptr::eq(addr.elf(), self) {
            return None;
        }
        self.symbol_containing(addr.addr())
    }

    pub fn symbol_containing_virt_addr(&self, addr: VirtAddr) -> Option<&Symbol> {
        let file_addr = addr.addr().checked_sub(self.load_bias.addr())?;
        self.symbol_containing(file_addr)
    }

    fn symbol_containing(&self, file_addr: u64) -> Option<&Symbol> {
        let (_, &index) = self.symbol_addr_map.range(..=file_addr).next_back()?;
        let symbol = &self.symbol_table[index];
        (file_addr < symbol.value.wrapping_add(symbol.size)).then_some(symbol)
    }
}

fn parse_section_headers(
    map: &Mmap,
    header: &FileHeader,
) -> std::result::Result<Vec<SectionHeader>, String> {
    if header.shoff == 0 {
        return Ok(Vec::new());
    }

    let entsize = header.shentsize as usize;
    if entsize != mem::size_of::<SectionHeader>() {
        return Err(format!("unsupported section header entry size {entsize}"));
    }

    let shoff = header.shoff as usize;
    let mut count = header.shnum as usize;
    if count == 0 {
        // More than 0xff00 sections: the real count lives in the size field
        // of the first section header.
        let first = shoff
            .checked_add(entsize)
            .and_then(|end| map.get(shoff..end))
            .ok_or_else(|| "section header table out of bounds".to_string())?;
        let first: SectionHeader = bytemuck::pod_read_unaligned(first);
        count = first.size as usize;
    }

    let table = count
        .checked_mul(entsize)
        .and_then(|len| shoff.checked_add(len))
        .and_then(|end| map.get(shoff..end))
        .ok_or_else(|| "section header table out of bounds".to_string())?;

    Ok(table
        .chunks_exact(entsize)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

fn build_section_map(
    map: &Mmap,
    header: &FileHeader,
    section_headers: &[SectionHeader],
) -> std::result::Result<HashMap<String, usize>, String> {
    let Some(shstrtab) = section_headers.get(header.shstrndx as usize) else {
        return if section_headers.is_empty() {
            Ok(HashMap::new())
        } else {
            Err("section name string table index out of range".to_string())
        };
    };

    let base = shstrtab.offset as usize;
    let mut sections = HashMap::new();
    for (index, section) in section_headers.iter().enumerate() {
        let name = read_cstr(map, base, section.name as usize)
            .ok_or_else(|| "section name out of bounds".to_string())?;
        sections.insert(name.to_owned(), index);
    }
    Ok(sections)
}

fn parse_symbol_table(
    map: &Mmap,
    section_headers: &[SectionHeader],
    section_map: &HashMap<String, usize>,
) -> std::result::Result<Vec<Symbol>, String> {
    let symtab = section_map
        .get(".symtab")
        .or_else(|| section_map.get(".dynsym"))
        .and_then(|&i| section_headers.get(i));
    let Some(symtab) = symtab else {
        return Ok(Vec::new());
    };

    let entsize = symtab.entsize as usize;
    if entsize != mem::size_of::<Symbol>() {
        return Err(format!("unsupported symbol entry size {entsize}"));
    }

    let start = symtab.offset as usize;
    let table = map
        .get(start..start.saturating_add(symtab.size as usize))
        .ok_or_else(|| "symbol table out of bounds".to_string())?;

    Ok(table
        .chunks_exact(entsize)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

// NUL-terminated UTF-8 string at `base + index`, or `None` when out of
// bounds or not valid UTF-8.
fn read_cstr(map: &Mmap, base: usize, index: usize) -> Option<&str> {
    let start = base.checked_add(index)?;
    let tail = map.get(start..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..len]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::io::Write;

    struct Builder {
        data: Vec<u8>,
    }

    impl Builder {
        fn new() -> Self {
            Self { data: Vec::new() }
        }

        fn extend(&mut self, bytes: &[u8]) -> usize {
            let at = self.data.len();
            self.data.extend_from_slice(bytes);
            at
        }

        fn section(
            &mut self,
            name: u32,
            ty: u32,
            flags: u64,
            addr: u64,
            offset: u64,
            size: u64,
            entsize: u64,
        ) {
            let sh = SectionHeader {
                name,
                ty,
                flags,
                addr,
                offset,
                size,
                link: 0,
                info: 0,
                addralign: 0,
                entsize,
            };
            self.data.extend_from_slice(bytemuck::bytes_of(&sh));
        }
    }

    // Hand-assembled image: .text at file address 0x401000 with two function
    // symbols, plus the three string/symbol tables needed to index them.
    fn craft_elf(path: &std::path::Path) {
        let mut b = Builder::new();
        b.extend(&[0u8; mem::size_of::<FileHeader>()]);

        let text_off = b.extend(&[0x90u8; 0x40]) as u64;

        let symbols = [
            Symbol {
                name: 0,
                info: 0,
                other: 0,
                shndx: 0,
                value: 0,
                size: 0,
            },
            Symbol {
                name: 1, // "main"
                info: 0x12,
                other: 0,
                shndx: 1,
                value: 0x401000,
                size: 0x20,
            },
            Symbol {
                name: 6, // "helper"
                info: 0x12,
                other: 0,
                shndx: 1,
                value: 0x401020,
                size: 0x10,
            },
        ];
        let mut sym_bytes = Vec::new();
        for sym in &symbols {
            sym_bytes.extend_from_slice(bytemuck::bytes_of(sym));
        }
        let symtab_off = b.extend(&sym_bytes) as u64;
        let symtab_size = sym_bytes.len() as u64;

        let strtab_off = b.extend(b"\0main\0helper\0") as u64;
        let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0";
        let shstrtab_off = b.extend(shstrtab) as u64;

        let shoff = b.data.len() as u64;
        b.section(0, 0, 0, 0, 0, 0, 0);
        b.section(1, 1, 0x6, 0x401000, text_off, 0x40, 0); // .text
        b.section(7, 2, 0, 0, symtab_off, symtab_size, 24); // .symtab
        b.section(15, 3, 0, 0, strtab_off, 13, 0); // .strtab
        b.section(23, 3, 0, 0, shstrtab_off, shstrtab.len() as u64, 0); // .shstrtab

        let header = FileHeader {
            ident: *b"\x7fELF\x02\x01\x01\0\0\0\0\0\0\0\0\0",
            ty: 2,
            machine: 62,
            version: 1,
            entry: 0x401000,
            phoff: 0,
            shoff,
            flags: 0,
            ehsize: mem::size_of::<FileHeader>() as u16,
            phentsize: 0,
            phnum: 0,
            shentsize: mem::size_of::<SectionHeader>() as u16,
            shnum: 5,
            shstrndx: 4,
        };
        b.data[..mem::size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&header));

        let mut file = fs::File::create(path).unwrap();
        file.write_all(&b.data).unwrap();
    }

    fn crafted(tag: &str) -> (std::path::PathBuf, Elf) {
        let path = std::env::temp_dir().join(format!(
            "quarry-elf-test-{}-{tag}",
            std::process::id()
        ));
        craft_elf(&path);
        let elf = Elf::new(&path).unwrap();
        (path, elf)
    }

    #[test]
    fn parses_header_and_sections() {
        let (path, elf) = crafted("header");

        assert_eq!(elf.header().entry, 0x401000);
        assert_eq!(elf.header().machine, 62);

        let text = elf.section_header_by_name(".text").unwrap();
        assert_eq!(text.addr, 0x401000);
        assert_eq!(elf.section_contents(".text").len(), 0x40);
        assert!(elf.section_header_by_name(".data").is_none());
        assert!(elf.section_contents(".data").is_empty());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_malformed_images() {
        let path = std::env::temp_dir().join(format!(
            "quarry-elf-test-{}-bad",
            std::process::id()
        ));
        fs::write(&path, b"\x7fELF but not really").unwrap();

        assert!(matches!(Elf::new(&path), Err(Error::Elf { .. })));

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn symbol_queries() {
        let (path, elf) = crafted("symbols");

        let mains = elf.symbols_by_name("main");
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].value, 0x401000);
        assert_eq!(elf.symbol_name(mains[0]).unwrap(), "main");

        let at = elf
            .symbol_at_file_addr(FileAddr::new(&elf, 0x401020))
            .unwrap();
        assert_eq!(elf.symbol_name(at).unwrap(), "helper");

        let containing = elf
            .symbol_containing_file_addr(FileAddr::new(&elf, 0x401008))
            .unwrap();
        assert_eq!(elf.symbol_name(containing).unwrap(), "main");

        // one past the end of `helper`
        assert!(elf
            .symbol_containing_file_addr(FileAddr::new(&elf, 0x401030))
            .is_none());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn load_bias_round_trip() {
        let (path, mut elf) = crafted("bias");

        elf.notify_loaded(VirtAddr::new(0x10000));
        assert_eq!(elf.load_bias(), VirtAddr::new(0x10000));

        let virt = VirtAddr::new(0x411008);
        let file = virt.to_file_addr(&elf).unwrap();
        assert_eq!(file.addr(), 0x401008);
        assert_eq!(file.to_virt_addr(), virt);

        // below every section: no translation
        assert!(VirtAddr::new(0x1000).to_file_addr(&elf).is_none());

        let section = elf.section_containing_virt_addr(virt).unwrap();
        assert_eq!(section.addr, 0x401000);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn cross_image_addresses_are_rejected() {
        let (path_a, elf_a) = crafted("cross-a");
        let (path_b, elf_b) = crafted("cross-b");

        let a = FileAddr::new(&elf_a, 0x401000);
        let b = FileAddr::new(&elf_b, 0x401000);

        assert_ne!(a, b);
        assert!(a.partial_cmp(&b).is_none());
        assert_eq!(a, FileAddr::new(&elf_a, 0x401000));
        assert!(a < FileAddr::new(&elf_a, 0x401001));

        // queries against a foreign image yield absent
        assert!(elf_a.section_containing_file_addr(b).is_none());
        assert!(elf_a.symbol_containing_file_addr(b).is_none());

        fs::remove_file(path_a).unwrap();
        fs::remove_file(path_b).unwrap();
    }
}
