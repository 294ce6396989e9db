//! Allocation-free parsing and validation of SLF buffers.
//!
//! `View::open` checks the header and every referenced table up front so
//! that the table readers, the linker, and any downstream dump tooling can
//! index the buffer without further bounds checks. The buffer is borrowed
//! immutably; a `View` is `Copy` and may be shared freely.

use crate::error::{Error, Result};
use crate::format::{
    read_u32, SymbolSize, HDR_EXPORTS, HDR_IMPORTS, HDR_RELOCS, HDR_SECTION_SIZE,
    HDR_SECTION_START, HDR_STRINGS, HDR_SYMBOL_SIZE, HEADER_SIZE, MAGIC,
};
use crate::tables::{RelocationTable, StringTable, SymbolTable};

/// Controls how much validation `View::open` performs.
#[derive(Debug, Clone, Copy)]
pub struct ViewOptions {
    /// Additionally require every symbol and relocation offset to stay
    /// inside the data section. The linker patches those sites without
    /// re-checking, so leave this on unless the caller only inspects
    /// tables.
    pub validate_symbols: bool,
}

impl Default for ViewOptions {
    fn default() -> ViewOptions {
        ViewOptions { validate_symbols: true }
    }
}

/// Immutable, validated view over an SLF buffer.
///
/// After a successful `open`, every accessor hands out a table that needs
/// no further bounds checking by callers.
#[derive(Debug, Clone, Copy)]
pub struct View<'a> {
    buffer: &'a [u8],
    exports: u32,
    imports: u32,
    relocs: u32,
    strings: u32,
    section_start: u32,
    section_size: u32,
    symbol_size: SymbolSize,
}

impl<'a> View<'a> {
    /// Parse and validate `buffer`.
    ///
    /// A buffer shorter than the magic or with the wrong magic is
    /// `InvalidHeader`; every later failure is `InvalidData`.
    pub fn open(buffer: &'a [u8], options: ViewOptions) -> Result<View<'a>> {
        if buffer.len() < 4 || buffer[0..4] != MAGIC {
            return Err(Error::InvalidHeader);
        }
        if buffer.len() < HEADER_SIZE {
            return Err(Error::InvalidData("truncated header"));
        }

        let exports = read_u32(buffer, HDR_EXPORTS);
        let imports = read_u32(buffer, HDR_IMPORTS);
        let relocs = read_u32(buffer, HDR_RELOCS);
        let strings = read_u32(buffer, HDR_STRINGS);
        let section_start = read_u32(buffer, HDR_SECTION_START);
        let section_size = read_u32(buffer, HDR_SECTION_SIZE);
        let symbol_size = SymbolSize::from_byte(buffer[HDR_SYMBOL_SIZE])
            .ok_or(Error::InvalidData("symbol size must be 1, 2, 4 or 8"))?;

        let len = buffer.len() as u64;
        // Every present table must at least fit its count header.
        for table in [exports, imports, relocs, strings] {
            if table != 0 && table as u64 + 4 > len {
                return Err(Error::InvalidData("table offset out of bounds"));
            }
        }
        if section_start as u64 + section_size as u64 > len {
            return Err(Error::InvalidData("section extends past end of file"));
        }

        let view = View {
            buffer,
            exports,
            imports,
            relocs,
            strings,
            section_start,
            section_size,
            symbol_size,
        };

        let strtab_total = if strings != 0 {
            Some(view.validate_string_table()?)
        } else {
            None
        };
        if exports != 0 {
            view.validate_symbol_table(exports, strtab_total, options.validate_symbols)?;
        }
        if imports != 0 {
            view.validate_symbol_table(imports, strtab_total, options.validate_symbols)?;
        }
        if relocs != 0 {
            view.validate_relocation_table(options.validate_symbols)?;
        }

        Ok(view)
    }

    /// The import table, if the header references one.
    pub fn imports(&self) -> Option<SymbolTable<'a>> {
        if self.imports == 0 {
            return None;
        }
        Some(SymbolTable::new(&self.buffer[self.imports as usize..]))
    }

    /// The export table, if the header references one.
    pub fn exports(&self) -> Option<SymbolTable<'a>> {
        if self.exports == 0 {
            return None;
        }
        Some(SymbolTable::new(&self.buffer[self.exports as usize..]))
    }

    /// The relocation table, if the header references one.
    pub fn relocations(&self) -> Option<RelocationTable<'a>> {
        if self.relocs == 0 {
            return None;
        }
        Some(RelocationTable::new(&self.buffer[self.relocs as usize..]))
    }

    /// The string table, if the header references one.
    pub fn strings(&self) -> Option<StringTable<'a>> {
        if self.strings == 0 {
            return None;
        }
        let base = self.strings as usize;
        let total = read_u32(self.buffer, base) as usize;
        Some(StringTable::new(&self.buffer[base..base + total]))
    }

    /// The data section.
    pub fn data(&self) -> &'a [u8] {
        let start = self.section_start as usize;
        &self.buffer[start..start + self.section_size as usize]
    }

    pub fn symbol_size(&self) -> SymbolSize {
        self.symbol_size
    }

    /// Walk the string table: entries must tile `[4, total)` exactly, each
    /// zero-terminated inside the declared total. Returns the total.
    fn validate_string_table(&self) -> Result<u32> {
        let base = self.strings as u64;
        let total = read_u32(self.buffer, self.strings as usize) as u64;
        if total < 4 || base + total > self.buffer.len() as u64 {
            return Err(Error::InvalidData("string table extends past end of file"));
        }
        let mut offset = 4u64;
        while offset != total {
            if offset + 4 > total {
                return Err(Error::InvalidData("string table entries overrun the table"));
            }
            let len = read_u32(self.buffer, (base + offset) as usize) as u64;
            if offset + len + 5 > total {
                return Err(Error::InvalidData("string entry overruns the table"));
            }
            if self.buffer[(base + offset + 4 + len) as usize] != 0 {
                return Err(Error::InvalidData("string entry is not zero-terminated"));
            }
            offset += len + 5;
        }
        Ok(total as u32)
    }

    /// Validate one symbol table: the entries must fit the buffer, every
    /// name must be a readable string-table entry, and (when requested)
    /// every data offset must leave room for a symbol-wide word in the
    /// section.
    fn validate_symbol_table(
        &self,
        table: u32,
        strtab_total: Option<u32>,
        check_offsets: bool,
    ) -> Result<()> {
        let count = read_u32(self.buffer, table as usize) as u64;
        if table as u64 + 4 + count * 8 > self.buffer.len() as u64 {
            return Err(Error::InvalidData("symbol table extends past end of file"));
        }
        for i in 0..count as usize {
            let entry = table as usize + 4 + i * 8;
            let name_offset = read_u32(self.buffer, entry) as u64;
            let data_offset = read_u32(self.buffer, entry + 4) as u64;

            let total = strtab_total
                .ok_or(Error::InvalidData("symbol refers to a missing string table"))?
                as u64;
            // The name needs at least its length header and terminator,
            // and its declared length must stay inside the table so that
            // later reads are unchecked.
            if name_offset + 5 > total {
                return Err(Error::InvalidData("symbol name outside the string table"));
            }
            let name_len = read_u32(self.buffer, (self.strings as u64 + name_offset) as usize) as u64;
            if name_offset + name_len + 5 > total {
                return Err(Error::InvalidData("symbol name overruns the string table"));
            }

            if check_offsets
                && data_offset + self.symbol_size.bytes() as u64 > self.section_size as u64
            {
                return Err(Error::InvalidData("symbol offset outside the data section"));
            }
        }
        Ok(())
    }

    fn validate_relocation_table(&self, check_offsets: bool) -> Result<()> {
        let table = self.relocs;
        let count = read_u32(self.buffer, table as usize) as u64;
        if table as u64 + 4 + count * 4 > self.buffer.len() as u64 {
            return Err(Error::InvalidData("relocation table extends past end of file"));
        }
        if check_offsets {
            for i in 0..count as usize {
                let offset = read_u32(self.buffer, table as usize + 4 + i * 4) as u64;
                if offset + self.symbol_size.bytes() as u64 > self.section_size as u64 {
                    return Err(Error::InvalidData("relocation outside the data section"));
                }
            }
        }
        Ok(())
    }
}
