//! Appending writer that produces a well-formed SLF buffer.
//!
//! The builder reserves the header up front, grows the data section with
//! `append`, and records exports, imports, and relocations on the side.
//! `finalize` emits the string and symbol tables after the data and then
//! seeks back to patch the header, so the stream must be seekable. Names
//! are interned: each distinct string is stored once and every symbol
//! referencing it shares the same table offset.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};

use crate::error::Result;
use crate::format::{align_up, SymbolSize, MAGIC, SECTION_START};

/// Index of an interned string in the builder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StringId(usize);

/// Interning arena. Each distinct string is stored once, in first-use
/// order; its table offset is assigned when the string table is emitted.
#[derive(Default)]
struct StringArena {
    ids: HashMap<Vec<u8>, StringId>,
    /// (bytes, table offset back-filled during finalize)
    entries: Vec<(Vec<u8>, u32)>,
}

impl StringArena {
    fn intern(&mut self, name: &str) -> StringId {
        if let Some(&id) = self.ids.get(name.as_bytes()) {
            return id;
        }
        let id = StringId(self.entries.len());
        self.entries.push((name.as_bytes().to_vec(), 0));
        self.ids.insert(name.as_bytes().to_vec(), id);
        id
    }
}

/// Name -> section offset mapping with last-write-wins semantics and
/// stable first-insertion emission order.
#[derive(Default)]
struct SymbolMap {
    offsets: HashMap<StringId, u32>,
    order: Vec<StringId>,
}

impl SymbolMap {
    fn insert(&mut self, name: StringId, offset: u32) {
        if self.offsets.insert(name, offset).is_none() {
            self.order.push(name);
        }
    }
}

/// Stateful SLF writer.
///
/// Dropping a builder without calling `finalize` leaves the placeholder
/// header in the stream; the file is not valid until `finalize` returns.
pub struct Builder<'a, W: Write + Seek> {
    stream: &'a mut W,
    symbol_size: SymbolSize,
    strings: StringArena,
    exports: SymbolMap,
    imports: SymbolMap,
    relocs: Vec<u32>,
    /// Section-relative write cursor, advanced by `append`.
    cursor: u32,
}

impl<'a, W: Write + Seek> Builder<'a, W> {
    /// Write the stub header and position the stream at the start of the
    /// data section. The four table offsets and the section size are
    /// `0xAA` placeholders until `finalize` patches them.
    pub fn new(symbol_size: SymbolSize, stream: &'a mut W) -> Result<Builder<'a, W>> {
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&MAGIC)?;
        stream.write_all(&[0xAA; 16])?;
        stream.write_all(&SECTION_START.to_le_bytes())?;
        stream.write_all(&[0xAA; 4])?;
        stream.write_all(&[symbol_size.bytes() as u8, 0, 0, 0])?;
        Ok(Builder {
            stream,
            symbol_size,
            strings: StringArena::default(),
            exports: SymbolMap::default(),
            imports: SymbolMap::default(),
            relocs: Vec::new(),
            cursor: 0,
        })
    }

    /// Current section-relative write position.
    pub fn offset(&self) -> u32 {
        self.cursor
    }

    pub fn symbol_size(&self) -> SymbolSize {
        self.symbol_size
    }

    /// Append raw bytes to the data section.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.cursor += bytes.len() as u32;
        Ok(())
    }

    /// Record an exported symbol at `offset`, or at the current cursor.
    /// Re-exporting a name replaces the earlier offset.
    pub fn add_export(&mut self, name: &str, offset: Option<u32>) {
        let offset = offset.unwrap_or(self.cursor);
        let id = self.strings.intern(name);
        self.exports.insert(id, offset);
    }

    /// Record an imported symbol whose site sits at `offset`, or at the
    /// current cursor. Re-importing a name replaces the earlier offset.
    pub fn add_import(&mut self, name: &str, offset: Option<u32>) {
        let offset = offset.unwrap_or(self.cursor);
        let id = self.strings.intern(name);
        self.imports.insert(id, offset);
    }

    /// Record an internal relocation site at `offset`, or at the current
    /// cursor. Duplicates are kept; each one is patched independently at
    /// link time.
    pub fn add_relocation(&mut self, offset: Option<u32>) {
        self.relocs.push(offset.unwrap_or(self.cursor));
    }

    /// Commit the file: emit the string, export, import, and relocation
    /// tables after the data section (each 4-aligned), then patch the
    /// header words reserved by `new` and reseek to the end.
    pub fn finalize(self) -> Result<()> {
        let Builder { stream, mut strings, exports, imports, relocs, .. } = self;
        let data_end = stream.stream_position()?;

        // String table. The total is known up front: four bytes for the
        // length field plus `4 + len + 1` per entry. Offsets are assigned
        // as entries are written so the symbol tables below can use them.
        let string_table_pos = pad_to_word(stream)?;
        let total: u32 = 4 + strings
            .entries
            .iter()
            .map(|(bytes, _)| bytes.len() as u32 + 5)
            .sum::<u32>();
        stream.write_all(&total.to_le_bytes())?;
        let mut offset = 4u32;
        for (bytes, table_offset) in &mut strings.entries {
            *table_offset = offset;
            stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
            stream.write_all(bytes)?;
            stream.write_all(&[0])?;
            offset += bytes.len() as u32 + 5;
        }

        let export_table_pos = pad_to_word(stream)?;
        write_symbol_table(stream, &exports, &strings)?;
        let import_table_pos = pad_to_word(stream)?;
        write_symbol_table(stream, &imports, &strings)?;

        let relocs_table_pos = pad_to_word(stream)?;
        stream.write_all(&(relocs.len() as u32).to_le_bytes())?;
        for site in &relocs {
            stream.write_all(&site.to_le_bytes())?;
        }

        let end = stream.stream_position()?;

        tracing::debug!(
            data = data_end - SECTION_START as u64,
            strings = strings.entries.len(),
            exports = exports.order.len(),
            imports = imports.order.len(),
            relocs = relocs.len(),
            "finalized module"
        );

        stream.seek(SeekFrom::Start(4))?;
        for table in [export_table_pos, import_table_pos, relocs_table_pos, string_table_pos] {
            stream.write_all(&(table as u32).to_le_bytes())?;
        }
        stream.write_all(&SECTION_START.to_le_bytes())?;
        stream.write_all(&((data_end - SECTION_START as u64) as u32).to_le_bytes())?;
        stream.seek(SeekFrom::Start(end))?;
        Ok(())
    }
}

/// Zero-pad the stream to the next 4-byte boundary, returning the aligned
/// position.
fn pad_to_word<W: Write + Seek>(stream: &mut W) -> Result<u64> {
    let pos = stream.stream_position()?;
    let aligned = align_up(pos, 4);
    if aligned > pos {
        stream.write_all(&[0u8; 3][..(aligned - pos) as usize])?;
    }
    Ok(aligned)
}

fn write_symbol_table<W: Write + Seek>(
    stream: &mut W,
    table: &SymbolMap,
    strings: &StringArena,
) -> Result<()> {
    stream.write_all(&(table.order.len() as u32).to_le_bytes())?;
    for id in &table.order {
        let name_offset = strings.entries[id.0].1;
        let data_offset = table.offsets[id];
        stream.write_all(&name_offset.to_le_bytes())?;
        stream.write_all(&data_offset.to_le_bytes())?;
    }
    Ok(())
}
