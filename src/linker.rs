//! Multi-module linking: layout, symbol resolution, pointer fixups.
//!
//! Linking is two passes. Pass 1 walks the modules in order and assigns
//! each an aligned base address. Pass 2 copies every data section into
//! the output, resolves import sites against the exports published so
//! far, re-sweeps the pending sites after each module's exports land, and
//! finally applies the module's internal relocations.
//!
//! Module order is meaningful: a later module's export shadows an earlier
//! one of the same name. An import is never resolved against its own
//! module's exports directly; it waits on the pending list until the
//! re-sweep that follows publication, which gives the same answer.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::format::{align_up, SymbolSize};
use crate::view::View;

/// How `patch` combines the incoming value with the word at the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    /// Overwrite the word. Import sites hold no meaningful prior value,
    /// so the resolved address replaces it; the value must fit the width.
    Replace,
    /// Add to the word, wrapping at the symbol width. Relocation sites
    /// already hold a section-relative pointer that becomes absolute.
    Add,
}

/// Options controlling module layout and symbol widths.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Every module's base is rounded up to a multiple of this. Must be a
    /// positive power of two.
    pub module_alignment: u64,
    /// Link-wide pointer width. `None` adopts the first module's.
    pub symbol_size: Option<SymbolSize>,
    /// Logical address at which the image is loaded; the first module's
    /// base.
    pub base_address: u64,
}

impl Default for LinkOptions {
    fn default() -> LinkOptions {
        LinkOptions {
            module_alignment: 16,
            symbol_size: None,
            base_address: 0,
        }
    }
}

/// An import site that no module exported a symbol for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedImport<'a> {
    /// Absolute address of the patch site in the output image.
    pub address: u64,
    /// Symbol name as stored in the module's string table.
    pub name: &'a [u8],
}

/// Result of a completed link.
///
/// The core only exposes the symbol map and the leftover imports; whether
/// unresolved imports are fatal is the caller's policy.
pub struct LinkReport<'a> {
    /// Every exported symbol and its absolute address; for names exported
    /// more than once, the last module's address.
    pub symbols: HashMap<&'a [u8], u64>,
    /// Imports that stayed unresolved after the final sweep. Their sites
    /// still hold the module's original bytes.
    pub unresolved: Vec<UnresolvedImport<'a>>,
    /// One past the highest address the layout assigned.
    pub image_end: u64,
}

impl<'a> LinkReport<'a> {
    /// Symbols sorted by name, for deterministic dumps.
    pub fn sorted_symbols(&self) -> Vec<(&'a [u8], u64)> {
        let mut symbols: Vec<(&'a [u8], u64)> =
            self.symbols.iter().map(|(&name, &address)| (name, address)).collect();
        symbols.sort();
        symbols
    }
}

/// Read-modify-write of one `size`-wide little-endian word at the current
/// stream position. The position is unchanged afterwards.
pub fn patch<S: Read + Write + Seek>(
    stream: &mut S,
    size: SymbolSize,
    value: u64,
    mode: PatchMode,
) -> Result<()> {
    let pos = stream.stream_position()?;
    let width = size.bytes();
    let mut word = [0u8; 8];
    stream.read_exact(&mut word[..width])?;
    let old = u64::from_le_bytes(word);

    let new = match mode {
        PatchMode::Replace => {
            if value > size.max_value() {
                return Err(Error::ValueDoesNotFit { value, size: width });
            }
            value
        }
        PatchMode::Add => old.wrapping_add(value) & size.max_value(),
    };

    stream.seek(SeekFrom::Start(pos))?;
    stream.write_all(&new.to_le_bytes()[..width])?;
    stream.seek(SeekFrom::Start(pos))?;
    Ok(())
}

/// Link `modules` into `output`, returning the symbol map and whatever
/// imports never resolved.
///
/// A failed link leaves the output stream in an indeterminate state;
/// callers must discard it.
#[tracing::instrument(skip_all, name = "link")]
pub fn link<'a, S>(
    modules: &[View<'a>],
    output: &mut S,
    options: &LinkOptions,
) -> Result<LinkReport<'a>>
where
    S: Read + Write + Seek,
{
    if modules.is_empty() {
        return Err(Error::NothingToLink);
    }
    assert!(
        options.module_alignment.is_power_of_two(),
        "module_alignment must be a positive power of two"
    );

    let symbol_size = options.symbol_size.unwrap_or_else(|| modules[0].symbol_size());

    // Pass 1: assign base addresses.
    let mut bases = Vec::with_capacity(modules.len());
    let mut base = options.base_address;
    for module in modules {
        if module.symbol_size() != symbol_size {
            return Err(Error::MismatchingSymbolSize {
                expected: symbol_size.bytes(),
                found: module.symbol_size().bytes(),
            });
        }
        bases.push(base);
        let occupied = align_up(module.data().len() as u64, options.module_alignment);
        base = base.checked_add(occupied).ok_or(Error::IntegerOverflow)?;
    }
    let image_end = base;
    tracing::debug!(
        modules = modules.len(),
        base_address = options.base_address,
        image_end,
        "laid out modules"
    );

    // Pass 2: emit data, resolve symbols, patch.
    let mut symbols: HashMap<&'a [u8], u64> = HashMap::new();
    let mut pending: Vec<UnresolvedImport<'a>> = Vec::new();

    for (module, &module_base) in modules.iter().zip(&bases) {
        output.seek(SeekFrom::Start(module_base))?;
        output.write_all(module.data())?;

        // Imports: sites naming a symbol already published resolve now;
        // everything else joins the pending list.
        if let (Some(imports), Some(strings)) = (module.imports(), module.strings()) {
            for symbol in imports.iter() {
                let site = module_base + symbol.data_offset as u64;
                let name = strings.get(symbol.name_offset).bytes;
                match symbols.get(name) {
                    Some(&address) => {
                        output.seek(SeekFrom::Start(site))?;
                        patch(output, symbol_size, address, PatchMode::Replace)?;
                        tracing::trace!(site, address, "resolved import");
                    }
                    None => pending.push(UnresolvedImport { address: site, name }),
                }
            }
        }

        // Publish exports; a later module shadows an earlier one.
        if let (Some(exports), Some(strings)) = (module.exports(), module.strings()) {
            for symbol in exports.iter() {
                let name = strings.get(symbol.name_offset).bytes;
                symbols.insert(name, module_base + symbol.data_offset as u64);
            }
        }

        // Re-sweep: the exports just published may satisfy sites from this
        // or any earlier module. Removal order is not observable.
        let mut i = 0;
        while i < pending.len() {
            match symbols.get(pending[i].name) {
                Some(&address) => {
                    output.seek(SeekFrom::Start(pending[i].address))?;
                    patch(output, symbol_size, address, PatchMode::Replace)?;
                    pending.swap_remove(i);
                }
                None => i += 1,
            }
        }

        // Internal relocations: the word holds a section-relative pointer;
        // adding the module base makes it absolute.
        if let Some(relocations) = module.relocations() {
            for offset in relocations.iter() {
                output.seek(SeekFrom::Start(module_base + offset as u64))?;
                patch(output, symbol_size, module_base, PatchMode::Add)?;
            }
        }
    }

    if !pending.is_empty() {
        tracing::debug!(count = pending.len(), "imports left unresolved");
    }

    Ok(LinkReport { symbols, unresolved: pending, image_end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::view::{View, ViewOptions};
    use std::io::Cursor;

    fn module(
        symbol_size: SymbolSize,
        build: impl FnOnce(&mut Builder<'_, Cursor<Vec<u8>>>),
    ) -> Vec<u8> {
        let mut stream = Cursor::new(Vec::new());
        let mut builder = Builder::new(symbol_size, &mut stream).unwrap();
        build(&mut builder);
        builder.finalize().unwrap();
        stream.into_inner()
    }

    fn open(buf: &[u8]) -> View<'_> {
        View::open(buf, ViewOptions::default()).unwrap()
    }

    #[test]
    fn test_link_forward_reference() {
        let a = module(SymbolSize::Bits16, |b| {
            b.add_import("f", Some(0));
            b.append(&[0, 0]).unwrap();
        });
        let b = module(SymbolSize::Bits16, |b| {
            b.append(&[0; 4]).unwrap();
            b.add_export("f", None);
            b.append(&[0xEE, 0xFF]).unwrap();
        });

        let views = [open(&a), open(&b)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { base_address: 0x1000, ..LinkOptions::default() };
        let report = link(&views, &mut out, &options).unwrap();

        let image = out.into_inner();
        assert_eq!(&image[0x1000..0x1002], &0x1014u16.to_le_bytes());
        assert_eq!(&image[0x1010..0x1016], &[0, 0, 0, 0, 0xEE, 0xFF]);
        assert_eq!(report.symbols[&b"f"[..]], 0x1014);
        assert!(report.unresolved.is_empty());
        assert_eq!(report.image_end, 0x1020);
    }

    #[test]
    fn test_internal_relocation() {
        let m = module(SymbolSize::Bits32, |b| {
            b.add_relocation(Some(0));
            b.append(&[0, 0, 0, 0]).unwrap();
        });

        let views = [open(&m)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { base_address: 0x4000, ..LinkOptions::default() };
        link(&views, &mut out, &options).unwrap();

        let image = out.into_inner();
        assert_eq!(&image[0x4000..0x4004], &0x0000_4000u32.to_le_bytes());
    }

    #[test]
    fn test_relocation_preserves_prior_value() {
        // The word already holds a section-relative pointer; the base is
        // added, not substituted.
        let m = module(SymbolSize::Bits32, |b| {
            b.add_relocation(Some(0));
            b.append(&0x0000_0008u32.to_le_bytes()).unwrap();
            b.append(&[0; 8]).unwrap();
        });

        let views = [open(&m)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { base_address: 0x100, ..LinkOptions::default() };
        link(&views, &mut out, &options).unwrap();

        let image = out.into_inner();
        assert_eq!(&image[0x100..0x104], &0x0000_0108u32.to_le_bytes());
    }

    #[test]
    fn test_nothing_to_link() {
        let views: [View; 0] = [];
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(
            link(&views, &mut out, &LinkOptions::default()),
            Err(Error::NothingToLink)
        ));
    }

    #[test]
    fn test_mismatching_symbol_size() {
        let a = module(SymbolSize::Bits16, |b| b.append(&[0; 2]).unwrap());
        let b = module(SymbolSize::Bits32, |b| b.append(&[0; 4]).unwrap());

        let views = [open(&a), open(&b)];
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(
            link(&views, &mut out, &LinkOptions::default()),
            Err(Error::MismatchingSymbolSize { expected: 2, found: 4 })
        ));

        // An explicit link-wide size must match every module.
        let views = [open(&b)];
        let options = LinkOptions { symbol_size: Some(SymbolSize::Bits16), ..LinkOptions::default() };
        assert!(matches!(
            link(&views, &mut out, &options),
            Err(Error::MismatchingSymbolSize { expected: 2, found: 4 })
        ));
    }

    #[test]
    fn test_later_export_shadows_earlier() {
        let first = module(SymbolSize::Bits16, |b| {
            b.add_export("dup", Some(0));
            b.append(&[1; 4]).unwrap();
        });
        let second = module(SymbolSize::Bits16, |b| {
            b.add_export("dup", Some(2));
            b.append(&[2; 4]).unwrap();
        });
        let third = module(SymbolSize::Bits16, |b| {
            b.add_import("dup", Some(0));
            b.append(&[0, 0]).unwrap();
        });

        let views = [open(&first), open(&second), open(&third)];
        let mut out = Cursor::new(Vec::new());
        let report = link(&views, &mut out, &LinkOptions::default()).unwrap();

        // first at 0, second at 16, third at 32; the import sees the
        // shadowing export at 16 + 2.
        assert_eq!(report.symbols[&b"dup"[..]], 18);
        let image = out.into_inner();
        assert_eq!(&image[32..34], &18u16.to_le_bytes());
    }

    #[test]
    fn test_same_module_import_resolved_by_sweep() {
        let m = module(SymbolSize::Bits16, |b| {
            b.add_import("self_ref", Some(0));
            b.add_export("self_ref", Some(0));
            b.append(&[0, 0]).unwrap();
        });

        let views = [open(&m)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { base_address: 0x100, ..LinkOptions::default() };
        let report = link(&views, &mut out, &options).unwrap();

        assert!(report.unresolved.is_empty());
        let image = out.into_inner();
        assert_eq!(&image[0x100..0x102], &0x100u16.to_le_bytes());
    }

    #[test]
    fn test_unresolved_import_reported() {
        let m = module(SymbolSize::Bits16, |b| {
            b.add_import("missing", Some(0));
            b.append(&[0xAB, 0xCD]).unwrap();
        });

        let views = [open(&m)];
        let mut out = Cursor::new(Vec::new());
        let report = link(&views, &mut out, &LinkOptions::default()).unwrap();

        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].name, b"missing");
        assert_eq!(report.unresolved[0].address, 0);
        // The site keeps the module's original bytes.
        assert_eq!(&out.into_inner()[0..2], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_resolved_address_must_fit_symbol_width() {
        let a = module(SymbolSize::Bits16, |b| {
            b.add_import("far", Some(0));
            b.append(&[0, 0]).unwrap();
        });
        let b = module(SymbolSize::Bits16, |b| {
            b.add_export("far", Some(0));
            b.append(&[0, 0]).unwrap();
        });

        let views = [open(&a), open(&b)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { base_address: 0x2_0000, ..LinkOptions::default() };
        assert!(matches!(
            link(&views, &mut out, &options),
            Err(Error::ValueDoesNotFit { .. })
        ));
    }

    #[test]
    fn test_module_alignment() {
        let a = module(SymbolSize::Bits16, |b| b.append(&[1]).unwrap());
        let b = module(SymbolSize::Bits16, |b| {
            b.add_export("next", Some(0));
            b.append(&[2, 2]).unwrap();
        });

        let views = [open(&a), open(&b)];
        let mut out = Cursor::new(Vec::new());
        let options = LinkOptions { module_alignment: 4, ..LinkOptions::default() };
        let report = link(&views, &mut out, &options).unwrap();
        assert_eq!(report.symbols[&b"next"[..]], 4);
        assert_eq!(report.image_end, 8);
    }

    #[test]
    fn test_link_determinism() {
        let run = || {
            let a = module(SymbolSize::Bits32, |b| {
                b.add_import("f", Some(0));
                b.add_import("g", Some(4));
                b.add_relocation(Some(8));
                b.append(&[0; 12]).unwrap();
            });
            let b = module(SymbolSize::Bits32, |b| {
                b.add_export("f", Some(0));
                b.add_export("g", Some(4));
                b.append(&[0; 8]).unwrap();
            });
            let views = [open(&a), open(&b)];
            let mut out = Cursor::new(Vec::new());
            let options = LinkOptions { base_address: 0x800, ..LinkOptions::default() };
            link(&views, &mut out, &options).unwrap();
            out.into_inner()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_patch_replace_and_position() {
        let mut stream = Cursor::new(vec![0u8; 8]);
        stream.seek(SeekFrom::Start(2)).unwrap();
        patch(&mut stream, SymbolSize::Bits32, 0xAABB_CCDD, PatchMode::Replace).unwrap();
        assert_eq!(stream.stream_position().unwrap(), 2);
        assert_eq!(&stream.into_inner()[2..6], &0xAABB_CCDDu32.to_le_bytes());
    }

    #[test]
    fn test_patch_replace_rejects_wide_value() {
        let mut stream = Cursor::new(vec![0u8; 2]);
        assert!(matches!(
            patch(&mut stream, SymbolSize::Bits8, 0x100, PatchMode::Replace),
            Err(Error::ValueDoesNotFit { value: 0x100, size: 1 })
        ));
    }

    #[test]
    fn test_patch_add_wraps() {
        let mut stream = Cursor::new(vec![0xFF, 0xFF, 0x55]);
        patch(&mut stream, SymbolSize::Bits16, 2, PatchMode::Add).unwrap();
        let bytes = stream.into_inner();
        assert_eq!(&bytes[0..2], &1u16.to_le_bytes());
        // Bytes outside the word are untouched.
        assert_eq!(bytes[2], 0x55);
    }

    #[test]
    fn test_sorted_symbols_dump() {
        let m = module(SymbolSize::Bits16, |b| {
            b.add_export("zeta", Some(0));
            b.add_export("alpha", Some(2));
            b.append(&[0; 4]).unwrap();
        });

        let views = [open(&m)];
        let mut out = Cursor::new(Vec::new());
        let report = link(&views, &mut out, &LinkOptions::default()).unwrap();
        let sorted = report.sorted_symbols();
        assert_eq!(sorted, vec![(&b"alpha"[..], 2), (&b"zeta"[..], 0)]);
    }
}
