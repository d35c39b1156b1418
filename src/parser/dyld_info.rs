//! Dyld-info opcode streams: interpretation and regeneration.
//!
//! Four streams share a compact stack-machine vocabulary. The interpreter is
//! stateless between streams; each stream carries its own register set
//! (type, segment/offset, ordinal, addend, symbol, weak-import). The rebase
//! stream is only read up to its patch boundary — the reserved tail holds
//! whatever the previous link left there.
//!
//! The encoders are the write half: they produce minimal streams the
//! interpreter maps back onto the same entry sets, which is what lets the
//! patcher append regenerated info after the used prefix of each region.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{memchr_null, read_sleb128, read_uleb128, write_sleb128, write_uleb128};

use super::{BindingEntry, RebaseEntry};

pub(crate) struct DyldInfoContext<'a> {
    pub data: &'a [u8],
    pub segments: &'a [SegmentCommand64],
    pub pointer_size: u64,
    pub base_address: u64,
}

impl<'a> DyldInfoContext<'a> {
    fn seg_start_address(&self, index: u8) -> Result<u64> {
        self.segments
            .get(index as usize)
            .map(|seg| seg.vmaddr)
            .ok_or_else(|| Error::malformed(0, format!("segment index {index} out of range")))
    }

    /// Interprets the rebase stream between `start` and `stop`.
    pub fn parse_rebase(
        &self,
        start: usize,
        stop: usize,
    ) -> Result<(Vec<RebaseEntry>, HashSet<u64>)> {
        let mut rebases = Vec::new();
        let mut addresses = HashSet::new();
        let end = stop.min(self.data.len());

        let mut p = start;
        let mut kind = 0u8;
        let mut seg_start = 0u64;
        let mut seg_offset = 0u64;
        let mut done = false;
        while !done && p < end {
            let byte = self.data[p];
            let immediate = byte & REBASE_IMMEDIATE_MASK;
            let opcode = byte & REBASE_OPCODE_MASK;
            p += 1;
            match opcode {
                REBASE_OPCODE_DONE => done = true,
                REBASE_OPCODE_SET_TYPE_IMM => kind = immediate,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    seg_start = self.seg_start_address(immediate)?;
                    seg_offset = read_uleb128(self.data, &mut p, end)?;
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => {
                    seg_offset = seg_offset.wrapping_add(read_uleb128(self.data, &mut p, end)?);
                }
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    seg_offset += immediate as u64 * self.pointer_size;
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    for _ in 0..immediate {
                        let address = seg_start + seg_offset;
                        addresses.insert(address);
                        rebases.push(RebaseEntry { kind, address });
                        seg_offset += self.pointer_size;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let count = read_uleb128(self.data, &mut p, end)?;
                    for _ in 0..count {
                        let address = seg_start + seg_offset;
                        addresses.insert(address);
                        rebases.push(RebaseEntry { kind, address });
                        seg_offset += self.pointer_size;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    let address = seg_start + seg_offset;
                    addresses.insert(address);
                    rebases.push(RebaseEntry { kind, address });
                    seg_offset += read_uleb128(self.data, &mut p, end)? + self.pointer_size;
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = read_uleb128(self.data, &mut p, end)?;
                    let skip = read_uleb128(self.data, &mut p, end)?;
                    for _ in 0..count {
                        let address = seg_start + seg_offset;
                        addresses.insert(address);
                        rebases.push(RebaseEntry { kind, address });
                        seg_offset += skip + self.pointer_size;
                    }
                }
                _ => {
                    return Err(Error::malformed(p - 1, format!("bad rebase opcode {byte:#x}")));
                }
            }
        }
        Ok((rebases, addresses))
    }

    /// Interprets a bind stream.
    ///
    /// The normal and weak streams run to their declared end or a DONE
    /// opcode. The lazy stream is a sequence of isolated per-symbol runs
    /// where DONE only separates them, so `lazy` keeps scanning past it.
    pub fn parse_bindings(&self, start: usize, size: usize, lazy: bool) -> Result<Vec<BindingEntry>> {
        let mut bindings = Vec::new();
        let end = (start + size).min(self.data.len());

        let mut p = start;
        let mut kind = if lazy { BIND_TYPE_POINTER } else { 0u8 };
        let mut address = self.base_address;
        let mut symbol = String::new();
        let mut ordinal: i64 = 0;
        let mut addend: i64 = 0;
        let mut weak_import = false;
        let mut done = false;
        while !done && p < end {
            let byte = self.data[p];
            let immediate = byte & BIND_IMMEDIATE_MASK;
            let opcode = byte & BIND_OPCODE_MASK;
            p += 1;
            match opcode {
                BIND_OPCODE_DONE => {
                    if !lazy {
                        done = true;
                    }
                }
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = immediate as i64,
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                    ordinal = read_uleb128(self.data, &mut p, end)? as i64;
                }
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    // the special ordinals are sign-extended small negatives
                    ordinal = if immediate == 0 {
                        0
                    } else {
                        (BIND_OPCODE_MASK | immediate) as i8 as i64
                    };
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    let len = memchr_null(&self.data[p..end]);
                    if p + len >= end {
                        return Err(Error::malformed(p, "unterminated bind symbol name"));
                    }
                    symbol = String::from_utf8_lossy(&self.data[p..p + len]).into_owned();
                    p += len + 1;
                    weak_import = (immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT) != 0;
                }
                BIND_OPCODE_SET_TYPE_IMM => kind = immediate,
                BIND_OPCODE_SET_ADDEND_SLEB => {
                    addend = read_sleb128(self.data, &mut p, end)?;
                }
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    let seg_start = self.seg_start_address(immediate)?;
                    address = seg_start + read_uleb128(self.data, &mut p, end)?;
                }
                BIND_OPCODE_ADD_ADDR_ULEB => {
                    address = address.wrapping_add(read_uleb128(self.data, &mut p, end)?);
                }
                BIND_OPCODE_DO_BIND => {
                    bindings.push(BindingEntry {
                        kind,
                        ordinal,
                        symbol: symbol.clone(),
                        weak_import,
                        address,
                        addend,
                    });
                    address += self.pointer_size;
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    let skip = read_uleb128(self.data, &mut p, end)?;
                    bindings.push(BindingEntry {
                        kind,
                        ordinal,
                        symbol: symbol.clone(),
                        weak_import,
                        address,
                        addend,
                    });
                    address += self.pointer_size + skip;
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    bindings.push(BindingEntry {
                        kind,
                        ordinal,
                        symbol: symbol.clone(),
                        weak_import,
                        address,
                        addend,
                    });
                    address += immediate as u64 * self.pointer_size + self.pointer_size;
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = read_uleb128(self.data, &mut p, end)?;
                    let skip = read_uleb128(self.data, &mut p, end)?;
                    for _ in 0..count {
                        bindings.push(BindingEntry {
                            kind,
                            ordinal,
                            symbol: symbol.clone(),
                            weak_import,
                            address,
                            addend,
                        });
                        address += self.pointer_size + skip;
                    }
                }
                BIND_OPCODE_THREADED => match immediate {
                    BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB => {
                        let _table_size = read_uleb128(self.data, &mut p, end)?;
                    }
                    BIND_SUBOPCODE_THREADED_APPLY => {}
                    _ => {
                        return Err(Error::malformed(
                            p - 1,
                            format!("unknown threaded bind subopcode {immediate}"),
                        ));
                    }
                },
                _ => {
                    return Err(Error::malformed(p - 1, format!("unknown bind opcode {byte:#x}")));
                }
            }
        }
        Ok(bindings)
    }
}

// =============================================================================
// Encoders
// =============================================================================

fn segment_index_for(segments: &[SegmentCommand64], address: u64) -> Result<usize> {
    segments
        .iter()
        .position(|seg| address >= seg.vmaddr && address < seg.vmaddr + seg.vmsize)
        .ok_or_else(|| Error::malformed(0, format!("address {address:#x} not in any segment")))
}

/// Encodes a rebase entry list as an opcode stream.
///
/// Consecutive pointer-stride runs collapse into a single do-rebase opcode,
/// so re-interpreting the output yields exactly the input set.
pub fn encode_rebase_info(
    entries: &[RebaseEntry],
    segments: &[SegmentCommand64],
    pointer_size: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut kind = 0u8;
    // segment index and the address the stream cursor sits at
    let mut position: Option<(usize, u64)> = None;

    let mut i = 0;
    while i < entries.len() {
        let entry = &entries[i];
        if entry.kind != kind {
            out.push(REBASE_OPCODE_SET_TYPE_IMM | (entry.kind & REBASE_IMMEDIATE_MASK));
            kind = entry.kind;
        }
        let seg = segment_index_for(segments, entry.address)?;
        match position {
            Some((s, addr)) if s == seg && addr == entry.address => {}
            _ => {
                out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg as u8);
                write_uleb128(&mut out, entry.address - segments[seg].vmaddr);
            }
        }

        let mut run = 1u64;
        while i + (run as usize) < entries.len() {
            let next = &entries[i + run as usize];
            if next.kind == entry.kind
                && next.address == entry.address + run * pointer_size
                && segment_index_for(segments, next.address)? == seg
            {
                run += 1;
            } else {
                break;
            }
        }
        if run < 16 {
            out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | run as u8);
        } else {
            out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            write_uleb128(&mut out, run);
        }
        position = Some((seg, entry.address + run * pointer_size));
        i += run as usize;
    }
    out.push(REBASE_OPCODE_DONE);
    Ok(out)
}

/// Encodes a binding entry list as an opcode stream.
///
/// For the lazy stream each symbol's run is terminated with DONE, matching
/// the per-symbol islands dyld expects.
pub fn encode_binding_info(
    entries: &[BindingEntry],
    segments: &[SegmentCommand64],
    pointer_size: u64,
    lazy: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut kind = if lazy { BIND_TYPE_POINTER } else { 0u8 };
    let mut ordinal: Option<i64> = None;
    let mut symbol: Option<(&str, bool)> = None;
    let mut addend = 0i64;
    let mut position: Option<u64> = None;

    for entry in entries {
        if ordinal != Some(entry.ordinal) {
            if entry.ordinal < 0 {
                out.push(
                    BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
                        | (entry.ordinal as u8 & BIND_IMMEDIATE_MASK),
                );
            } else if entry.ordinal <= BIND_IMMEDIATE_MASK as i64 {
                out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | entry.ordinal as u8);
            } else {
                out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                write_uleb128(&mut out, entry.ordinal as u64);
            }
            ordinal = Some(entry.ordinal);
        }
        if symbol != Some((entry.symbol.as_str(), entry.weak_import)) {
            let flags = if entry.weak_import {
                BIND_SYMBOL_FLAGS_WEAK_IMPORT
            } else {
                0
            };
            out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
            out.extend_from_slice(entry.symbol.as_bytes());
            out.push(0);
            symbol = Some((entry.symbol.as_str(), entry.weak_import));
        }
        if entry.kind != kind {
            out.push(BIND_OPCODE_SET_TYPE_IMM | (entry.kind & BIND_IMMEDIATE_MASK));
            kind = entry.kind;
        }
        if entry.addend != addend {
            out.push(BIND_OPCODE_SET_ADDEND_SLEB);
            write_sleb128(&mut out, entry.addend);
            addend = entry.addend;
        }
        if position != Some(entry.address) {
            let seg = segment_index_for(segments, entry.address)?;
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg as u8);
            write_uleb128(&mut out, entry.address - segments[seg].vmaddr);
        }
        out.push(BIND_OPCODE_DO_BIND);
        position = Some(entry.address + pointer_size);
        if lazy {
            out.push(BIND_OPCODE_DONE);
        }
    }
    if !lazy {
        out.push(BIND_OPCODE_DONE);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments() -> Vec<SegmentCommand64> {
        let mut text = SegmentCommand64::default();
        text.set_name("__TEXT");
        text.vmaddr = 0x1_0000_0000;
        text.vmsize = 0x4000;
        let mut data = SegmentCommand64::default();
        data.set_name("__DATA");
        data.vmaddr = 0x1_0000_4000;
        data.vmsize = 0x4000;
        vec![text, data]
    }

    fn ctx<'a>(data: &'a [u8], segments: &'a [SegmentCommand64]) -> DyldInfoContext<'a> {
        DyldInfoContext {
            data,
            segments,
            pointer_size: 8,
            base_address: 0x1_0000_0000,
        }
    }

    #[test]
    fn test_rebase_roundtrip_idempotent() {
        let segments = segments();
        let entries = vec![
            RebaseEntry { kind: REBASE_TYPE_POINTER, address: 0x1_0000_4000 },
            RebaseEntry { kind: REBASE_TYPE_POINTER, address: 0x1_0000_4008 },
            RebaseEntry { kind: REBASE_TYPE_POINTER, address: 0x1_0000_4010 },
            RebaseEntry { kind: REBASE_TYPE_POINTER, address: 0x1_0000_4100 },
        ];
        let stream = encode_rebase_info(&entries, &segments, 8).unwrap();
        let (parsed, addresses) = ctx(&stream, &segments).parse_rebase(0, stream.len()).unwrap();
        assert_eq!(parsed, entries);
        assert!(addresses.contains(&0x1_0000_4100));

        // re-encode the parse result: the emitted set must be invariant
        let stream2 = encode_rebase_info(&parsed, &segments, 8).unwrap();
        let (parsed2, _) = ctx(&stream2, &segments).parse_rebase(0, stream2.len()).unwrap();
        assert_eq!(parsed2, entries);
    }

    #[test]
    fn test_rebase_long_run_uses_uleb_times() {
        let segments = segments();
        let entries: Vec<RebaseEntry> = (0..40)
            .map(|i| RebaseEntry {
                kind: REBASE_TYPE_POINTER,
                address: 0x1_0000_4000 + i * 8,
            })
            .collect();
        let stream = encode_rebase_info(&entries, &segments, 8).unwrap();
        assert!(stream.contains(&REBASE_OPCODE_DO_REBASE_ULEB_TIMES));
        let (parsed, _) = ctx(&stream, &segments).parse_rebase(0, stream.len()).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_rebase_stops_at_patch_boundary() {
        let segments = segments();
        let entries = vec![
            RebaseEntry { kind: REBASE_TYPE_POINTER, address: 0x1_0000_4000 },
        ];
        let mut stream = encode_rebase_info(&entries, &segments, 8).unwrap();
        let used = stream.len();
        // reserved tail full of garbage the interpreter must never see
        stream.extend_from_slice(&[0xFF; 16]);
        let (parsed, _) = ctx(&stream, &segments).parse_rebase(0, used).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_bind_roundtrip() {
        let segments = segments();
        let entries = vec![
            BindingEntry {
                kind: BIND_TYPE_POINTER,
                ordinal: 1,
                symbol: "_printf".into(),
                weak_import: false,
                address: 0x1_0000_4000,
                addend: 0,
            },
            BindingEntry {
                kind: BIND_TYPE_POINTER,
                ordinal: 1,
                symbol: "_printf".into(),
                weak_import: false,
                address: 0x1_0000_4008,
                addend: 0,
            },
            BindingEntry {
                kind: BIND_TYPE_POINTER,
                ordinal: 2,
                symbol: "_malloc".into(),
                weak_import: false,
                address: 0x1_0000_4020,
                addend: 8,
            },
        ];
        let stream = encode_binding_info(&entries, &segments, 8, false).unwrap();
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), false)
            .unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_weak_import_flag_carried() {
        let segments = segments();
        let stream = vec![
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | BIND_SYMBOL_FLAGS_WEAK_IMPORT,
            b'_', b'm', b'a', b'y', b'b', b'e', 0,
            BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
            0x10,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ];
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), false)
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].symbol, "_maybe");
        assert!(parsed[0].weak_import);
        assert_eq!(parsed[0].address, 0x1_0000_4010);
    }

    #[test]
    fn test_special_ordinal_sign_extension() {
        let segments = segments();
        let stream = vec![
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | 0x0E,
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
            b'_', b'f', 0,
            BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 0,
            0x00,
            BIND_OPCODE_DO_BIND,
            BIND_OPCODE_DONE,
        ];
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), false)
            .unwrap();
        assert_eq!(parsed[0].ordinal, BIND_SPECIAL_DYLIB_FLAT_LOOKUP);
    }

    #[test]
    fn test_special_ordinal_roundtrip() {
        let segments = segments();
        let entries = vec![BindingEntry {
            kind: BIND_TYPE_POINTER,
            ordinal: BIND_SPECIAL_DYLIB_FLAT_LOOKUP,
            symbol: "_dyn".into(),
            weak_import: false,
            address: 0x1_0000_4000,
            addend: 0,
        }];
        let stream = encode_binding_info(&entries, &segments, 8, false).unwrap();
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), false)
            .unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_lazy_stream_scans_past_done() {
        let segments = segments();
        let entries = vec![
            BindingEntry {
                kind: BIND_TYPE_POINTER,
                ordinal: 1,
                symbol: "_printf".into(),
                weak_import: false,
                address: 0x1_0000_4000,
                addend: 0,
            },
            BindingEntry {
                kind: BIND_TYPE_POINTER,
                ordinal: 1,
                symbol: "_close".into(),
                weak_import: false,
                address: 0x1_0000_4008,
                addend: 0,
            },
        ];
        let stream = encode_binding_info(&entries, &segments, 8, true).unwrap();
        // each run ends with DONE; the lazy parse still sees both
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), true)
            .unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_bad_rebase_opcode_rejected() {
        let segments = segments();
        let stream = vec![0x90u8];
        assert!(ctx(&stream, &segments).parse_rebase(0, 1).is_err());
    }

    #[test]
    fn test_truncated_uleb_rejected() {
        let segments = segments();
        let stream = vec![REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 0, 0x80];
        assert!(ctx(&stream, &segments).parse_rebase(0, 2).is_err());
    }

    #[test]
    fn test_threaded_subopcodes() {
        let segments = segments();
        let stream = vec![
            BIND_OPCODE_THREADED | BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB,
            0x10,
            BIND_OPCODE_THREADED | BIND_SUBOPCODE_THREADED_APPLY,
            BIND_OPCODE_DONE,
        ];
        let parsed = ctx(&stream, &segments)
            .parse_bindings(0, stream.len(), false)
            .unwrap();
        assert!(parsed.is_empty());
    }
}
