//! Linetable decoding.
//!
//! Managed runtimes have shipped three distinct encodings for mapping an
//! instruction offset back to source positions. Each is decoded by its own
//! function; the state machines are different enough that unifying them
//! behind one parser obscures all three. The header's runtime version
//! selects which decoder a capture uses.

use crate::format::varint::{read_signed_varint, read_varint};

/// Marker in the legacy and line-range formats for "no line change" /
/// "no line for this range".
const NO_LINE_NUMBER: i8 = -128;

/// Which linetable encoding a runtime version uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinetableFormat {
    /// Flat `(byte_delta: u8, line_delta: i8)` pairs.
    ByteDeltas,
    /// Byte-indexed line ranges, no column info.
    LineRanges,
    /// Variable-length entries carrying line and column ranges.
    Positions,
}

impl LinetableFormat {
    /// Pick the decoder for a `major << 16 | minor << 8 | patch` version.
    pub fn for_runtime_version(version: u32) -> Self {
        let major = version >> 16;
        let minor = (version >> 8) & 0xff;
        match (major, minor) {
            (0..=2, _) => LinetableFormat::ByteDeltas,
            (3, 0..=9) => LinetableFormat::ByteDeltas,
            (3, 10) => LinetableFormat::LineRanges,
            _ => LinetableFormat::Positions,
        }
    }

    /// Decode `table` at `instruction_offset`.
    ///
    /// Returns `None` for a malformed or exhausted table; the caller
    /// substitutes a placeholder position.
    pub fn decode(
        self,
        table: &[u8],
        firstlineno: i32,
        instruction_offset: u32,
    ) -> Option<LinePosition> {
        match self {
            LinetableFormat::ByteDeltas => decode_byte_deltas(table, firstlineno, instruction_offset),
            LinetableFormat::LineRanges => decode_line_ranges(table, firstlineno, instruction_offset),
            LinetableFormat::Positions => decode_positions(table, firstlineno, instruction_offset),
        }
    }
}

/// A resolved source position. Missing information is `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePosition {
    pub lineno: i32,
    pub end_lineno: i32,
    pub column: i32,
    pub end_column: i32,
}

impl LinePosition {
    fn line_only(lineno: i32) -> Self {
        Self {
            lineno,
            end_lineno: lineno,
            column: -1,
            end_column: -1,
        }
    }

    /// Placeholder for unknown positions.
    pub fn unknown() -> Self {
        Self {
            lineno: -1,
            end_lineno: -1,
            column: -1,
            end_column: -1,
        }
    }
}

/// Legacy format: `(byte_delta: u8, line_delta: i8)` pairs.
///
/// Byte offsets and line numbers accumulate pair by pair; iteration stops
/// once the accumulated byte offset passes the requested one. End
/// positions are reported equal to the start line and columns are absent;
/// that is the best the encoding can express.
fn decode_byte_deltas(table: &[u8], firstlineno: i32, instruction_offset: u32) -> Option<LinePosition> {
    if table.len() % 2 != 0 {
        return None;
    }
    let mut lineno = firstlineno;
    let mut addr: u64 = 0;
    for pair in table.chunks_exact(2) {
        let byte_delta = pair[0];
        let line_delta = pair[1] as i8;
        addr += u64::from(byte_delta);
        if addr > u64::from(instruction_offset) {
            break;
        }
        if line_delta != NO_LINE_NUMBER {
            lineno += i32::from(line_delta);
        }
    }
    Some(LinePosition::line_only(lineno))
}

/// Line-range format: `(byte_span: u8, line_delta: i8)` pairs where each
/// pair covers `byte_span` bytes of code; a line delta of -128 marks a
/// range with no line at all.
fn decode_line_ranges(table: &[u8], firstlineno: i32, instruction_offset: u32) -> Option<LinePosition> {
    if table.len() % 2 != 0 {
        return None;
    }
    let mut lineno = firstlineno;
    let mut addr: u64 = 0;
    for pair in table.chunks_exact(2) {
        let byte_span = pair[0];
        let line_delta = pair[1] as i8;
        let line_for_range = if line_delta == NO_LINE_NUMBER {
            None
        } else {
            lineno += i32::from(line_delta);
            Some(lineno)
        };
        let end = addr + u64::from(byte_span);
        if u64::from(instruction_offset) < end {
            return Some(match line_for_range {
                Some(line) => LinePosition::line_only(line),
                None => LinePosition::unknown(),
            });
        }
        addr = end;
    }
    None
}

// Entry codes of the positions format.
const CODE_NO_INFO: u8 = 15;
const CODE_LONG: u8 = 14;
const CODE_NO_COLUMNS: u8 = 13;
const CODE_ONE_LINE_BASE: u8 = 10;

/// Positions format: each entry starts with a tag byte packing
/// `(code: 4, length: 3)`; the entry covers `length + 1` instructions.
fn decode_positions(table: &[u8], firstlineno: i32, instruction_offset: u32) -> Option<LinePosition> {
    let mut cursor = table;
    let mut lineno = firstlineno;
    let mut unit: u64 = 0;
    let target = u64::from(instruction_offset);

    while !cursor.is_empty() {
        let tag = take_byte(&mut cursor)?;
        let code = (tag >> 3) & 0x0f;
        let length = u64::from(tag & 0x07) + 1;

        let position = match code {
            CODE_NO_INFO => LinePosition::unknown(),
            CODE_LONG => {
                lineno += read_signed_varint(&mut cursor).ok()? as i32;
                let end_line_delta = read_varint(&mut cursor).ok()? as i32;
                let column = read_varint(&mut cursor).ok()? as i32;
                let end_column = read_varint(&mut cursor).ok()? as i32;
                LinePosition {
                    lineno,
                    end_lineno: lineno + end_line_delta,
                    column,
                    end_column,
                }
            }
            CODE_NO_COLUMNS => {
                lineno += read_signed_varint(&mut cursor).ok()? as i32;
                LinePosition::line_only(lineno)
            }
            code if code >= CODE_ONE_LINE_BASE => {
                lineno += i32::from(code - CODE_ONE_LINE_BASE);
                let column = take_byte(&mut cursor)?;
                let end_column = take_byte(&mut cursor)?;
                LinePosition {
                    lineno,
                    end_lineno: lineno,
                    column: i32::from(column),
                    end_column: i32::from(end_column),
                }
            }
            short => {
                // Short form: the second byte packs a 3-bit column high
                // part and a 4-bit column extent.
                let packed = take_byte(&mut cursor)?;
                let column = (i32::from(short) << 3) | i32::from((packed >> 4) & 0x07);
                let end_column = column + i32::from(packed & 0x0f);
                LinePosition {
                    lineno,
                    end_lineno: lineno,
                    column,
                    end_column,
                }
            }
        };

        if target < unit + length {
            return Some(position);
        }
        unit += length;
    }
    None
}

fn take_byte(cursor: &mut &[u8]) -> Option<u8> {
    let (&first, rest) = cursor.split_first()?;
    *cursor = rest;
    Some(first)
}
