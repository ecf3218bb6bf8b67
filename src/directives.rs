//! `.data`/`.bss` directive forms
//!
//! Each function here mirrors one `if (re.match(...))` branch of the
//! source's `parse()`: given the punctuation-normalized line (spaces
//! around `:`, `.`, `-`, `=` already stripped — see [`crate::lexer`]),
//! it tries to recognize its directive and, on a match, mutates the
//! symbol table and memory image and returns `true`. The caller
//! ([`crate::parser`]) tries every form in source order and reports a
//! [`Error::MalformedDirective`] if none match.

use crate::error::Error;
use crate::memory::Memory;
use crate::symbols::{DataType, SymbolTable};

/// Encodes `value` as `width` little-endian bytes, two's-complement
/// wrapped. This reproduces the bit pattern Python's
/// `int.to_bytes(width, 'little', signed=...)` would produce for either
/// signedness choice — the source only used the `signed` flag to pick
/// which range check to apply before encoding, not to change the bytes.
fn encode_le(value: i128, width: usize) -> Vec<u8> {
    let modulus = 1i128 << (8 * width as u32);
    let wrapped = value.rem_euclid(modulus);
    (0..width).map(|i| ((wrapped >> (8 * i)) & 0xff) as u8).collect()
}

fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\t", "\t").replace("\\r", "\r")
}

fn parse_decimal(s: &str) -> Option<i128> {
    s.trim().parse::<i128>().ok()
}

/// `<name>:.asciz "<chars>"`
fn try_asciz(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    if !line.contains(":.asciz") {
        return None;
    }
    let quote = line.find('"')?;
    let mut line = line[..quote].to_lowercase() + &line[quote..];
    line = line.replace('"', "");
    line = unescape(&line);
    let (name, chars) = line.split_once(":.asciz ")?;
    let bytes = chars.as_bytes().to_vec();
    symbols.define_data(name, index, chars.chars().count(), DataType::Asciz);
    memory.append(&bytes);
    Some(())
}

/// `<name>:.space <n-or-name>`
fn try_space(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    if !line.contains(":.space") {
        return None;
    }
    let line = line.to_lowercase();
    let (name, operand) = line.split_once(":.space ")?;
    let size = match symbols.get(operand) {
        Some(v) => v.as_i128(),
        None => parse_decimal(operand)? ,
    };
    let size = size.max(0) as usize;
    symbols.define_data(name, index, size, DataType::Space);
    memory.append(&vec![0u8; size]);
    Some(())
}

fn try_numeric_list(
    line: &str,
    marker: &str,
    width: usize,
    ty: DataType,
    index: usize,
    symbols: &mut SymbolTable,
    memory: &mut Memory,
) -> Option<()> {
    if !line.contains(marker) {
        return None;
    }
    let line = line.to_lowercase();
    let (name, rest) = line.split_once(marker)?;
    let mut bytes = Vec::new();
    for piece in rest.split(',') {
        let n = parse_decimal(piece)?;
        bytes.extend(encode_le(n, width));
    }
    symbols.define_data(name, index, bytes.len(), ty);
    memory.append(&bytes);
    Some(())
}

fn try_dword(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    try_numeric_list(line, ":.dword", 8, DataType::DWord, index, symbols, memory)
}

fn try_word(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    try_numeric_list(line, ":.word", 4, DataType::Word, index, symbols, memory)
}

fn try_hword(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    try_numeric_list(line, ":.hword", 2, DataType::HWord, index, symbols, memory)
}

fn try_byte(line: &str, index: usize, symbols: &mut SymbolTable, memory: &mut Memory) -> Option<()> {
    try_numeric_list(line, ":.byte", 1, DataType::Byte, index, symbols, memory)
}

/// `<len>=.-<name>`
fn try_length_reference(line: &str, symbols: &mut SymbolTable) -> Option<Result<(), Error>> {
    if !line.contains("=.-") {
        return None;
    }
    let line = line.to_lowercase();
    let (len_name, referenced) = line.split_once("=.-")?;
    let size = match symbols.size_of(referenced) {
        Some(s) => s as i128,
        None => {
            return Some(Err(Error::UnknownLengthReference {
                name: referenced.to_string(),
                line_number: 0,
                line: line.clone(),
            }));
        }
    };
    symbols.define_literal(len_name, size);
    Some(Ok(()))
}

/// `<name>=<value>`
fn try_assignment(line: &str, symbols: &mut SymbolTable) -> Option<()> {
    if !line.contains('=') {
        return None;
    }
    let line = line.to_lowercase();
    let (name, value) = line.split_once('=')?;
    let value = match symbols.get(value) {
        Some(v) => v.as_i128(),
        None => parse_decimal(value)?,
    };
    symbols.define_literal(name, value);
    Some(())
}

/// Tries every directive form in source order against one normalized
/// `.data`/`.bss` line. `line_number` is only used to stamp errors.
pub fn apply(
    line: &str,
    line_number: usize,
    symbols: &mut SymbolTable,
    memory: &mut Memory,
) -> Result<(), Error> {
    let index = memory.len();

    if try_asciz(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if try_space(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if try_dword(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if try_word(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if try_hword(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if try_byte(line, index, symbols, memory).is_some() {
        return Ok(());
    }
    if let Some(result) = try_length_reference(line, symbols) {
        return result.map_err(|e| match e {
            Error::UnknownLengthReference { name, line, .. } => {
                Error::UnknownLengthReference { name, line_number, line }
            }
            other => other,
        });
    }
    if try_assignment(line, symbols).is_some() {
        return Ok(());
    }

    Err(Error::MalformedDirective { line_number, line: line.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asciz_preserves_string_case_and_records_shadow_entries() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        apply("msg:.asciz \"Hi\\n\"", 1, &mut symbols, &mut memory).unwrap();
        assert_eq!(symbols.size_of("msg"), Some(3));
        assert_eq!(symbols.type_of("msg"), Some(DataType::Asciz));
        let addr = match symbols.get("msg").unwrap() {
            crate::symbols::SymbolValue::Address(a) => a,
            _ => panic!("expected address"),
        };
        assert_eq!(memory.peek(addr, 3).unwrap(), b"Hi\n");
    }

    #[test]
    fn space_with_symbolic_size_reads_existing_symbol() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        symbols.define_literal("n", 4);
        apply("buf:.space n", 1, &mut symbols, &mut memory).unwrap();
        assert_eq!(symbols.size_of("buf"), Some(4));
    }

    #[test]
    fn dword_round_trips_little_endian_values() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        apply("a:.dword 1,2,3", 1, &mut symbols, &mut memory).unwrap();
        assert_eq!(symbols.size_of("a"), Some(24));
        let addr = match symbols.get("a").unwrap() {
            crate::symbols::SymbolValue::Address(a) => a,
            _ => panic!("expected address"),
        };
        let third = memory.peek(addr + 16, 8).unwrap();
        assert_eq!(i64::from_le_bytes(third.try_into().unwrap()), 3);
    }

    #[test]
    fn length_reference_looks_up_shadow_size() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        apply("msg:.asciz \"hi\"", 1, &mut symbols, &mut memory).unwrap();
        apply("len=.-msg", 2, &mut symbols, &mut memory).unwrap();
        match symbols.get("len").unwrap() {
            crate::symbols::SymbolValue::Literal(v) => assert_eq!(v, 2),
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn length_reference_to_unknown_symbol_fails() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        let err = apply("len=.-missing", 2, &mut symbols, &mut memory).unwrap_err();
        assert!(matches!(err, Error::UnknownLengthReference { .. }));
    }

    #[test]
    fn assignment_resolves_through_existing_symbol() {
        let mut symbols = SymbolTable::new();
        let mut memory = Memory::new();
        symbols.define_literal("base", 10);
        apply("derived=base", 1, &mut symbols, &mut memory).unwrap();
        match symbols.get("derived").unwrap() {
            crate::symbols::SymbolValue::Literal(v) => assert_eq!(v, 10),
            other => panic!("expected literal, got {:?}", other),
        }
    }
}
