//! The symbol table: label/variable addresses, literal constants, and the
//! `_SIZE_`/`_TYPE_` shadow entries recorded for every data declaration.

use std::collections::HashMap;

/// Directive type tags, preserved exactly as the source numbers them.
///
/// `Word` and `HWord` are deliberately out of size order (`Word = 3` is
/// 4 bytes, `HWord = 4` is 2 bytes) — see Design Notes, Open Question 1.
/// `getdata`'s consumers rely on this exact mapping, so it is kept as-is
/// rather than renumbered to match byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Asciz = 0,
    DWord = 1,
    Space = 2,
    Word = 3,
    HWord = 4,
    Byte = 5,
}

impl DataType {
    pub fn element_width(self) -> usize {
        match self {
            DataType::Asciz | DataType::Space | DataType::Byte => 1,
            DataType::DWord => 8,
            DataType::Word => 4,
            DataType::HWord => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SymbolValue {
    /// An address into memory (labels, data-section variables).
    Address(usize),
    /// A bare integer literal assigned with `name=value`.
    Literal(i128),
}

impl SymbolValue {
    pub fn as_i128(self) -> i128 {
        match self {
            SymbolValue::Address(a) => a as i128,
            SymbolValue::Literal(v) => v,
        }
    }
}

pub struct SymbolTable {
    entries: HashMap<String, SymbolValue>,
    types: HashMap<String, DataType>,
    sizes: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            entries: HashMap::new(),
            types: HashMap::new(),
            sizes: HashMap::new(),
        }
    }

    pub fn define_address(&mut self, name: &str, addr: usize) {
        self.entries.insert(name.to_string(), SymbolValue::Address(addr));
    }

    pub fn define_literal(&mut self, name: &str, value: i128) {
        self.entries.insert(name.to_string(), SymbolValue::Literal(value));
    }

    pub fn define_data(&mut self, name: &str, addr: usize, size: usize, ty: DataType) {
        self.define_address(name, addr);
        self.sizes.insert(name.to_string(), size);
        self.types.insert(name.to_string(), ty);
    }

    pub fn get(&self, name: &str) -> Option<SymbolValue> {
        self.entries.get(name).copied()
    }

    pub fn size_of(&self, name: &str) -> Option<usize> {
        self.sizes.get(name).copied()
    }

    pub fn type_of(&self, name: &str) -> Option<DataType> {
        self.types.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.types.clear();
        self.sizes.clear();
    }
}

impl Default for SymbolTable {
    fn default() -> SymbolTable {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_declaration_records_shadow_size_and_type() {
        let mut table = SymbolTable::new();
        table.define_data("arr", 4096, 24, DataType::DWord);
        assert_eq!(table.size_of("arr"), Some(24));
        assert_eq!(table.type_of("arr"), Some(DataType::DWord));
        match table.get("arr") {
            Some(SymbolValue::Address(a)) => assert_eq!(a, 4096),
            other => panic!("expected address, got {:?}", other),
        }
    }

    #[test]
    fn word_and_hword_type_codes_are_the_historical_inversion() {
        assert_eq!(DataType::Word as i32, 3);
        assert_eq!(DataType::HWord as i32, 4);
        assert_eq!(DataType::Word.element_width(), 4);
        assert_eq!(DataType::HWord.element_width(), 2);
    }
}
