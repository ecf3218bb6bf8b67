//! The owning aggregate of all mutable simulator state
//!
//! `Machine` replaces the source's module-level globals (Design Notes,
//! "Global state"): memory, registers, flags, the symbol table, the
//! instruction stream, hazard counters, label-hit counts, linked labels
//! and checker policy all live here, constructed fresh by `new()` and
//! wiped by `reset()`. This is also the crate's public embedding surface
//! (§4.9): a debugger front-end or image-loader would drive a program
//! through exactly the methods below.

use std::collections::{HashMap, HashSet};

use crate::checker::{self, Rules};
use crate::decode;
use crate::error::Error;
use crate::hazard::HazardState;
use crate::memory::Memory;
use crate::parser;
use crate::registers::{Flags, Registers};
use crate::symbols::{DataType, SymbolTable, SymbolValue};

/// A host-provided routine bound to a `bl` target (§4.9, "Embedding
/// hook"). Runs synchronously on the same call stack as the driver loop
/// and may freely mutate `Machine` state.
pub type LinkedLabel = Box<dyn FnMut(&mut Machine) -> Result<(), Error>>;

/// A decoded view of one data-section symbol, the `getdata` helper of
/// Design Notes Open Question 1.
#[derive(Debug, Clone)]
pub enum DataView {
    Bytes(Vec<u8>),
    Dwords(Vec<i128>),
    Words(Vec<i128>),
    HWords(Vec<i128>),
}

pub struct Machine {
    pub(crate) registers: Registers,
    pub(crate) flags: Flags,
    pub(crate) memory: Memory,
    pub(crate) symbols: SymbolTable,
    pub(crate) instructions: Vec<String>,
    pub(crate) pc: usize,
    pub(crate) hazard: HazardState,
    pub(crate) label_hit_counts: HashMap<String, u64>,
    pub(crate) linked_labels: HashMap<String, LinkedLabel>,
    pub(crate) recursed_labels: HashSet<String>,
    rules: Rules,
    loaded: bool,
}

impl Machine {
    pub fn new() -> Machine {
        Machine {
            registers: Registers::new(),
            flags: Flags::new(),
            memory: Memory::new(),
            symbols: SymbolTable::new(),
            instructions: Vec::new(),
            pc: 0,
            hazard: HazardState::new(),
            label_hit_counts: HashMap::new(),
            linked_labels: HashMap::new(),
            recursed_labels: HashSet::new(),
            rules: Rules::new(),
            loaded: false,
        }
    }

    /// Reinitializes every piece of simulator state to empty/zero,
    /// exactly as the source's `reset()` does, including dropping
    /// linked-label registrations. Rule configuration is also cleared:
    /// the source resets its policy flags alongside everything else.
    pub fn reset(&mut self) {
        *self = Machine::new();
    }

    /// Parses `source` (the normalizer + directive parser + instruction
    /// parser of §4.1-4.3) and prepares the machine to run it. Does not
    /// run the static checker yet — that happens in `run()`/`step()`'s
    /// first call, so an embedder can still register linked labels or
    /// adjust `rules_mut()` between `load` and `run`.
    pub fn load(&mut self, source: &str) -> Result<(), Error> {
        let program = parser::parse(source)?;
        self.symbols = program.symbols;
        self.memory = program.memory;
        self.instructions = program.instructions;
        self.registers.set_sp(crate::memory::STACK_SIZE as i128 - 1);
        self.label_hit_counts.clear();
        for (i, line) in self.instructions.iter().enumerate() {
            if let Some(label) = line.strip_suffix(':') {
                self.label_hit_counts.entry(label.to_string()).or_insert(0);
            }
            let _ = i;
        }
        for label in self.linked_labels.keys() {
            self.label_hit_counts.entry(label.clone()).or_insert(0);
        }
        self.pc = 0;
        self.loaded = true;
        Ok(())
    }

    /// Runs the static checker (§4.7) then the driver loop (§4.8) to
    /// completion, then verifies the post-run recursion policy. Returns
    /// the low 64 bits of `x0` the way the source's caller reads the
    /// guest's return value.
    pub fn run(&mut self) -> Result<i64, Error> {
        checker::check_pre_run(self)?;
        while self.step()? {}
        checker::check_post_run(self)?;
        Ok(self.registers.get("x0") as i64)
    }

    /// Executes one instruction-stream entry (a label or a dispatched
    /// instruction) and advances `pc`. Returns `false` once `pc` has
    /// reached the end of the stream. Intended for the REPL and for a
    /// future debugger front-end (§4.9).
    pub fn step(&mut self) -> Result<bool, Error> {
        if self.pc >= self.instructions.len() {
            return Ok(false);
        }
        let line = self.instructions[self.pc].clone();
        if let Some(label) = line.strip_suffix(':') {
            if let Some(count) = self.label_hit_counts.get_mut(label) {
                *count += 1;
            }
            self.pc += 1;
            return Ok(self.pc < self.instructions.len());
        }

        let sp = self.registers.sp();
        if sp < 0 {
            return Err(Error::StackOverflow);
        }
        if sp > crate::memory::STACK_SIZE as i128 {
            return Err(Error::StackUnderflow);
        }
        if (sp + 1) % 16 != 0 {
            return Err(Error::StackMisaligned { sp });
        }

        decode::execute_line(self, &line)?;
        self.registers.reset_xzr();
        self.pc += 1;
        Ok(self.pc < self.instructions.len())
    }

    pub fn register(&self, name: &str) -> Option<i128> {
        if Registers::is_known(name) {
            Some(self.registers.get(name))
        } else {
            None
        }
    }

    pub fn set_register(&mut self, name: &str, value: i128) {
        self.registers.set(name, value);
    }

    pub fn flags(&self) -> (bool, bool) {
        (self.flags.n, self.flags.z)
    }

    pub fn peek(&self, addr: usize, len: usize) -> Result<&[u8], Error> {
        self.memory
            .peek(addr, len)
            .ok_or(Error::OutOfBoundsAccess { addr: addr as i128, width: len, line: String::new() })
    }

    pub fn poke(&mut self, addr: usize, data: &[u8]) -> Result<(), Error> {
        self.memory
            .poke(addr, data)
            .ok_or(Error::OutOfBoundsAccess { addr: addr as i128, width: data.len(), line: String::new() })
    }

    pub fn symbol(&self, name: &str) -> Option<SymbolValue> {
        self.symbols.get(&name.to_lowercase())
    }

    /// The `getdata` helper: decodes a data symbol's memory into a typed
    /// element list, honoring the reversed `Word`/`HWord` type codes of
    /// Design Notes Open Question 1.
    pub fn data(&self, name: &str) -> Result<DataView, Error> {
        let name = name.to_lowercase();
        let ty = self.symbols.type_of(&name).ok_or_else(|| Error::UndefinedSymbol {
            name: name.clone(),
            line_number: 0,
            line: String::new(),
        })?;
        let size = self.symbols.size_of(&name).unwrap_or(0);
        let addr = match self.symbols.get(&name) {
            Some(SymbolValue::Address(a)) => a,
            _ => {
                return Err(Error::UndefinedSymbol { name, line_number: 0, line: String::new() });
            }
        };
        let bytes = self.peek(addr, size)?;
        let width = ty.element_width();
        let decode_chunk = |chunk: &[u8]| -> i128 {
            let mut raw: u128 = 0;
            for (i, b) in chunk.iter().enumerate() {
                raw |= (*b as u128) << (8 * i);
            }
            raw as i128
        };
        Ok(match ty {
            DataType::Asciz | DataType::Space | DataType::Byte => DataView::Bytes(bytes.to_vec()),
            DataType::DWord => DataView::Dwords(bytes.chunks(width).map(decode_chunk).collect()),
            DataType::Word => DataView::Words(bytes.chunks(width).map(decode_chunk).collect()),
            DataType::HWord => DataView::HWords(bytes.chunks(width).map(decode_chunk).collect()),
        })
    }

    /// Registers a host callable for `<label>:`. During `bl`, a match
    /// here is dispatched instead of an in-stream jump (§4.9).
    pub fn link(&mut self, label: &str, f: LinkedLabel) {
        self.linked_labels.insert(label.to_lowercase(), f);
        self.label_hit_counts.entry(label.to_lowercase()).or_insert(0);
    }

    pub fn rules_mut(&mut self) -> &mut Rules {
        &mut self.rules
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn label_hit_count(&self, label: &str) -> u64 {
        self.label_hit_counts.get(&label.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn recursed_labels(&self) -> &HashSet<String> {
        &self.recursed_labels
    }

    pub fn cycle_count(&self) -> i64 {
        self.hazard.cycle
    }

    pub fn execute_count(&self) -> i64 {
        self.hazard.execute_count
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    /// The instruction-stream entry `step()` is about to execute, for a
    /// trace front-end. `None` once the program counter has run off the
    /// end of the stream.
    pub fn current_line(&self) -> Option<(usize, &str)> {
        self.instructions.get(self.pc).map(|line| (self.pc, line.as_str()))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

impl Default for Machine {
    fn default() -> Machine {
        Machine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(src: &str) -> Machine {
        let mut m = Machine::new();
        m.load(src).unwrap();
        m.run().unwrap();
        m
    }

    #[test]
    fn after_parse_break_and_sp_invariants_hold() {
        let mut m = Machine::new();
        m.load(".data\nmain:\nmov x0,0\n").unwrap();
        assert_eq!(m.memory.original_break(), m.memory.brk() as usize);
        assert_eq!(m.memory.original_break(), m.memory.len());
        assert_eq!(m.registers.sp(), crate::memory::STACK_SIZE as i128 - 1);
    }

    #[test]
    fn xzr_is_zero_after_every_instruction() {
        let mut m = Machine::new();
        m.load("main:\nmov xzr,5\nmov x0,1\n").unwrap();
        assert!(m.step().unwrap());
        assert_eq!(m.register("xzr"), Some(0));
        assert!(!m.step().unwrap());
        assert_eq!(m.register("xzr"), Some(0));
    }

    #[test]
    fn loop_sum_one_to_ten_returns_fifty_five() {
        let src = "\
main:
mov x0,0
mov x1,1
loop:
add x0,x0,x1
add x1,x1,1
cmp x1,10
b.le loop
mov x8,93
svc 0
";
        let m = run_source(src);
        assert_eq!(m.register("x0"), Some(55));
        assert_eq!(m.label_hit_count("loop"), 10);
    }

    #[test]
    fn reset_clears_every_observable() {
        let mut m = Machine::new();
        m.load("main:\nmov x0,5\n").unwrap();
        m.run().unwrap();
        m.reset();
        assert_eq!(m.register("x0"), Some(0));
        assert!(m.instructions().is_empty());
        assert_eq!(m.cycle_count(), 0);
        assert!(!m.is_loaded());
    }

    #[test]
    fn data_view_decodes_dword_elements() {
        let mut m = Machine::new();
        m.load(".data\na:.dword 1,2,3\nmain:\nmov x0,0\n").unwrap();
        match m.data("a").unwrap() {
            DataView::Dwords(values) => assert_eq!(values, vec![1, 2, 3]),
            other => panic!("expected dwords, got {:?}", other),
        }
    }

    #[test]
    fn linked_label_is_invoked_instead_of_in_stream_jump() {
        let mut m = Machine::new();
        m.load("main:\nbl greet\nmov x8,93\nsvc 0\n").unwrap();
        m.link(
            "greet",
            Box::new(|m: &mut Machine| {
                m.set_register("x9", 42);
                Ok(())
            }),
        );
        m.run().unwrap();
        assert_eq!(m.register("x9"), Some(42));
        assert_eq!(m.label_hit_count("greet"), 1);
    }
}
