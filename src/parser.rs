//! The two-pass front end: turns source text into a symbol table, a byte
//! memory image, and an ordered instruction stream
//!
//! This ties together the lexical normalizer (§4.1) and the directive
//! parser (§4.2): both need to walk the source exactly once with shared
//! comment/section state, so unlike [`crate::decode`]'s per-instruction
//! dispatch, they are not split into fully independent passes.

use crate::directives;
use crate::error::Error;
use crate::lexer::{self, CommentTransition, SectionMode};
use crate::memory::Memory;
use crate::symbols::SymbolTable;

/// The output of parsing: a populated memory image, symbol table, and
/// instruction stream, ready for the static checker and driver loop.
pub struct Program {
    pub symbols: SymbolTable,
    pub memory: Memory,
    pub instructions: Vec<String>,
}

/// Parses `source` into a [`Program`]. Mirrors `armsim.py::parse`.
pub fn parse(source: &str) -> Result<Program, Error> {
    let mut symbols = SymbolTable::new();
    let mut memory = Memory::new();
    let mut instructions = Vec::new();

    let mut in_block_comment = false;
    let mut section = SectionMode::None;

    for (line_number, raw_line) in source.lines().enumerate() {
        let line_number = line_number + 1;
        let line = lexer::collapse_whitespace(raw_line);

        if in_block_comment {
            if classify_comment_closes(&line) {
                in_block_comment = false;
            }
            continue;
        }

        match lexer::classify_comment(&line) {
            CommentTransition::Inline => continue,
            CommentTransition::Opens => {
                in_block_comment = true;
                continue;
            }
            CommentTransition::Closes => continue,
            CommentTransition::None => {}
        }

        if let Some(mode) = lexer::section_switch(&line) {
            section = mode;
            continue;
        }

        match section {
            SectionMode::Code => {
                if !line.is_empty() {
                    instructions.push(line.to_lowercase());
                }
            }
            SectionMode::Data | SectionMode::Bss => {
                let normalized = lexer::normalize_directive_punctuation(&line);
                directives::apply(&normalized, line_number, &mut symbols, &mut memory)?;
            }
            SectionMode::None => {}
        }
    }

    memory.finish_static();
    debug_assert_eq!(memory.brk() as usize, memory.len());

    Ok(Program { symbols, memory, instructions })
}

fn classify_comment_closes(line: &str) -> bool {
    matches!(lexer::classify_comment(line), CommentTransition::Closes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_code_sections() {
        let source = "\
.data
msg:.asciz \"hi\\n\"
.bss
buf:.space 8
main:
mov x0,1
ldur x1,=msg
";
        let program = parse(source).unwrap();
        assert_eq!(program.instructions, vec!["mov x0,1", "ldur x1,=msg"]);
        assert!(program.symbols.contains("msg"));
        assert!(program.symbols.contains("buf"));
        assert_eq!(program.memory.original_break(), program.memory.len());
    }

    #[test]
    fn skips_line_and_block_comments() {
        // A line containing `//` anywhere is dropped in its entirety,
        // including any code that precedes the comment marker — this
        // matches the source's `if ('//' in line): continue`.
        let source = "\
main:
// a comment
mov x0,1 // trailing
/* block
spans lines */
mov x1,2
";
        let program = parse(source).unwrap();
        assert_eq!(program.instructions, vec!["mov x1,2"]);
    }

    #[test]
    fn labels_are_preserved_lowercased_in_the_instruction_stream() {
        let source = "main:\nLOOP:\nmov x0,1\nb LOOP\n";
        let program = parse(source).unwrap();
        assert_eq!(program.instructions, vec!["loop:", "mov x0,1", "b loop"]);
    }

    #[test]
    fn malformed_directive_is_a_parse_error() {
        let source = ".data\nnonsense here\nmain:\nmov x0,1\n";
        let err = parse(source).unwrap_err();
        assert!(matches!(err, Error::MalformedDirective { .. }));
    }
}
