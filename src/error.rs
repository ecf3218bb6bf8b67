//! The simulator's error taxonomy
//!
//! Every fallible operation in the crate returns `Result<_, Error>`. Each
//! variant carries enough context (a line, and where applicable the
//! offending token within it) to render a one-line diagnostic with a
//! caret underline, the same `TokenSpan`-and-`underline_spans` pattern the
//! teacher's `assembler::Error` uses.

use std::fmt;

use colored::Colorize;

/// A span of text within a source or instruction line, used to underline
/// the offending token in a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    start: usize,
    end: usize,
}

impl TokenSpan {
    pub fn new(start: usize, end: usize) -> TokenSpan {
        TokenSpan { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }
}

/// Finds `needle` as a token inside `line` and returns its span, if
/// present. Errors are constructed with only the owning name/mnemonic, not
/// a byte offset, so the span is recovered at render time instead of
/// plumbed through every call site.
fn span_of(line: &str, needle: &str) -> Option<TokenSpan> {
    if needle.is_empty() {
        return None;
    }
    line.find(needle).map(|start| TokenSpan::new(start, start + needle.len()))
}

/// All errors the simulator can raise, grouped by the taxonomy buckets of
/// the error-handling design: parse, static-rule, decode, runtime, and
/// post-run policy errors.
#[derive(Debug)]
pub enum Error {
    // --- parse errors ---
    /// `=.-` referenced a variable that was never declared
    UnknownLengthReference { name: String, line_number: usize, line: String },
    /// A `.data`/`.bss` line did not match any recognized directive form
    MalformedDirective { line_number: usize, line: String },
    /// A referenced variable or number could not be parsed
    UndefinedSymbol { name: String, line_number: usize, line: String },

    // --- static-rule violations ---
    NoCodeDetected,
    ForbiddenInstruction { mnemonic: String },
    DuplicateLabel { label: String },
    UnknownBranchTarget { label: String, line: String },
    LoopDetected { line: String },
    DeadCodeDetected { line: String },

    // --- decode errors ---
    UnsupportedInstruction { line: String },
    UnexpectedRegisterOperand { mnemonic: String, line: String },
    InvalidOperand { reason: String, line: String },

    // --- runtime errors ---
    OutOfBoundsAccess { addr: i128, width: usize, line: String },
    StackOverflow,
    StackUnderflow,
    StackMisaligned { sp: i128 },
    NonStdoutWrite { fd: i128 },
    UnsupportedSyscall { number: i128 },
    ReturnTargetOutOfRange { addr: i128 },
    HeapCapExceeded { requested: i128 },

    // --- post-run policy errors ---
    RecursionForbidden,
    RecursionRequired,
    MissingRequiredRecursion { missing: Vec<String> },

    // --- I/O, embedding ---
    ReadFailed { path: String },
}

impl std::error::Error for Error {}

fn underline_spans(line: &str, spans: Vec<TokenSpan>) -> String {
    let mut marks = vec![' '; line.chars().count()];
    for span in spans {
        for i in span.start()..span.end() {
            if i < marks.len() {
                marks[i] = '^';
            }
        }
    }
    marks.into_iter().collect()
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        let (message, line, line_number, spans): (String, Option<&str>, Option<usize>, Vec<TokenSpan>) = match self {
            UnknownLengthReference { name, line_number, line } => (
                format!("can't find length of undeclared variable \"{}\" at line {}", name, line_number),
                Some(line.as_str()), Some(*line_number), span_of(line, name).into_iter().collect(),
            ),
            MalformedDirective { line_number, line } => (
                format!("malformed directive at line {}", line_number),
                Some(line.as_str()), Some(*line_number), vec![],
            ),
            UndefinedSymbol { name, line_number, line } => (
                format!("undefined symbol \"{}\" at line {}", name, line_number),
                Some(line.as_str()), Some(*line_number), span_of(line, name).into_iter().collect(),
            ),
            NoCodeDetected => (
                "no code detected (remember to include a _start: or main: label)".to_string(),
                None, None, vec![],
            ),
            ForbiddenInstruction { mnemonic } => (
                format!("use of \"{}\" disallowed by the configured rules", mnemonic),
                None, None, vec![],
            ),
            DuplicateLabel { label } => (
                format!("label \"{}\" declared more than once", label),
                None, None, vec![],
            ),
            UnknownBranchTarget { label, line } => (
                format!("\"{}\" is calling a nonexistent label", label),
                Some(line.as_str()), None, span_of(line, label).into_iter().collect(),
            ),
            LoopDetected { line } => (
                "loop detected but loops are forbidden".to_string(),
                Some(line.as_str()), None, vec![],
            ),
            DeadCodeDetected { line } => (
                "dead code detected after this instruction".to_string(),
                Some(line.as_str()), None, vec![],
            ),
            UnsupportedInstruction { line } => (
                "unsupported instruction or syntax error".to_string(),
                Some(line.as_str()), None, vec![],
            ),
            UnexpectedRegisterOperand { mnemonic, line } => (
                format!("{} takes no registers", mnemonic),
                Some(line.as_str()), None, span_of(line, mnemonic).into_iter().collect(),
            ),
            InvalidOperand { reason, line } => (
                format!("invalid operand ({})", reason),
                Some(line.as_str()), None, vec![],
            ),
            OutOfBoundsAccess { addr, width, line } => (
                format!("out of bounds memory access at {} (width {})", addr, width),
                Some(line.as_str()), None, vec![],
            ),
            StackOverflow => ("stack overflow".to_string(), None, None, vec![]),
            StackUnderflow => ("stack underflow (make sure to allocate space)".to_string(), None, None, vec![]),
            StackMisaligned { sp } => (
                format!("alignment error: sp ({}) must be a multiple of 16 minus one", sp),
                None, None, vec![],
            ),
            NonStdoutWrite { fd } => (
                format!("can only write to stdout! (x0 was {}, must be 1)", fd),
                None, None, vec![],
            ),
            UnsupportedSyscall { number } => {
                (format!("unsupported system call: {}", number), None, None, vec![])
            }
            ReturnTargetOutOfRange { addr } => {
                (format!("br: address in lr ({}) out of range", addr), None, None, vec![])
            }
            HeapCapExceeded { requested } => {
                (format!("break size of {} too large", requested), None, None, vec![])
            }
            RecursionForbidden => {
                ("recursion occurred in program but it should not have".to_string(), None, None, vec![])
            }
            RecursionRequired => {
                ("recursion did not occur in program but it should have".to_string(), None, None, vec![])
            }
            MissingRequiredRecursion { missing } => (
                format!("recursive calls do not include required call(s) to {:?}", missing),
                None, None, vec![],
            ),
            ReadFailed { path } => (format!("failed to read file {}", path), None, None, vec![]),
        };

        writeln!(f, "{}", message)?;
        if let (Some(line), Some(line_number)) = (line, line_number) {
            write!(f, "{}\t{}", line_number, line)?;
        } else if let Some(line) = line {
            write!(f, "\t{}", line)?;
        }
        if let Some(line) = line {
            if !spans.is_empty() {
                writeln!(f)?;
                write!(f, "\t{}", underline_spans(line, spans).green())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Strips `colored`'s ANSI escapes so assertions don't depend on
    /// whether the test process's stdout looks like a terminal.
    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\u{1b}' {
                for esc in chars.by_ref() {
                    if esc == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn undefined_symbol_underlines_the_offending_name() {
        let err = Error::UndefinedSymbol {
            name: "missing".to_string(),
            line_number: 4,
            line: "ldur x0,=missing".to_string(),
        };
        let rendered = strip_ansi(&format!("{}", err));
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("undefined symbol \"missing\" at line 4"));
        assert_eq!(lines.next(), Some("4\tldur x0,=missing"));
        assert_eq!(lines.next(), Some("\t         ^^^^^^^"));
    }

    #[test]
    fn errors_without_a_source_line_render_message_only() {
        let rendered = format!("{}", Error::StackOverflow);
        assert_eq!(rendered, "stack overflow\n");
    }
}
