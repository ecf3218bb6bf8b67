//! Pure line-level text transforms used by the two-pass front end
//!
//! These are the stateless building blocks of the normalizer (§4.1); the
//! sequential comment/section state machine that drives them lives in
//! [`crate::parser`], since it has to thread an address counter through
//! the directive parser at the same time.

use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static SPACE_BEFORE_COLON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ ]*:").unwrap());
static SPACE_BEFORE_DOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ ]*\.").unwrap());
static SPACE_AROUND_DASH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ ]*-[ ]*").unwrap());
static SPACE_AROUND_EQUALS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ ]*=[ ]*").unwrap());
static SPACE_AROUND_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ ]*,[ ]*").unwrap());

/// Trims the line and collapses runs of spaces/tabs to a single space.
pub fn collapse_whitespace(line: &str) -> String {
    WHITESPACE_RUN.replace_all(line.trim(), " ").into_owned()
}

/// Removes whitespace adjacent to `:`, `.`, `-`, `=` so that directive
/// lines like `len = . - name` normalize to `len=.-name` while leaving
/// the interior of string literals alone (callers only apply this to
/// lines that are not `.asciz`/a comment).
pub fn normalize_directive_punctuation(line: &str) -> String {
    let line = SPACE_BEFORE_COLON.replace_all(line, ":");
    let line = SPACE_BEFORE_DOT.replace_all(&line, ".");
    let line = SPACE_AROUND_DASH.replace_all(&line, "-");
    SPACE_AROUND_EQUALS.replace_all(&line, "=").into_owned()
}

/// Removes whitespace around commas and strips `#` immediate markers,
/// applied to each instruction line immediately before dispatch.
pub fn normalize_instruction_operands(line: &str) -> String {
    let line = SPACE_AROUND_COMMA.replace_all(line, ",");
    line.replace('#', "")
}

/// A comment spans both inline forms (`//`, a same-line `/* ... */`) and
/// a multi-line `/* ... */` block tracked by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentTransition {
    /// Line is a self-contained comment (or carries a line comment) and
    /// should be skipped entirely; block-comment state is unaffected.
    Inline,
    /// Line opens a block comment; itself skipped, subsequent lines are
    /// skipped until a line closes it.
    Opens,
    /// Line closes an open block comment; itself skipped.
    Closes,
    /// Not a comment boundary.
    None,
}

pub fn classify_comment(line: &str) -> CommentTransition {
    if line.contains("/*") && line.contains("*/") {
        CommentTransition::Inline
    } else if line.contains("//") {
        CommentTransition::Inline
    } else if line.contains("/*") {
        CommentTransition::Opens
    } else if line.contains("*/") {
        CommentTransition::Closes
    } else {
        CommentTransition::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionMode {
    None,
    Data,
    Bss,
    Code,
}

/// Detects a section-switching directive on this line, if any. Matches
/// anywhere in the line, as the source does (`"main:" in line`).
pub fn section_switch(line: &str) -> Option<SectionMode> {
    if line.contains(".data") {
        Some(SectionMode::Data)
    } else if line.contains(".bss") {
        Some(SectionMode::Bss)
    } else if line.contains("main:") || line.contains("_start:") {
        Some(SectionMode::Code)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_internal_runs_and_trims_ends() {
        assert_eq!(collapse_whitespace("  mov   x0,   1  "), "mov x0, 1");
    }

    #[test]
    fn punctuation_normalize_removes_space_around_separators() {
        assert_eq!(normalize_directive_punctuation("len = . - name"), "len=.-name");
        assert_eq!(normalize_directive_punctuation("a : .dword 1 , 2"), "a:.dword 1 , 2");
    }

    #[test]
    fn operand_normalize_strips_comma_space_and_hash() {
        assert_eq!(normalize_instruction_operands("add x0, x1, #1"), "add x0,x1,1");
    }

    #[test]
    fn classifies_comment_forms() {
        assert_eq!(classify_comment("// a line comment"), CommentTransition::Inline);
        assert_eq!(classify_comment("/* both */"), CommentTransition::Inline);
        assert_eq!(classify_comment("/* opens"), CommentTransition::Opens);
        assert_eq!(classify_comment("closes */"), CommentTransition::Closes);
        assert_eq!(classify_comment("mov x0,1"), CommentTransition::None);
    }

    #[test]
    fn section_switch_detects_data_bss_and_code_entry() {
        assert_eq!(section_switch(".data"), Some(SectionMode::Data));
        assert_eq!(section_switch(".bss"), Some(SectionMode::Bss));
        assert_eq!(section_switch("main:"), Some(SectionMode::Code));
        assert_eq!(section_switch("_start:"), Some(SectionMode::Code));
        assert_eq!(section_switch("mov x0,1"), None);
    }
}
