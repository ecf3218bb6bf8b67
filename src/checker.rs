//! The static rule checker (§4.7)
//!
//! `Rules` is the embedder-configured policy (forbidden mnemonics,
//! loop/dead-code/recursion requirements) the source exposed as a set of
//! pre-`run()` global flags; here it is a plain struct set through
//! `Machine::rules_mut()` before `run()` (§2.1, "Configuration").
//! `check_pre_run` mirrors the source's checks performed before the
//! driver loop starts; `check_post_run` mirrors the recursion-policy
//! check performed after it finishes.

use std::collections::HashSet;

use crate::error::Error;
use crate::machine::Machine;

#[derive(Debug, Clone, Default)]
pub struct Rules {
    forbidden_mnemonics: HashSet<String>,
    pub forbid_loops: bool,
    pub check_dead_code: bool,
    pub forbid_recursion: bool,
    pub require_recursion: bool,
    pub recursive_labels: HashSet<String>,
}

impl Rules {
    pub fn new() -> Rules {
        Rules::default()
    }

    pub fn forbid(&mut self, mnemonic: &str) -> &mut Rules {
        self.forbidden_mnemonics.insert(mnemonic.to_lowercase());
        self
    }

    pub fn is_forbidden(&self, mnemonic: &str) -> bool {
        self.forbidden_mnemonics.contains(mnemonic)
    }
}

fn mnemonic_of(line: &str) -> &str {
    line.split(' ').next().unwrap_or(line)
}

fn is_label_line(line: &str) -> bool {
    line.ends_with(':')
}

fn branch_target(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("cbz ").or_else(|| line.strip_prefix("cbnz ")) {
        return rest.split(',').nth(1);
    }
    if line.starts_with("b ")
        || line.starts_with("b.")
        || line.starts_with("blt ")
        || line.starts_with("ble ")
        || line.starts_with("bgt ")
        || line.starts_with("bge ")
        || line.starts_with("beq ")
        || line.starts_with("bne ")
        || line.starts_with("bmi ")
        || line.starts_with("bpl ")
        || line.starts_with("bl ")
    {
        return line.split(' ').nth(1);
    }
    None
}

fn is_branch_like(line: &str) -> bool {
    branch_target(line).is_some()
}

/// Checks 1-6 of §4.7, run before the driver loop starts.
pub fn check_pre_run(m: &Machine) -> Result<(), Error> {
    if m.instructions.is_empty() {
        return Err(Error::NoCodeDetected);
    }

    let mut seen_labels: HashSet<String> = HashSet::new();
    for line in &m.instructions {
        if is_label_line(line) {
            let label = line.trim_end_matches(':').to_string();
            if !seen_labels.insert(label.clone()) {
                return Err(Error::DuplicateLabel { label });
            }
        } else {
            let mnemonic = mnemonic_of(line);
            if m.rules().is_forbidden(mnemonic) {
                return Err(Error::ForbiddenInstruction { mnemonic: mnemonic.to_string() });
            }
        }
    }

    for (index, line) in m.instructions.iter().enumerate() {
        if let Some(target) = branch_target(line) {
            let known = seen_labels.contains(target) || m.linked_labels.contains_key(target);
            if !known {
                return Err(Error::UnknownBranchTarget { label: target.to_string(), line: line.clone() });
            }
            if m.rules().forbid_loops {
                if let Some(target_index) = m.instructions.iter().position(|l| l == &format!("{target}:")) {
                    if target_index <= index {
                        return Err(Error::LoopDetected { line: line.clone() });
                    }
                }
            }
        }
    }

    if m.rules().check_dead_code {
        for (index, line) in m.instructions.iter().enumerate() {
            let is_unconditional_end = (line.starts_with("b ") && is_branch_like(line)) || line == "br lr";
            if is_unconditional_end {
                let is_last = index + 1 == m.instructions.len();
                let followed_by_label = m.instructions.get(index + 1).map(|l| is_label_line(l)).unwrap_or(false);
                if !is_last && !followed_by_label {
                    return Err(Error::DeadCodeDetected { line: line.clone() });
                }
            }
        }
    }

    Ok(())
}

/// Checks the recursion policy (§4.7) after the driver loop has finished.
pub fn check_post_run(m: &Machine) -> Result<(), Error> {
    let rules = m.rules();
    if rules.forbid_recursion && !m.recursed_labels.is_empty() {
        return Err(Error::RecursionForbidden);
    }
    if rules.require_recursion && m.recursed_labels.is_empty() {
        return Err(Error::RecursionRequired);
    }
    if !rules.recursive_labels.is_empty() {
        let missing: Vec<String> =
            rules.recursive_labels.difference(&m.recursed_labels).cloned().collect();
        if !missing.is_empty() {
            return Err(Error::MissingRequiredRecursion { missing });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instruction_stream_fails() {
        let m = Machine::new();
        assert!(matches!(check_pre_run(&m), Err(Error::NoCodeDetected)));
    }

    #[test]
    fn forbidden_mnemonic_is_rejected() {
        let mut m = Machine::new();
        m.load("main:\nmul x0,x1,x2\nmov x8,93\nsvc 0\n").unwrap();
        m.rules_mut().forbid("mul");
        assert!(matches!(check_pre_run(&m), Err(Error::ForbiddenInstruction { .. })));
    }

    #[test]
    fn forbidding_a_dotted_conditional_does_not_touch_the_bare_mnemonic() {
        let mut m = Machine::new();
        m.load("main:\ncmp x0,1\nb.eq done\nmov x1,1\ndone:\nmov x8,93\nsvc 0\n").unwrap();
        m.rules_mut().forbid("b.eq");
        assert!(matches!(check_pre_run(&m), Err(Error::ForbiddenInstruction { .. })));

        let mut m2 = Machine::new();
        m2.load("main:\nb done\ndone:\nmov x8,93\nsvc 0\n").unwrap();
        m2.rules_mut().forbid("b.eq");
        assert!(check_pre_run(&m2).is_ok());
    }

    #[test]
    fn forbidding_the_bare_mnemonic_does_not_touch_its_dotted_conditionals() {
        let mut m = Machine::new();
        m.load("main:\ncmp x0,1\nb.eq done\nmov x1,1\ndone:\nmov x8,93\nsvc 0\n").unwrap();
        m.rules_mut().forbid("b");
        assert!(check_pre_run(&m).is_ok());

        let mut m2 = Machine::new();
        m2.load("main:\nb done\ndone:\nmov x8,93\nsvc 0\n").unwrap();
        m2.rules_mut().forbid("b");
        assert!(matches!(check_pre_run(&m2), Err(Error::ForbiddenInstruction { .. })));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut m = Machine::new();
        m.load("main:\nloop:\nmov x0,1\nloop:\nmov x0,2\n").unwrap();
        assert!(matches!(check_pre_run(&m), Err(Error::DuplicateLabel { .. })));
    }

    #[test]
    fn branch_to_unknown_label_is_rejected() {
        let mut m = Machine::new();
        m.load("main:\nb nowhere\n").unwrap();
        assert!(matches!(check_pre_run(&m), Err(Error::UnknownBranchTarget { .. })));
    }

    #[test]
    fn forbid_loops_rejects_backward_branch() {
        let mut m = Machine::new();
        m.load("main:\nloop:\nmov x0,1\nb loop\n").unwrap();
        m.rules_mut().forbid_loops = true;
        assert!(matches!(check_pre_run(&m), Err(Error::LoopDetected { .. })));
    }

    #[test]
    fn dead_code_rule_requires_label_after_unconditional_branch() {
        let mut m = Machine::new();
        m.load("main:\nb done\nmov x0,1\ndone:\nmov x8,93\nsvc 0\n").unwrap();
        m.rules_mut().check_dead_code = true;
        assert!(matches!(check_pre_run(&m), Err(Error::DeadCodeDetected { .. })));
    }

    #[test]
    fn recursion_forbidden_fails_after_a_recursive_run() {
        let src = "\
main:
mov x0,3
bl fact
mov x8,93
svc 0
fact:
cmp x0,1
b.le fact_base
sub x0,x0,1
bl fact
fact_base:
br lr
";
        let mut m = Machine::new();
        m.load(src).unwrap();
        m.rules_mut().forbid_recursion = true;
        let err = m.run().unwrap_err();
        assert!(matches!(err, Error::RecursionForbidden));
    }
}
