//! Whole-program scenarios driven entirely through the public `Machine`
//! API, the way an embedder (not the CLI) would use the crate.

use armsim::checker::Rules;
use armsim::machine::{DataView, Machine};
use armsim::Error;

#[test]
fn hello_world_write_then_exit() {
    let src = "\
.data
msg:.asciz \"hi\\n\"
main:
mov x0,1
ldur x1,=msg
mov x2,3
mov x8,64
svc 0
mov x0,0
mov x8,93
svc 0
";
    let mut m = Machine::new();
    m.load(src).unwrap();

    // Read the exact bytes the write syscall will hand to stdout, without
    // needing to capture the process's real stdout.
    let addr = match m.symbol("msg").unwrap() {
        armsim::symbols::SymbolValue::Address(a) => a,
        other => panic!("expected an address, got {:?}", other),
    };
    assert_eq!(m.peek(addr, 3).unwrap(), b"hi\n");

    let rc = m.run().unwrap();
    assert_eq!(rc, 0);
    assert_eq!(m.execute_count(), 8);
}

#[test]
fn data_literal_length_reference_is_readable_as_a_return_code() {
    let src = "\
.data
msg:.asciz \"hi\"
len=.-msg
main:
ldur x0,=len
mov x8,93
svc 0
";
    let mut m = Machine::new();
    m.load(src).unwrap();
    let rc = m.run().unwrap();
    assert_eq!(rc, 2);
}

#[test]
fn loop_sums_one_through_ten() {
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
    let mut m = Machine::new();
    m.load(src).unwrap();
    let rc = m.run().unwrap();
    assert_eq!(rc, 55);
    assert_eq!(m.label_hit_count("loop"), 10);
}

/// `bl` only saves the return address into `lr` (no automatic stack push),
/// so a recursive routine has to save/restore `lr` and any other live
/// register itself around the nested call.
const RECURSIVE_FACTORIAL: &str = "\
main:
mov x0,5
bl fact
mov x8,93
svc 0
fact:
cmp x0,1
b.le fact_base
sub sp,sp,16
stur lr,[sp]
stur x0,[sp,8]
sub x0,x0,1
bl fact
ldur x1,[sp,8]
ldur lr,[sp]
add sp,sp,16
mul x0,x0,x1
br lr
fact_base:
mov x0,1
br lr
";

#[test]
fn recursive_factorial_of_five_is_120() {
    let mut m = Machine::new();
    m.load(RECURSIVE_FACTORIAL).unwrap();
    let rc = m.run().unwrap();
    assert_eq!(rc, 120);
    assert!(m.recursed_labels().contains("fact"));
}

#[test]
fn forbid_recursion_rejects_the_same_program_after_it_runs() {
    let mut m = Machine::new();
    m.load(RECURSIVE_FACTORIAL).unwrap();
    m.rules_mut().forbid_recursion = true;
    let err = m.run().unwrap_err();
    assert!(matches!(err, Error::RecursionForbidden));
}

#[test]
fn indexed_dword_array_load_reads_the_third_element() {
    let src = "\
.data
arr:.dword 10,20,30
main:
ldur x0,=arr
ldur x0,[x0,16]
mov x8,93
svc 0
";
    let mut m = Machine::new();
    m.load(src).unwrap();
    let rc = m.run().unwrap();
    assert_eq!(rc, 30);
    match m.data("arr").unwrap() {
        DataView::Dwords(values) => assert_eq!(values, vec![10, 20, 30]),
        other => panic!("expected dwords, got {:?}", other),
    }
}

#[test]
fn brk_syscall_round_trip_through_a_running_program() {
    // No `.data`/`.bss` here, so the original break is exactly the stack
    // region's size; requesting one byte past it should grow by a page.
    let original = armsim::memory::STACK_SIZE as i128;
    let src = format!("main:\nmov x0,{}\nmov x8,214\nsvc 0\nmov x8,93\nsvc 0\n", original + 1);
    let mut m = Machine::new();
    m.load(&src).unwrap();
    let rc = m.run().unwrap();
    assert_eq!(rc as i128, original + armsim::memory::PAGE_SIZE as i128);
}

#[test]
fn require_recursion_rejects_a_program_that_never_recurses() {
    let src = "\
main:
mov x0,1
mov x8,93
svc 0
";
    let mut m = Machine::new();
    m.load(src).unwrap();
    m.rules_mut().require_recursion = true;
    let err = m.run().unwrap_err();
    assert!(matches!(err, Error::RecursionRequired));
}

#[test]
fn linked_label_runs_instead_of_jumping_into_the_instruction_stream() {
    let mut m = Machine::new();
    m.load("main:\nmov x0,1\nbl greet\nmov x8,93\nsvc 0\n").unwrap();
    m.link(
        "greet",
        Box::new(|m: &mut Machine| {
            let x0 = m.register("x0").unwrap();
            m.set_register("x0", x0 + 41);
            Ok(())
        }),
    );
    let rc = m.run().unwrap();
    assert_eq!(rc, 42);
    assert_eq!(m.label_hit_count("greet"), 1);
}

#[test]
fn reset_returns_the_machine_to_a_fresh_unloaded_state() {
    let mut m = Machine::new();
    m.load("main:\nmov x0,7\nmov x8,93\nsvc 0\n").unwrap();
    m.run().unwrap();
    m.reset();
    assert!(!m.is_loaded());
    assert_eq!(m.register("x0"), Some(0));
    assert_eq!(m.cycle_count(), 0);

    // the reset machine is immediately reusable for a different program.
    let mut rules = Rules::new();
    rules.forbid("mul");
    *m.rules_mut() = rules;
    m.load("main:\nmul x0,x0,x0\nmov x8,93\nsvc 0\n").unwrap();
    let err = m.run().unwrap_err();
    assert!(matches!(err, Error::ForbiddenInstruction { .. }));
}
