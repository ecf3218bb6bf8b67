use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use armsim::logging;
use armsim::machine::Machine;
use armsim::registers::{GENERAL_PURPOSE_NAMES, SPECIAL_NAMES};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let trace = args.iter().any(|a| a == "-v" || a == "--trace");
    let path = args.iter().find(|a| !a.starts_with('-'));

    match path {
        Some(path) => run_file(path, trace),
        None => {
            repl();
            ExitCode::SUCCESS
        }
    }
}

fn run_file(path: &str, trace: bool) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            logging::error(format!("failed to read file {}", path));
            return ExitCode::from(1);
        }
    };

    let mut m = Machine::new();
    if let Err(e) = m.load(&source) {
        logging::error(e.to_string());
        return ExitCode::from(1);
    }

    let result = if trace {
        run_traced(&mut m)
    } else {
        m.run().map(|_| ())
    };
    if let Err(e) = result {
        logging::error(e.to_string());
        return ExitCode::from(1);
    }

    println!("Total Cycles: {}", m.cycle_count());
    println!("Executed Instructions: {}", m.execute_count());

    let x0 = m.register("x0").unwrap_or(0);
    ExitCode::from((x0 & 0xff) as u8)
}

/// Steps the machine to completion, printing the program counter and
/// decoded line to stderr before each instruction (`-v`/`--trace`).
fn run_traced(m: &mut Machine) -> Result<(), armsim::Error> {
    while let Some((pc, line)) = m.current_line() {
        eprintln!("{:>4}  {}", pc, line);
        if !m.step()? {
            break;
        }
    }
    Ok(())
}

/// Single-instruction REPL (§6, "CLI"): each line is run through the
/// decoder directly rather than through a loaded instruction stream, so
/// memory and branch instructions (which need an address space and an
/// instruction stream to target) are rejected before dispatch.
fn repl() {
    let mut m = Machine::new();
    m.set_register("sp", armsim::memory::STACK_SIZE as i128 - 1);
    let stdin = io::stdin();

    print!("> ");
    let _ = io::stdout().flush();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line == "q" {
            break;
        }
        if !line.is_empty() {
            match run_repl_line(&mut m, line) {
                Ok(changed) => print_changes(&m, &changed),
                Err(e) => logging::error(e.to_string()),
            }
        }
        print!("> ");
        let _ = io::stdout().flush();
    }
}

const REPL_FORBIDDEN_PREFIXES: &[&str] = &[
    "ldur", "stur", "b ", "b.", "blt", "ble", "bgt", "bge", "beq", "bne", "bmi", "bpl", "cbz",
    "cbnz", "bl ", "br ", "svc",
];

fn run_repl_line(m: &mut Machine, line: &str) -> Result<Vec<(String, i128)>, armsim::Error> {
    let lowered = line.to_lowercase();
    if REPL_FORBIDDEN_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
        return Err(armsim::Error::UnsupportedInstruction { line: lowered });
    }

    let before: Vec<(String, i128)> = all_register_names()
        .map(|name| (name.to_string(), m.register(name).unwrap_or(0)))
        .collect();

    armsim::decode::execute_line(m, &lowered)?;

    let changed = before
        .into_iter()
        .filter(|(name, value)| m.register(name) != Some(*value))
        .collect();
    Ok(changed)
}

fn all_register_names() -> impl Iterator<Item = &'static str> {
    GENERAL_PURPOSE_NAMES.iter().copied().chain(SPECIAL_NAMES.iter().copied())
}

fn print_changes(m: &Machine, changed: &[(String, i128)]) {
    for (name, value) in changed {
        println!("{} = {}", name, value);
    }
    let (n, z) = m.flags();
    println!("N={} Z={}", n as u8, z as u8);
}
