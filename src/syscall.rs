//! The minimal syscall layer (§4.6, §6)
//!
//! `svc 0` dispatches on `x8`. Each handler reads its arguments from the
//! register file, performs host I/O or a heap adjustment, and writes its
//! result back into `x0`, mirroring a real AArch64 Linux syscall ABI
//! closely enough for the five numbers this simulator services.

use std::io::{self, BufRead, Write as _};

use rand::TryRngCore;

use crate::error::Error;
use crate::machine::Machine;

const SYS_READ: i128 = 63;
const SYS_WRITE: i128 = 64;
const SYS_EXIT: i128 = 93;
const SYS_BRK: i128 = 214;
const SYS_GETRANDOM: i128 = 278;

pub fn dispatch(m: &mut Machine) -> Result<(), Error> {
    match m.registers.get("x8") {
        SYS_READ => read(m),
        SYS_WRITE => write(m),
        SYS_EXIT => {
            m.pc = m.instructions.len();
            Ok(())
        }
        SYS_BRK => brk(m),
        SYS_GETRANDOM => getrandom(m),
        number => Err(Error::UnsupportedSyscall { number }),
    }
}

/// Reads one line from stdin, appends `\n`, truncates to `x2` bytes, and
/// writes the result to `mem[x1..]`; `x0` becomes the number of bytes
/// written.
fn read(m: &mut Machine) -> Result<(), Error> {
    let buf = m.registers.get("x1") as usize;
    let len = m.registers.get("x2") as usize;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|_| Error::ReadFailed { path: "<stdin>".into() })?;
    if !line.ends_with('\n') {
        line.push('\n');
    }
    let mut bytes = line.into_bytes();
    bytes.truncate(len);

    m.poke(buf, &bytes)?;
    m.registers.set("x0", bytes.len() as i128);
    Ok(())
}

/// Writes `x2` bytes from `mem[x1..]` to stdout; `x0` must be the stdout
/// file descriptor (1).
fn write(m: &mut Machine) -> Result<(), Error> {
    let fd = m.registers.get("x0");
    if fd != 1 {
        return Err(Error::NonStdoutWrite { fd });
    }
    let buf = m.registers.get("x1") as usize;
    let len = m.registers.get("x2") as usize;
    let bytes = m.peek(buf, len)?;
    io::stdout().write_all(bytes).map_err(|_| Error::ReadFailed { path: "<stdout>".into() })?;
    Ok(())
}

/// Adjusts the heap break per §4.6 and returns the resulting break in
/// `x0`.
fn brk(m: &mut Machine) -> Result<(), Error> {
    let requested = m.registers.get("x0");
    let result = m.memory.brk_syscall(requested)?;
    m.registers.set("x0", result);
    Ok(())
}

/// Fills `mem[x0..x0+x1)` with OS-random bytes; `x0` becomes `x1`
/// (bytes written), matching the real `getrandom(2)` return convention.
fn getrandom(m: &mut Machine) -> Result<(), Error> {
    let buf = m.registers.get("x0") as usize;
    let len = m.registers.get("x1") as usize;

    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| Error::ReadFailed { path: "<getrandom>".into() })?;

    m.poke(buf, &bytes)?;
    m.registers.set("x0", len as i128);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_drives_pc_to_end_of_stream() {
        let mut m = Machine::new();
        m.load("main:\nmov x8,93\nsvc 0\n").unwrap();
        m.run().unwrap();
        assert_eq!(m.pc, m.instructions().len());
    }

    #[test]
    fn write_requires_stdout_fd() {
        let mut m = Machine::new();
        m.load(".data\nmsg:.asciz \"hi\"\nmain:\nmov x0,2\nldur x1,=msg\nmov x2,2\nmov x8,64\nsvc 0\n").unwrap();
        let err = m.run().unwrap_err();
        assert!(matches!(err, Error::NonStdoutWrite { fd: 2 }));
    }

    #[test]
    fn literal_symbol_value_round_trips_through_ldur_equals() {
        let mut m = Machine::new();
        m.load(".data\nlen=5\nmain:\nldur x0,=len\nmov x8,93\nsvc 0\n").unwrap();
        let rc = m.run().unwrap();
        assert_eq!(rc, 5);
    }

    #[test]
    fn brk_syscall_grows_heap_by_a_page_and_shrinks_back() {
        let mut m = Machine::new();
        m.load("main:\nmov x8,93\nsvc 0\n").unwrap();
        m.run().unwrap();
        let original = m.memory.original_break() as i128;
        m.set_register("x0", original + 1);
        m.set_register("x8", 214);
        super::dispatch(&mut m).unwrap();
        assert_eq!(m.register("x0"), Some(original + crate::memory::PAGE_SIZE as i128));
        m.set_register("x0", original);
        m.set_register("x8", 214);
        super::dispatch(&mut m).unwrap();
        assert_eq!(m.register("x0"), Some(original));
    }

    #[test]
    fn getrandom_fills_requested_byte_count() {
        let mut m = Machine::new();
        m.load("main:\nmov x0,4096\nmov x1,8\nmov x8,278\nsvc 0\nmov x8,93\nsvc 0\n").unwrap();
        m.run().unwrap();
        assert_eq!(m.register("x0"), Some(8));
    }
}
