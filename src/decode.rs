//! The instruction decoder/executor
//!
//! Each executed line is matched, in the declared order below, against a
//! precompiled regex for one instruction form; the first match wins. This
//! mirrors the source's own long `if (re.match(...))` cascade (Design
//! Notes, "Dispatch") rather than re-deriving a generic mnemonic table,
//! since several forms have idiosyncrasies (see the per-form comments)
//! that a generalized table would paper over.

use crate::error::Error;
use crate::hazard::HazardState;
use crate::machine::Machine;
use regex::{Captures, Regex};
use std::sync::LazyLock;

pub(crate) const REG: &str = r"(?:lr|fp|sp|xzr|x(?:[0-9]|1[0-9]|2[0-8]))";
pub(crate) const NUM: &str = r"-?(?:0x[0-9a-f]+|[0-9]+)";
const VAR: &str = r"[a-z_][a-z0-9_]*";
pub(crate) const LABEL: &str = r"\.*\w+";

fn count_registers(line: &str) -> usize {
    let whole = Regex::new(&format!("{REG}")).unwrap();
    whole.find_iter(line).count()
}

fn reg_at<'a>(caps: &'a Captures, name: &str) -> &'a str {
    caps.name(name).unwrap().as_str()
}

fn parse_num(text: &str) -> i128 {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text),
    };
    let value = match rest.strip_prefix("0x") {
        Some(hex) => i128::from_str_radix(hex, 16).unwrap_or(0),
        None => rest.parse::<i128>().unwrap_or(0),
    };
    if neg { -value } else { value }
}

fn num_at(caps: &Captures, name: &str) -> i128 {
    parse_num(caps.name(name).unwrap().as_str())
}

/// Decodes up to 16 little-endian bytes into an `i128`, sign-extending
/// from bit `width*8-1` when `signed`. Tolerates a slice shorter than
/// `width` (see [`crate::memory::Memory::read_checked`]) by treating the
/// missing high bytes as zero.
fn decode_le(bytes: &[u8], width: usize, signed: bool) -> i128 {
    let mut raw: u128 = 0;
    for (i, b) in bytes.iter().enumerate() {
        raw |= (*b as u128) << (8 * i);
    }
    if signed && width > 0 {
        let sign_bit = 1u128 << (width * 8 - 1);
        if raw & sign_bit != 0 {
            let modulus = 1u128 << (width * 8);
            return raw as i128 - modulus as i128;
        }
    }
    raw as i128
}

fn find_label(instructions: &[String], label: &str) -> Result<usize, Error> {
    let target = format!("{label}:");
    instructions
        .iter()
        .position(|l| *l == target)
        .ok_or_else(|| Error::UnknownBranchTarget { label: label.to_string(), line: target })
}

const MASK64: i128 = (1i128 << 64) - 1;

fn mask64(value: i128) -> i128 {
    value.rem_euclid(1i128 << 64)
}

/// `lsl`: masks to a 64-bit unsigned view before and after shifting, the
/// way the source's explicit `& 0xFFFFFFFFFFFFFFFF` does at both ends.
fn shift_left_64(value: i128, imm: i128) -> Result<i128, Error> {
    if imm < 0 {
        return Err(Error::InvalidOperand { reason: "negative shift amount".into(), line: String::new() });
    }
    if imm >= 64 {
        return Ok(0);
    }
    Ok((mask64(value) << imm) & MASK64)
}

/// `lsr`: logical (unsigned) right shift.
fn shift_right_logical_64(value: i128, imm: i128) -> Result<i128, Error> {
    if imm < 0 {
        return Err(Error::InvalidOperand { reason: "negative shift amount".into(), line: String::new() });
    }
    if imm >= 64 {
        return Ok(0);
    }
    Ok(mask64(value) >> imm)
}

/// `asr`: arithmetic (sign-preserving) right shift, unmasked. A shift
/// count at or beyond the type width converges to the sign-extended
/// limit, which is what an unbounded-precision shift would also give.
fn shift_right_arith(value: i128, imm: i128) -> Result<i128, Error> {
    if imm < 0 {
        return Err(Error::InvalidOperand { reason: "negative shift amount".into(), line: String::new() });
    }
    if imm >= 127 {
        return Ok(if value < 0 { -1 } else { 0 });
    }
    Ok(value >> imm)
}

fn checked_div(rn: i128, rm: i128, line: &str) -> Result<i128, Error> {
    if rm == 0 {
        return Err(Error::InvalidOperand { reason: "division by zero".into(), line: line.to_string() });
    }
    Ok(rn / rm)
}

/// Runs one already-lowercased instruction line against the machine.
/// Does not advance `pc`; the caller ([`Machine::step`]) always adds one
/// afterward, exactly as the source's driver loop does even for taken
/// branches (a branch sets `pc` to a label's own index, so the trailing
/// `+= 1` lands one past it — see Design Notes on the driver loop).
pub fn execute_line(m: &mut Machine, raw_line: &str) -> Result<(), Error> {
    let line = crate::lexer::normalize_instruction_operands(raw_line);
    let current = m.hazard.begin_instruction();

    if let Some(result) = try_ldursw(m, &line, current) {
        return result;
    }
    if let Some(result) = try_ldurh(m, &line, current) {
        return result;
    }
    if let Some(result) = try_ldurb(m, &line, current) {
        return result;
    }
    if let Some(result) = try_ldur(m, &line, current) {
        return result;
    }
    if let Some(result) = try_sturw(m, &line, current) {
        return result;
    }
    if let Some(result) = try_sturh(m, &line, current) {
        return result;
    }
    if let Some(result) = try_sturb(m, &line, current) {
        return result;
    }
    if let Some(result) = try_stur(m, &line, current) {
        return result;
    }
    if let Some(result) = try_mov(m, &line, current) {
        return result;
    }
    if let Some(result) = try_shifts(m, &line, current) {
        return result;
    }
    if let Some(result) = try_add_sub(m, &line, current) {
        return result;
    }
    if let Some(result) = try_muldiv(m, &line, current) {
        return result;
    }
    if let Some(result) = try_cmp(m, &line, current) {
        return result;
    }
    if let Some(result) = try_logical(m, &line, current) {
        return result;
    }
    if let Some(result) = try_cbranch_reg(m, &line, current) {
        return result;
    }
    if let Some(result) = try_branch(m, &line, current) {
        return result;
    }
    if let Some(result) = try_call_return(m, &line, current) {
        return result;
    }
    if line == "svc 0" {
        return crate::syscall::dispatch(m);
    }

    Err(Error::UnsupportedInstruction { line })
}

/// `ld_dst == rn` within two cycles of the load: flat +1.
fn penalty_flat_one(hz: &mut HazardState, rn: &str, current: i64) {
    if hz.reads_ld_dst(rn) && current - hz.ld_cycle <= 2 {
        hz.add_penalty(1);
    }
}

/// `ld_dst == rn` within two cycles: penalty scales with recency.
fn penalty_recency(hz: &mut HazardState, rn: &str, current: i64) {
    if hz.reads_ld_dst(rn) && current - hz.ld_cycle <= 2 {
        hz.add_penalty(current - hz.ld_cycle);
    }
}

/// Either source register was the last load's destination: flat +1.
fn penalty_either_flat_one(hz: &mut HazardState, rn: &str, rm: &str, current: i64) {
    if (hz.reads_ld_dst(rn) || hz.reads_ld_dst(rm)) && current - hz.ld_cycle <= 2 {
        hz.add_penalty(1);
    }
}

/// Either source register was the last load's destination: recency.
fn penalty_either_recency(hz: &mut HazardState, rn: &str, rm: &str, current: i64) {
    if (hz.reads_ld_dst(rn) || hz.reads_ld_dst(rm)) && current - hz.ld_cycle <= 2 {
        hz.add_penalty(current - hz.ld_cycle);
    }
}

fn try_ldursw(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldursw (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldursw (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldursw (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 4, 4, line)?;
            let value = decode_le(bytes, 4, true);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        // bound check uses width 2 though 4 bytes are read (Open Question 5).
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 4, 2, line)?;
            let value = decode_le(bytes, 4, true);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_recency(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 4, 2, line)?;
            let value = decode_le(bytes, 4, true);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    None
}

fn try_ldurh(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?h (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?h (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?h (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());
    let signed = line.contains("ldursh");

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 2, 2, line)?;
            let value = decode_le(bytes, 2, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 2, 2, line)?;
            let value = decode_le(bytes, 2, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_recency(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 2, 2, line)?;
            let value = decode_le(bytes, 2, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    None
}

fn try_ldurb(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?b (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?b (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldurs?b (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());
    let signed = line.contains("ldursb");

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 1, 1, line)?;
            let value = decode_le(bytes, 1, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 1, 1, line)?;
            let value = decode_le(bytes, 1, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_recency(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 1, 1, line)?;
            let value = decode_le(bytes, 1, signed);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    None
}

fn try_ldur(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static SYM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldur (?P<rt>{REG}),=(?P<var>{VAR})$")).unwrap());
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldur (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldur (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ldur (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = SYM.captures(line) {
        let rt = reg_at(&caps, "rt");
        let var = caps.name("var").unwrap().as_str();
        let result = match m.symbols.get(var) {
            Some(value) => {
                m.registers.set(rt, value.as_i128());
                m.hazard.record_load(current, rt);
                Ok(())
            }
            None => Err(Error::UndefinedSymbol { name: var.to_string(), line_number: 0, line: line.to_string() }),
        };
        return Some(result);
    }
    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 8, 8, line)?;
            let value = decode_le(bytes, 8, false);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 8, 8, line)?;
            let value = decode_le(bytes, 8, false);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let result = (|| {
            let bytes = m.memory.read_checked(m.registers.sp(), addr, 8, 8, line)?;
            let value = decode_le(bytes, 8, false);
            m.registers.set(rt, value);
            m.hazard.record_load(current, rt);
            Ok(())
        })();
        return Some(result);
    }
    None
}

fn store_bytes_8(value: i128) -> [u8; 8] {
    let wrapped = value.rem_euclid(1i128 << 64) as u64;
    wrapped.to_le_bytes()
}

fn try_sturw(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturw (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturw (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturw (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let bytes = store_bytes_8(m.registers.get(rt));
        // bound check is width 2, though 4 bytes are written (Open Question 5).
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..4], 2, line));
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..4], 2, line));
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..4], 2, line));
    }
    None
}

fn try_sturh(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturh (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturh (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturh (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..2], 2, line));
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..2], 2, line));
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..2], 2, line));
    }
    None
}

fn try_sturb(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturb (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturb (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sturb (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..1], 1, line));
    }
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..1], 1, line));
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes[..1], 1, line));
    }
    None
}

fn try_stur(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^stur (?P<rt>{REG}),\[(?P<rn>{REG})\]$")).unwrap());
    static IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^stur (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<imm>{NUM})\]$")).unwrap());
    static RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^stur (?P<rt>{REG}),\[(?P<rn>{REG}),(?P<rm>{REG})\]$")).unwrap());

    if let Some(caps) = RN.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let addr = m.registers.get(rn);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes, 8, line));
    }
    // stur rt,[rn,imm] carries no load-use check in the source.
    if let Some(caps) = IMM.captures(line) {
        let (rt, rn) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"));
        let addr = m.registers.get(rn) + num_at(&caps, "imm");
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes, 8, line));
    }
    if let Some(caps) = RM.captures(line) {
        let (rt, rn, rm) = (reg_at(&caps, "rt"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let addr = m.registers.get(rn) + m.registers.get(rm);
        let bytes = store_bytes_8(m.registers.get(rt));
        return Some(m.memory.write_checked(m.registers.sp(), addr, &bytes, 8, line));
    }
    None
}

fn try_mov(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static IMM: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^mov (?P<rd>{REG}),(?P<imm>{NUM})$")).unwrap());
    static RN: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^mov (?P<rd>{REG}),(?P<rn>{REG})$")).unwrap());

    if let Some(caps) = IMM.captures(line) {
        let rd = reg_at(&caps, "rd");
        m.registers.set(rd, num_at(&caps, "imm"));
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = RN.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_flat_one(&mut m.hazard, rn, current);
        m.registers.set(rd, m.registers.get(rn));
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    None
}

/// Shift family. `asr`'s register-register form shares the source's own
/// immediate-only regex (a copy-paste artifact upstream), so it never
/// matches here either — `asr` only ever takes an immediate shift amount.
fn try_shifts(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static ASR_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^asr (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static LSR_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^lsr (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static LSR_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^lsr (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static LSL_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^lsl (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static LSL_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^lsl (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());

    if let Some(caps) = ASR_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let imm = num_at(&caps, "imm");
        let result = shift_right_arith(m.registers.get(rn), imm).map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    if let Some(caps) = LSR_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let imm = num_at(&caps, "imm");
        let result = shift_right_logical_64(m.registers.get(rn), imm).map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    if let Some(caps) = LSR_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let imm = m.registers.get(rm);
        let result = shift_right_logical_64(m.registers.get(rn), imm).map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    if let Some(caps) = LSL_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let imm = num_at(&caps, "imm");
        let result = shift_left_64(m.registers.get(rn), imm).map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    if let Some(caps) = LSL_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let imm = m.registers.get(rm);
        let result = shift_left_64(m.registers.get(rn), imm).map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    None
}

fn apply_flags_if_set(m: &mut Machine, suffixed: bool, result: i128, current: i64) {
    if suffixed {
        m.flags.set_from_result(result);
        m.hazard.record_flag_write(current);
    }
}

fn try_add_sub(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static ADD_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^adds? (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static ADD_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^adds? (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static SUB_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^subs? (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static SUB_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^subs? (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());

    if let Some(caps) = ADD_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        // add{s} rd,rn,imm uses a one-cycle window, not the usual two.
        if m.hazard.reads_ld_dst(rn) && current - m.hazard.ld_cycle <= 1 {
            m.hazard.add_penalty(1);
        }
        let result = m.registers.get(rn) + num_at(&caps, "imm");
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("adds"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = ADD_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = m.registers.get(rn) + m.registers.get(rm);
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("adds"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = SUB_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let result = m.registers.get(rn) - num_at(&caps, "imm");
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("subs"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = SUB_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = m.registers.get(rn) - m.registers.get(rm);
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("subs"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    None
}

fn try_muldiv(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static MUL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^mul (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static UDIV: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^udiv (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static SDIV: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^sdiv (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());

    if let Some(caps) = MUL.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        m.registers.set(rd, m.registers.get(rn) * m.registers.get(rm));
        m.hazard.set_last_dst(rd);
        m.hazard.add_penalty(4);
        return Some(Ok(()));
    }
    // udiv and sdiv are both signed truncating division (Open Question 2).
    if let Some(caps) = UDIV.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = checked_div(m.registers.get(rn), m.registers.get(rm), line);
        let result = result.map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    if let Some(caps) = SDIV.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = checked_div(m.registers.get(rn), m.registers.get(rm), line);
        let result = result.map(|v| {
            m.registers.set(rd, v);
            m.hazard.set_last_dst(rd);
        });
        return Some(result);
    }
    None
}

fn try_cmp(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static RM: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^cmp (?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static IMM: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^cmp (?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());

    if let Some(caps) = RM.captures(line) {
        let (rn, rm) = (reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        if rm == "sp" {
            return Some(Err(Error::InvalidOperand {
                reason: "sp cannot be the second operand of cmp".into(),
                line: line.to_string(),
            }));
        }
        let (a, b) = (m.registers.get(rn), m.registers.get(rm));
        m.flags.z = a == b;
        m.flags.n = a < b;
        m.hazard.record_flag_write(current);
        m.hazard.set_last_dst(rn);
        return Some(Ok(()));
    }
    if let Some(caps) = IMM.captures(line) {
        let rn = reg_at(&caps, "rn");
        penalty_flat_one(&mut m.hazard, rn, current);
        let imm = num_at(&caps, "imm");
        let a = m.registers.get(rn);
        m.flags.z = a == imm;
        m.flags.n = a < imm;
        m.hazard.record_flag_write(current);
        m.hazard.set_last_dst(rn);
        return Some(Ok(()));
    }
    None
}

fn try_logical(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static AND_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ands? (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static AND_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^ands? (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static ORR_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^orrs? (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static ORR_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^orrs? (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());
    static EOR_IMM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^eors? (?P<rd>{REG}),(?P<rn>{REG}),(?P<imm>{NUM})$")).unwrap());
    static EOR_RM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^eors? (?P<rd>{REG}),(?P<rn>{REG}),(?P<rm>{REG})$")).unwrap());

    if let Some(caps) = AND_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let result = m.registers.get(rn) & num_at(&caps, "imm");
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("ands"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = AND_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = m.registers.get(rn) & m.registers.get(rm);
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("ands"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = ORR_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let result = m.registers.get(rn) | num_at(&caps, "imm");
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("orrs"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = ORR_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = m.registers.get(rn) | m.registers.get(rm);
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("orrs"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = EOR_IMM.captures(line) {
        let (rd, rn) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"));
        penalty_recency(&mut m.hazard, rn, current);
        let result = m.registers.get(rn) ^ num_at(&caps, "imm");
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("eors"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    if let Some(caps) = EOR_RM.captures(line) {
        let (rd, rn, rm) = (reg_at(&caps, "rd"), reg_at(&caps, "rn"), reg_at(&caps, "rm"));
        penalty_either_flat_one(&mut m.hazard, rn, rm, current);
        let result = m.registers.get(rn) ^ m.registers.get(rm);
        m.registers.set(rd, result);
        apply_flags_if_set(m, line.contains("eors"), result, current);
        m.hazard.set_last_dst(rd);
        return Some(Ok(()));
    }
    None
}

fn try_cbranch_reg(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static CBNZ: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^cbnz (?P<rn>{REG}),(?P<label>{LABEL})$")).unwrap());
    static CBZ: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"^cbz (?P<rn>{REG}),(?P<label>{LABEL})$")).unwrap());

    if let Some(caps) = CBNZ.captures(line) {
        if count_registers(line) != 1 {
            return Some(Err(Error::InvalidOperand { reason: "cbnz takes one register".into(), line: line.to_string() }));
        }
        let rn = reg_at(&caps, "rn");
        cbranch_hazard(&mut m.hazard, rn, current);
        let label = caps.name("label").unwrap().as_str();
        let result = (|| {
            if m.registers.get(rn) != 0 {
                m.pc = find_label(&m.instructions, label)?;
                m.hazard.add_penalty(1);
            }
            Ok(())
        })();
        return Some(result);
    }
    if let Some(caps) = CBZ.captures(line) {
        if count_registers(line) != 1 {
            return Some(Err(Error::InvalidOperand { reason: "cbz takes one register".into(), line: line.to_string() }));
        }
        let rn = reg_at(&caps, "rn");
        cbranch_hazard(&mut m.hazard, rn, current);
        let label = caps.name("label").unwrap().as_str();
        let result = (|| {
            if m.registers.get(rn) == 0 {
                m.pc = find_label(&m.instructions, label)?;
                m.hazard.add_penalty(1);
            }
            Ok(())
        })();
        return Some(result);
    }
    None
}

/// `cbz`/`cbnz`'s source-register hazard: +1 if the immediately prior
/// instruction produced it, else the usual load-use recency penalty,
/// but measured against 3 (not 1) cycles of "fresh".
fn cbranch_hazard(hz: &mut HazardState, rn: &str, current: i64) {
    if hz.reads_last_dst(rn) {
        hz.add_penalty(1);
    } else if hz.reads_ld_dst(rn) && current - hz.ld_cycle <= 2 {
        hz.add_penalty(3 - (current - hz.ld_cycle));
    }
}

fn try_branch(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static B: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b (?P<label>{LABEL})$")).unwrap());
    static BLT: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?lt (?P<label>{LABEL})$")).unwrap());
    static BLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?le (?P<label>{LABEL})$")).unwrap());
    static BGT: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?gt (?P<label>{LABEL})$")).unwrap());
    static BGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?ge (?P<label>{LABEL})$")).unwrap());
    static BEQ: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?eq (?P<label>{LABEL})$")).unwrap());
    static BNE: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?ne (?P<label>{LABEL})$")).unwrap());
    static BMI: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?mi (?P<label>{LABEL})$")).unwrap());
    static BPL: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^b\.?pl (?P<label>{LABEL})$")).unwrap());

    if let Some(caps) = B.captures(line) {
        if count_registers(line) != 0 {
            return Some(Err(Error::UnexpectedRegisterOperand { mnemonic: "b".into(), line: line.to_string() }));
        }
        let label = caps.name("label").unwrap().as_str();
        let result = (|| {
            m.pc = find_label(&m.instructions, label)?;
            m.hazard.add_penalty(1);
            Ok(())
        })();
        return Some(result);
    }

    let conditional = [
        ("blt", &BLT, Cond::Lt),
        ("ble", &BLE, Cond::Le),
        ("bgt", &BGT, Cond::Gt),
        ("bge", &BGE, Cond::Ge),
        ("beq", &BEQ, Cond::Eq),
        ("bne", &BNE, Cond::Ne),
        ("bmi", &BMI, Cond::Mi),
        ("bpl", &BPL, Cond::Pl),
    ];
    for (mnemonic, regex, cond) in conditional {
        if let Some(caps) = regex.captures(line) {
            if count_registers(line) != 0 {
                return Some(Err(Error::UnexpectedRegisterOperand { mnemonic: mnemonic.into(), line: line.to_string() }));
            }
            let label = caps.name("label").unwrap().as_str();
            // b.mi is the one conditional branch with no flag-use penalty.
            if !matches!(cond, Cond::Mi) && current - m.hazard.flag_cycle <= 1 {
                m.hazard.add_penalty(1);
            }
            let taken = cond.taken(m.flags.n, m.flags.z);
            let result = (|| {
                if taken {
                    m.pc = find_label(&m.instructions, label)?;
                    m.hazard.add_penalty(1);
                }
                Ok(())
            })();
            return Some(result);
        }
    }
    None
}

#[derive(Clone, Copy)]
enum Cond {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Mi,
    Pl,
}

impl Cond {
    fn taken(self, n: bool, z: bool) -> bool {
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Lt => n,
            Cond::Le => n || z,
            Cond::Gt => !z && !n,
            Cond::Ge => !n,
            Cond::Mi => n,
            Cond::Pl => !n || z,
        }
    }
}

fn try_call_return(m: &mut Machine, line: &str, current: i64) -> Option<Result<(), Error>> {
    static BL: LazyLock<Regex> = LazyLock::new(|| Regex::new(&format!(r"^bl (?P<label>{LABEL})$")).unwrap());
    static BR_LR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^br lr$").unwrap());

    if let Some(caps) = BL.captures(line) {
        if count_registers(line) != 0 {
            return Some(Err(Error::UnexpectedRegisterOperand { mnemonic: "bl".into(), line: line.to_string() }));
        }
        let label = caps.name("label").unwrap().as_str().to_string();
        if current - m.hazard.flag_cycle <= 1 {
            m.hazard.add_penalty(1);
        }
        let pc_before = m.pc as i128;
        if m.registers.get("lr") == pc_before {
            m.recursed_labels.insert(label.clone());
        }
        m.registers.set("lr", pc_before);
        if let Some(count) = m.label_hit_counts.get_mut(&label) {
            *count += 1;
        }
        let result = if let Some(mut callback) = m.linked_labels.remove(&label) {
            let r = callback(m);
            m.linked_labels.insert(label, callback);
            r
        } else {
            find_label(&m.instructions, &label).map(|idx| {
                m.pc = idx;
            })
        };
        m.hazard.add_penalty(1);
        return Some(result);
    }
    if BR_LR.is_match(line) {
        let addr = m.registers.get("lr");
        let result = if addr < 0 || addr as usize >= m.instructions.len() {
            Err(Error::ReturnTargetOutOfRange { addr })
        } else {
            m.pc = addr as usize;
            Ok(())
        };
        m.hazard.add_penalty(1);
        return Some(result);
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::machine::Machine;

    fn exec(src: &str) -> Machine {
        let mut m = Machine::new();
        m.load(src).unwrap();
        m.run().unwrap();
        m
    }

    #[test]
    fn store_then_load_round_trips_all_widths() {
        let src = "\
.bss
buf:.space 32
main:
mov x0,-7
stur x0,[sp]
ldur x1,[sp]
sturw x0,[sp,8]
ldursw x2,[sp,8]
sturh x0,[sp,16]
ldursh x3,[sp,16]
sturb x0,[sp,24]
ldursb x4,[sp,24]
mov x8,93
svc 0
";
        let m = exec(src);
        assert_eq!(m.register("x1"), Some(-7));
        assert_eq!(m.register("x2"), Some(-7));
        assert_eq!(m.register("x3"), Some(-7));
        assert_eq!(m.register("x4"), Some(-7));
    }

    #[test]
    fn unsigned_loads_zero_extend() {
        let src = "\
main:
mov x0,-1
stur x0,[sp]
ldurb x1,[sp]
ldurh x2,[sp]
mov x8,93
svc 0
";
        let m = exec(src);
        assert_eq!(m.register("x1"), Some(0xff));
        assert_eq!(m.register("x2"), Some(0xffff));
    }

    #[test]
    fn dword_array_indexing_via_immediate_offset() {
        let m = exec(".data\na:.dword 1,2,3\nmain:\nldur x0,=a\nldur x1,[x0,16]\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x1"), Some(3));
    }

    #[test]
    fn lsl_and_lsr_mask_to_64_bits() {
        let m = exec("main:\nmov x0,1\nlsl x0,x0,63\nlsl x0,x0,1\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x0"), Some(0));
    }

    #[test]
    fn asr_preserves_sign() {
        let m = exec("main:\nmov x0,-8\nasr x0,x0,1\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x0"), Some(-4));
    }

    #[test]
    fn udiv_and_sdiv_both_truncate_toward_zero() {
        let m = exec("main:\nmov x0,-7\nmov x1,2\nsdiv x2,x0,x1\nudiv x3,x0,x1\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x2"), Some(-3));
        assert_eq!(m.register("x3"), Some(-3));
    }

    #[test]
    fn s_suffixed_form_sets_flags_and_plain_form_does_not() {
        let m = exec("main:\nmov x0,5\nmov x1,5\nsubs x2,x0,x1\nmov x8,93\nsvc 0\n");
        assert_eq!(m.flags(), (false, true));
        let m2 = exec("main:\nmov x0,5\nmov x1,5\nsub x2,x0,x1\nmov x8,93\nsvc 0\n");
        assert_eq!(m2.flags(), (false, false));
    }

    #[test]
    fn cmp_with_sp_as_second_operand_is_rejected() {
        let mut m = Machine::new();
        m.load("main:\ncmp x0,sp\n").unwrap();
        let err = m.run().unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidOperand { .. }));
    }

    #[test]
    fn cbz_skips_to_label_when_register_is_zero() {
        let m = exec("main:\nmov x0,0\nmov x1,9\ncbz x0,zero\nmov x1,1\nzero:\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x1"), Some(9));
    }

    #[test]
    fn cbnz_falls_through_when_register_is_zero() {
        let m = exec("main:\nmov x0,0\ncbnz x0,skip\nmov x1,7\nskip:\nmov x8,93\nsvc 0\n");
        assert_eq!(m.register("x1"), Some(7));
    }

    #[test]
    fn bl_and_br_lr_implement_a_call_and_return() {
        let src = "\
main:
bl double
mov x8,93
svc 0
double:
add x0,x0,x0
br lr
";
        let mut m = Machine::new();
        m.load(src).unwrap();
        m.set_register("x0", 21);
        m.run().unwrap();
        assert_eq!(m.register("x0"), Some(42));
    }

    #[test]
    fn unsupported_instruction_is_a_decode_error() {
        let mut m = Machine::new();
        m.load("main:\nfoo x0,x1\n").unwrap();
        let err = m.run().unwrap_err();
        assert!(matches!(err, crate::error::Error::UnsupportedInstruction { .. }));
    }
}
