//! An interpreting simulator for a subset of AArch64, with a static rule
//! checker and an approximate in-order-pipeline hazard model.
//!
//! [`Machine`](machine::Machine) is the crate's embedding surface: parse a
//! source string with [`Machine::load`](machine::Machine::load), configure
//! [`Rules`](checker::Rules) via [`Machine::rules_mut`](machine::Machine::rules_mut),
//! then drive it with [`Machine::run`](machine::Machine::run) or
//! [`Machine::step`](machine::Machine::step).

pub mod checker;
pub mod decode;
pub mod error;
pub mod hazard;
pub mod lexer;
pub mod logging;
pub mod machine;
pub mod memory;
pub mod parser;
pub mod registers;
pub mod symbols;
mod directives;
mod syscall;

pub use error::Error;
pub use machine::Machine;
