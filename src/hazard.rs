//! Observational pipeline-hazard bookkeeping
//!
//! `HazardState` tracks the five scalars the performance model needs
//! (current cycle, the most recent load's destination/cycle, the most
//! recent flag writer's cycle, and the previous instruction's
//! destination). None of these influence functional results — only the
//! reported cycle count. The actual per-form penalty arithmetic lives
//! next to each instruction's execution in [`crate::decode`], since the
//! source computes a slightly different expression for almost every
//! form rather than one general formula (Design Notes, Open Question 3).

pub struct HazardState {
    pub cycle: i64,
    pub execute_count: i64,
    pub ld_cycle: i64,
    pub ld_dst: Option<String>,
    pub flag_cycle: i64,
    pub last_dst: Option<String>,
}

impl HazardState {
    pub fn new() -> HazardState {
        HazardState {
            cycle: 0,
            execute_count: 0,
            ld_cycle: -1,
            ld_dst: None,
            flag_cycle: -1,
            last_dst: None,
        }
    }

    /// Called once at the top of every dispatched instruction: snapshots
    /// the cycle the instruction executes on, advances the cycle and
    /// execute counters by one each, and clears `last_dst` the way the
    /// source's `execute()` does before re-deriving it per form.
    pub fn begin_instruction(&mut self) -> i64 {
        let current = self.cycle;
        self.cycle += 1;
        self.execute_count += 1;
        self.last_dst = None;
        current
    }

    pub fn add_penalty(&mut self, amount: i64) {
        self.cycle += amount;
    }

    pub fn record_load(&mut self, current_cycle: i64, dst: &str) {
        self.ld_cycle = current_cycle;
        self.ld_dst = Some(dst.to_string());
    }

    pub fn record_flag_write(&mut self, current_cycle: i64) {
        self.flag_cycle = current_cycle;
    }

    pub fn set_last_dst(&mut self, dst: &str) {
        self.last_dst = Some(dst.to_string());
    }

    pub fn reads_ld_dst(&self, reg: &str) -> bool {
        self.ld_dst.as_deref() == Some(reg)
    }

    pub fn reads_last_dst(&self, reg: &str) -> bool {
        self.last_dst.as_deref() == Some(reg)
    }

    pub fn clear(&mut self) {
        *self = HazardState::new();
    }
}

impl Default for HazardState {
    fn default() -> HazardState {
        HazardState::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_instruction_advances_both_counters_and_clears_last_dst() {
        let mut hz = HazardState::new();
        hz.set_last_dst("x0");
        let current = hz.begin_instruction();
        assert_eq!(current, 0);
        assert_eq!(hz.cycle, 1);
        assert_eq!(hz.execute_count, 1);
        assert_eq!(hz.last_dst, None);
    }

    #[test]
    fn record_load_updates_ld_cycle_and_ld_dst() {
        let mut hz = HazardState::new();
        hz.record_load(3, "x1");
        assert!(hz.reads_ld_dst("x1"));
        assert_eq!(hz.ld_cycle, 3);
    }
}
