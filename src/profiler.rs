//! Execution profiler for the interpreter. It counts every executed
//! instruction against the optional budget and keeps track of loop
//! entries: a backward jump lands on a loop header, and once a header has
//! been entered more often than the threshold the loop is considered hot.
use std::collections::HashMap;

use tracing::debug;

use crate::error::{RuntimeError, RuntimeErrorKind};

/// Program counter for the runtime points to the current instruction
/// and method we're executing.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProgramCounter {
    pub method_id: usize,
    pub instruction_index: usize,
}

impl ProgramCounter {
    pub fn new(method_id: usize, instruction_index: usize) -> Self {
        Self {
            method_id,
            instruction_index,
        }
    }
}

#[derive(Debug)]
pub struct Profiler {
    // Threshold before a loop entry is considered hot.
    threshold: usize,
    // Instructions allowed before execution is aborted.
    budget: Option<u64>,
    executed: u64,
    // Record of loop entries and their access counts.
    records: HashMap<ProgramCounter, usize>,
}

impl Profiler {
    pub fn new(threshold: usize, budget: Option<u64>) -> Profiler {
        Profiler {
            threshold,
            budget,
            executed: 0,
            records: HashMap::new(),
        }
    }

    /// Count one instruction, failing once the budget is spent.
    pub fn count_instruction(&mut self) -> Result<(), RuntimeError> {
        if let Some(budget) = self.budget {
            if self.executed >= budget {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::BudgetExhausted,
                    format!("instruction budget of {budget} exhausted"),
                ));
            }
        }
        self.executed += 1;
        Ok(())
    }

    /// Record a jump. Only backward jumps within a method count as loop
    /// entries.
    pub fn count_jump(&mut self, from: ProgramCounter, to: ProgramCounter) {
        if from.method_id != to.method_id || to.instruction_index > from.instruction_index {
            return;
        }
        let record = self.records.entry(to).or_insert(0);
        *record += 1;
        if *record == self.threshold + 1 {
            debug!(
                method = to.method_id,
                header = to.instruction_index,
                "loop turned hot"
            );
        }
    }

    pub fn is_hot(&self, pc: &ProgramCounter) -> bool {
        if let Some(record) = self.records.get(pc) {
            return record > &self.threshold;
        }
        false
    }

    /// Loop headers that crossed the threshold.
    pub fn hot_loops(&self) -> Vec<ProgramCounter> {
        let mut hot: Vec<ProgramCounter> = self
            .records
            .iter()
            .filter(|(_, count)| **count > self.threshold)
            .map(|(pc, _)| *pc)
            .collect();
        hot.sort_by_key(|pc| (pc.method_id, pc.instruction_index));
        hot
    }

    pub fn entries(&self, pc: &ProgramCounter) -> usize {
        self.records.get(pc).copied().unwrap_or(0)
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(1000, None)
    }
}
