//! Per-tick sample budgets for one render generation.

/// What one tick of the render loop should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// 1-based index of the first sample rendered this tick.
    pub sample_index: u32,
    /// Samples per pixel rendered this tick.
    pub sample_budget: u32,
    /// Cumulative samples per pixel after this tick.
    pub cumulative: u32,
    /// Last tick before the target is reached.
    pub is_final: bool,
}

/// Splits a sample target into per-tick budgets.
///
/// With a target of 10 and 4 samples per tick the budgets are 4, 4, 2.
/// Without a target the schedule never ends.
#[derive(Debug, Clone)]
pub struct SampleSchedule {
    per_tick: u32,
    target: Option<u32>,
    done: u32,
}

impl SampleSchedule {
    pub fn new(per_tick: u32, target: Option<u32>) -> Self {
        Self {
            per_tick: per_tick.max(1),
            target,
            done: 0,
        }
    }

    /// Samples accumulated by the ticks planned so far.
    pub fn completed(&self) -> u32 {
        self.done
    }

    pub fn is_finished(&self) -> bool {
        self.target.is_some_and(|t| self.done >= t)
    }

    /// Plan the next tick, or `None` once the target is reached.
    pub fn next_tick(&mut self) -> Option<TickPlan> {
        if self.is_finished() {
            return None;
        }
        let budget = match self.target {
            Some(t) => self.per_tick.min(t - self.done),
            None => self.per_tick,
        };
        let sample_index = self.done.saturating_add(1);
        self.done = self.done.saturating_add(budget);
        Some(TickPlan {
            sample_index,
            sample_budget: budget,
            cumulative: self.done,
            is_final: self.is_finished(),
        })
    }
}
