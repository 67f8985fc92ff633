//! Modifier aggregation

use boons_types::ModifierOp;
use serde::Serialize;

/// Running aggregate for one operation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Aggregate {
    /// Sum of all contributions
    pub total: f64,
    /// Largest single contribution (0 when nothing matched)
    pub strongest: f64,
    /// Number of contributions folded in
    pub count: usize,
}

impl Aggregate {
    pub fn push(&mut self, contribution: f64) {
        self.strongest = if self.count == 0 {
            contribution
        } else {
            self.strongest.max(contribution)
        };
        self.total += contribution;
        self.count += 1;
    }

    pub fn pick(&self, strongest: bool) -> f64 {
        if strongest { self.strongest } else { self.total }
    }
}

/// Raw aggregates for one stat, before folding into a caller value
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ModifierBreakdown {
    pub stat: String,
    pub add: Aggregate,
    pub multiply: Aggregate,
    pub divide: Aggregate,
    /// Record keys that contributed
    pub records: Vec<String>,
}

impl ModifierBreakdown {
    pub fn new(stat: impl Into<String>) -> Self {
        Self {
            stat: stat.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, op: ModifierOp, contribution: f64) {
        self.get_mut(op).push(contribution);
    }

    pub fn get(&self, op: ModifierOp) -> &Aggregate {
        match op {
            ModifierOp::Add => &self.add,
            ModifierOp::Multiply => &self.multiply,
            ModifierOp::Divide => &self.divide,
        }
    }

    fn get_mut(&mut self, op: ModifierOp) -> &mut Aggregate {
        match op {
            ModifierOp::Add => &mut self.add,
            ModifierOp::Multiply => &mut self.multiply,
            ModifierOp::Divide => &mut self.divide,
        }
    }

    pub fn is_empty(&self) -> bool {
        ModifierOp::ALL.iter().all(|op| self.get(*op).count == 0)
    }

    /// Fold into `value`: add, then divide, then multiply.
    ///
    /// The divisor is floored at 1 and the multiplier at 0, so a large
    /// negative divide or multiply can't flip the sign or divide by zero.
    pub fn fold(&self, value: f64, strongest: bool) -> f64 {
        let add = self.add.pick(strongest);
        let divide = self.divide.pick(strongest);
        let multiply = self.multiply.pick(strongest);
        (value + add) / (1.0 + divide).max(1.0) * (1.0 + multiply).max(0.0)
    }
}
