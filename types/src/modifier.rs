use serde::{Deserialize, Serialize};

/// How a modifier folds into a checked value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierOp {
    /// Added to the base value before any scaling
    Add,
    /// Scales the result by `1 + total`
    Multiply,
    /// Divides the result by `1 + total`
    Divide,
}

impl ModifierOp {
    pub const ALL: [ModifierOp; 3] = [ModifierOp::Add, ModifierOp::Multiply, ModifierOp::Divide];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }
}

/// A single stat adjustment attached to an effect definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    /// Stat this modifier affects (e.g. "max_weight")
    pub stat: String,

    #[serde(alias = "op")]
    pub operation: ModifierOp,

    /// Base contribution
    pub value: f64,

    /// Extra contribution per stack, counted for every stack including the first
    #[serde(default)]
    pub per_stack: f64,
}

impl Modifier {
    pub fn new(stat: impl Into<String>, operation: ModifierOp, value: f64) -> Self {
        Self {
            stat: stat.into(),
            operation,
            value,
            per_stack: 0.0,
        }
    }

    pub fn add(stat: impl Into<String>, value: f64) -> Self {
        Self::new(stat, ModifierOp::Add, value)
    }

    pub fn multiply(stat: impl Into<String>, value: f64) -> Self {
        Self::new(stat, ModifierOp::Multiply, value)
    }

    pub fn divide(stat: impl Into<String>, value: f64) -> Self {
        Self::new(stat, ModifierOp::Divide, value)
    }

    pub fn with_per_stack(mut self, per_stack: f64) -> Self {
        self.per_stack = per_stack;
        self
    }

    /// Contribution of this modifier for a record holding `stacks` stacks
    pub fn contribution(&self, stacks: i32) -> f64 {
        self.value + f64::from(stacks) * self.per_stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contribution_counts_every_stack() {
        let m = Modifier::add("armor", 2.0).with_per_stack(1.5);
        assert_eq!(m.contribution(1), 3.5);
        assert_eq!(m.contribution(4), 8.0);
        assert_eq!(m.contribution(0), 2.0);
    }

    #[test]
    fn op_alias_in_toml() {
        let m: Modifier = toml::from_str(
            r#"
stat = "speed"
op = "divide"
value = 0.5
"#,
        )
        .unwrap();
        assert_eq!(m.operation, ModifierOp::Divide);
        assert_eq!(m.per_stack, 0.0);
    }
}
