use regex::Regex;

use crate::{
    snapshot::{Constraint, ConstraintOperator},
    EntityContext,
};

/// Return `true` if every constraint matches (AND semantics). An empty list always matches.
pub(crate) fn constraints_match(constraints: &[Constraint], context: &EntityContext) -> bool {
    constraints
        .iter()
        .all(|constraint| constraint.eval(context))
}

impl Constraint {
    pub(crate) fn eval(&self, context: &EntityContext) -> bool {
        // Absent properties compare as an empty string.
        let context_value = context
            .get(&self.property)
            .map(|value| value.to_context_string())
            .unwrap_or_default();
        self.operator.eval(&context_value, &self.value)
    }
}

impl ConstraintOperator {
    /// Apply the operator to the entity's value and the constraint's value.
    ///
    /// Never fails: numeric operators treat unparsable operands as `0`, an invalid regex does not
    /// match `EREG` (and therefore satisfies `NEREG`), and unknown operators never match.
    pub fn eval(&self, context_value: &str, constraint_value: &str) -> bool {
        match self {
            Self::Eq => context_value == constraint_value,
            Self::Neq => context_value != constraint_value,

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let lhs = parse_number(context_value);
                let rhs = parse_number(constraint_value);
                match self {
                    Self::Lt => lhs < rhs,
                    Self::Lte => lhs <= rhs,
                    Self::Gt => lhs > rhs,
                    _ => lhs >= rhs,
                }
            }

            Self::In | Self::Notin => {
                let is_in = constraint_value
                    .split(',')
                    .any(|candidate| candidate.trim() == context_value);
                is_in == (*self == Self::In)
            }

            Self::Contains => context_value.contains(constraint_value),
            Self::Notcontains => !context_value.contains(constraint_value),

            Self::Ereg | Self::Nereg => {
                let matches = Regex::new(constraint_value)
                    .map(|regex| regex.is_match(context_value))
                    .unwrap_or(false);
                matches == (*self == Self::Ereg)
            }

            Self::Unknown => false,
        }
    }
}

fn parse_number(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}
