//! The bounded ticket counter.
//!
//! A [`CounterValue`] is always inside `[0, MAX_TICKET]`. Every change goes
//! through [`Mutation::apply`], which validates against the value the caller
//! currently holds. The authoritative store does not re-validate at commit
//! time; a stale local value is overwritten blindly.

use crate::action::ActionKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Highest ticket number the counter may display.
pub const MAX_TICKET: u32 = 2000;

/// Rejection of a mutation before any network call is made.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Increment requested while already at the maximum
    #[error("Counter is already at the maximum ({MAX_TICKET})")]
    AtMaximum,

    /// Decrement requested while already at zero
    #[error("Counter is already at zero")]
    AtZero,

    /// Value outside `[0, MAX_TICKET]`
    #[error("Value {0} is outside the range 0..={MAX_TICKET}")]
    OutOfRange(f64),

    /// Direct entry that is not a finite number
    #[error("Not a number: {0:?}")]
    NotANumber(String),
}

/// Identifier of the singleton counter row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterId(i64);

impl CounterId {
    /// Wrap a raw store identifier
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw store identifier
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ticket number inside `[0, MAX_TICKET]`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct CounterValue(u32);

impl CounterValue {
    /// Zero, the reset value
    pub const ZERO: Self = Self(0);

    /// The maximum ticket number
    pub const MAX: Self = Self(MAX_TICKET);

    /// Create a value, rejecting anything above [`MAX_TICKET`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::OutOfRange`] when `value > MAX_TICKET`.
    pub fn new(value: u32) -> Result<Self, ValidationError> {
        if value > MAX_TICKET {
            return Err(ValidationError::OutOfRange(f64::from(value)));
        }
        Ok(Self(value))
    }

    /// Create a value from a signed integer coming from a store or wire format.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::OutOfRange`] when outside `[0, MAX_TICKET]`.
    #[allow(clippy::cast_precision_loss)] // only used for the error message
    pub fn from_i64(value: i64) -> Result<Self, ValidationError> {
        u32::try_from(value)
            .ok()
            .filter(|v| *v <= MAX_TICKET)
            .map(Self)
            .ok_or(ValidationError::OutOfRange(value as f64))
    }

    /// The raw number
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The raw number as `i32`, the column type used by SQL stores
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // bounded by MAX_TICKET
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl TryFrom<u32> for CounterValue {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CounterValue> for u32 {
    fn from(value: CounterValue) -> Self {
        value.0
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authoritative counter record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Row identifier
    pub id: CounterId,
    /// Current value
    pub value: CounterValue,
}

/// A mutation intent issued by a client.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Mutation {
    /// `value + 1`, rejected at the maximum
    Increment,
    /// `value - 1`, rejected at zero
    Decrement,
    /// `value := 0`, always accepted
    Reset,
    /// Direct numeric entry, floored and range-checked
    SetTo(f64),
}

impl Mutation {
    /// Compute the next value from the value the client currently holds.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the transition would leave
    /// `[0, MAX_TICKET]` or the entry is not a finite number.
    pub fn apply(self, current: CounterValue) -> Result<CounterValue, ValidationError> {
        match self {
            Self::Increment => {
                if current.0 >= MAX_TICKET {
                    return Err(ValidationError::AtMaximum);
                }
                Ok(CounterValue(current.0 + 1))
            },
            Self::Decrement => {
                if current.0 == 0 {
                    return Err(ValidationError::AtZero);
                }
                Ok(CounterValue(current.0 - 1))
            },
            Self::Reset => Ok(CounterValue::ZERO),
            Self::SetTo(n) => {
                if !n.is_finite() {
                    return Err(ValidationError::NotANumber(n.to_string()));
                }
                if !(0.0..=f64::from(MAX_TICKET)).contains(&n) {
                    return Err(ValidationError::OutOfRange(n));
                }
                // In range and finite, so the floored value fits in u32.
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let floored = n.floor() as u32;
                Ok(CounterValue(floored))
            },
        }
    }

    /// The kind recorded in the action log for this mutation.
    ///
    /// Direct entry is logged as [`ActionKind::Reset`] with no target value,
    /// so the log cannot tell "set to zero" from "jump to N".
    #[must_use]
    pub const fn action_kind(self) -> ActionKind {
        match self {
            Self::Increment => ActionKind::Increment,
            Self::Decrement => ActionKind::Decrement,
            Self::Reset | Self::SetTo(_) => ActionKind::Reset,
        }
    }
}

/// Parse a direct numeric entry typed by an operator.
///
/// # Errors
///
/// Returns [`ValidationError::NotANumber`] for empty or non-numeric input.
pub fn parse_entry(input: &str) -> Result<f64, ValidationError> {
    let trimmed = input.trim();
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n),
        _ => Err(ValidationError::NotANumber(trimmed.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value(n: u32) -> CounterValue {
        CounterValue::new(n).unwrap()
    }

    #[test]
    fn increment_at_maximum_is_rejected() {
        assert_eq!(
            Mutation::Increment.apply(CounterValue::MAX),
            Err(ValidationError::AtMaximum)
        );
        assert_eq!(Mutation::Increment.apply(value(1999)), Ok(CounterValue::MAX));
    }

    #[test]
    fn decrement_at_zero_is_rejected() {
        assert_eq!(
            Mutation::Decrement.apply(CounterValue::ZERO),
            Err(ValidationError::AtZero)
        );
        assert_eq!(Mutation::Decrement.apply(value(1)), Ok(CounterValue::ZERO));
    }

    #[test]
    fn reset_always_succeeds() {
        assert_eq!(Mutation::Reset.apply(CounterValue::MAX), Ok(CounterValue::ZERO));
        assert_eq!(Mutation::Reset.apply(CounterValue::ZERO), Ok(CounterValue::ZERO));
    }

    #[test]
    fn set_to_floors_and_checks_range() {
        assert_eq!(Mutation::SetTo(550.9).apply(value(3)), Ok(value(550)));
        assert_eq!(Mutation::SetTo(2000.0).apply(value(3)), Ok(CounterValue::MAX));
        assert_eq!(
            Mutation::SetTo(2000.5).apply(value(3)),
            Err(ValidationError::OutOfRange(2000.5))
        );
        assert_eq!(
            Mutation::SetTo(-1.0).apply(value(3)),
            Err(ValidationError::OutOfRange(-1.0))
        );
        assert!(matches!(
            Mutation::SetTo(f64::NAN).apply(value(3)),
            Err(ValidationError::NotANumber(_))
        ));
    }

    #[test]
    fn set_to_is_logged_as_reset() {
        assert_eq!(Mutation::SetTo(42.0).action_kind(), ActionKind::Reset);
        assert_eq!(Mutation::Increment.action_kind(), ActionKind::Increment);
    }

    #[test]
    fn parse_entry_rejects_garbage() {
        assert_eq!(parse_entry(" 12 "), Ok(12.0));
        assert!(matches!(parse_entry("abc"), Err(ValidationError::NotANumber(_))));
        assert!(matches!(parse_entry(""), Err(ValidationError::NotANumber(_))));
        assert!(matches!(parse_entry("inf"), Err(ValidationError::NotANumber(_))));
    }

    #[test]
    fn from_i64_checks_both_ends() {
        assert_eq!(CounterValue::from_i64(7), Ok(value(7)));
        assert!(CounterValue::from_i64(-1).is_err());
        assert!(CounterValue::from_i64(2001).is_err());
    }

    #[test]
    fn serde_rejects_out_of_range_values() {
        assert!(serde_json::from_str::<CounterValue>("2001").is_err());
        assert_eq!(serde_json::from_str::<CounterValue>("12").unwrap(), value(12));
    }

    fn mutation_strategy() -> impl Strategy<Value = Mutation> {
        prop_oneof![
            4 => Just(Mutation::Increment),
            4 => Just(Mutation::Decrement),
            1 => Just(Mutation::Reset),
            1 => (-100.0f64..2100.0).prop_map(Mutation::SetTo),
        ]
    }

    proptest! {
        #[test]
        fn accepted_mutations_stay_in_range(
            start in 0u32..=MAX_TICKET,
            steps in proptest::collection::vec(mutation_strategy(), 0..200),
        ) {
            let mut current = value(start);
            for mutation in steps {
                if let Ok(next) = mutation.apply(current) {
                    current = next;
                }
                prop_assert!(current.get() <= MAX_TICKET);
            }
        }
    }
}
