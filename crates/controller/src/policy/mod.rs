//! Policy validation and the pure condition evaluator.

pub mod evaluator;
pub mod validation;

pub use evaluator::{evaluate, Diagnosis, LiveMetrics, Reason, TargetStatus, Verdict};
pub use validation::{
    check_duplicate_target, validate_policy, validate_spec, ConditionValue, ValidationError,
};
