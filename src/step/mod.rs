//! ステップモデルと静的検証

mod model;
mod validation;

pub use model::{
    Action, DateBound, Selector, SelectorStrategy, Step, StepKind, StepList, DEFAULT_PRESS_KEY,
};
pub use validation::{
    validate, IssueLocation, Phase, ValidationErrors, ValidationIssue, ValidationResult,
};
