pub mod condition;
pub mod operators;

pub use condition::{
    evaluate_case, evaluate_cases, evaluate_condition, evaluate_conditions,
    evaluate_run_condition, ELSE_BRANCH_HANDLE,
};
