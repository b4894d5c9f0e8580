use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{Case, ComparisonOperator, Condition, LogicalOperator, RunCondition};

use super::operators::{self, value_to_f64};

/// Handle taken by an if-else node when no case matches.
pub const ELSE_BRANCH_HANDLE: &str = "false";

/// Evaluate IfElse cases, returning the case_id of the first matching case,
/// or "false" if no case matches (else branch).
pub fn evaluate_cases(cases: &[Case], pool: &VariablePool) -> String {
    cases
        .iter()
        .find(|case| evaluate_case(case, pool))
        .map(|case| case.case_id.clone())
        .unwrap_or_else(|| ELSE_BRANCH_HANDLE.to_string())
}

pub fn evaluate_case(case: &Case, pool: &VariablePool) -> bool {
    evaluate_conditions(&case.conditions, case.logical_operator, pool)
}

/// Combine a condition list with AND/OR. An empty list is true.
pub fn evaluate_conditions(
    conditions: &[Condition],
    logical_operator: LogicalOperator,
    pool: &VariablePool,
) -> bool {
    if conditions.is_empty() {
        return true;
    }
    match logical_operator {
        LogicalOperator::And => conditions.iter().all(|c| evaluate_condition(c, pool)),
        LogicalOperator::Or => conditions.iter().any(|c| evaluate_condition(c, pool)),
    }
}

/// Evaluate a single condition
pub fn evaluate_condition(cond: &Condition, pool: &VariablePool) -> bool {
    let actual = pool.get(&cond.variable_selector);
    let expected = &cond.value;

    match cond.comparison_operator {
        ComparisonOperator::Contains => operators::contains(&actual, expected),
        ComparisonOperator::NotContains => !operators::contains(&actual, expected),
        ComparisonOperator::StartWith => operators::starts_with(&actual, expected),
        ComparisonOperator::EndWith => operators::ends_with(&actual, expected),
        ComparisonOperator::Is => operators::is(&actual, expected),
        ComparisonOperator::IsNot => !operators::is(&actual, expected),
        ComparisonOperator::Empty => actual.is_empty(),
        ComparisonOperator::NotEmpty => !actual.is_empty(),
        ComparisonOperator::In => operators::member_of(&actual, expected),
        ComparisonOperator::NotIn => !operators::member_of(&actual, expected),
        ComparisonOperator::AllOf => operators::all_of(&actual, expected),
        ComparisonOperator::Equal => {
            operators::compare_numeric(&actual, expected, |a, b| (a - b).abs() < f64::EPSILON)
        }
        ComparisonOperator::NotEqual => match (actual.as_f64(), value_to_f64(expected)) {
            (Some(a), Some(b)) => (a - b).abs() >= f64::EPSILON,
            _ => true,
        },
        ComparisonOperator::GreaterThan => operators::compare_numeric(&actual, expected, |a, b| a > b),
        ComparisonOperator::LessThan => operators::compare_numeric(&actual, expected, |a, b| a < b),
        ComparisonOperator::GreaterOrEqual => {
            operators::compare_numeric(&actual, expected, |a, b| a >= b)
        }
        ComparisonOperator::LessOrEqual => operators::compare_numeric(&actual, expected, |a, b| a <= b),
        ComparisonOperator::Null => actual.is_none(),
        ComparisonOperator::NotNull => !actual.is_none(),
    }
}

/// Whether an edge guarded by `condition` may be traversed, given the handle
/// the source node reported.
pub fn evaluate_run_condition(
    condition: &RunCondition,
    edge_source_handle: &str,
    pool: &VariablePool,
) -> bool {
    match condition {
        RunCondition::BranchIdentify { branch_identify } => branch_identify == edge_source_handle,
        RunCondition::Conditions {
            conditions,
            logical_operator,
        } => evaluate_conditions(conditions, *logical_operator, pool),
    }
}
