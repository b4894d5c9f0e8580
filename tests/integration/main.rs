mod lifecycle;
#[macro_use]
mod macros;
mod pause_resume;
mod runner;

case_test! {
    test_linear_answer => "linear_answer",
    test_if_else_branch => "if_else_branch",
    test_branch_identify => "branch_identify",
    test_unconditional_edge => "unconditional_edge",
    test_loop_until_break => "loop_until_break",
    test_iteration_parallel => "iteration_parallel",
    test_iteration_terminated => "iteration_terminated",
    test_default_value_strategy => "default_value_strategy",
    test_fail_branch_strategy => "fail_branch_strategy",
    test_unsupported_strategy_fails => "unsupported_strategy_fails",
    test_conversation_assign => "conversation_assign",
    test_max_steps_exceeded => "max_steps_exceeded",
    test_human_input_pause => "human_input_pause",
    test_missing_required_input => "missing_required_input",
}
