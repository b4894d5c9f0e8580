pub mod variable_resolver;

pub use variable_resolver::{extract_selectors, resolve_variables};
