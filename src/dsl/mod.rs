pub mod parser;
pub mod schema;

pub use parser::{parse_dsl, DslFormat};
pub(crate) use parser::parse_value;
pub use schema::*;
