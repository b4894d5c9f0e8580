use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::VariableMapping;
use crate::error::NodeError;

/// Deserialize a node's config into its typed data struct.
pub fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, NodeError> {
    serde_json::from_value(config.clone()).map_err(|e| NodeError::ConfigError(e.to_string()))
}

/// Resolve `variable <- value_selector` mappings against the pool. Missing
/// values resolve to null.
pub fn resolve_mappings(mappings: &[VariableMapping], pool: &VariablePool) -> HashMap<String, Value> {
    mappings
        .iter()
        .map(|m| (m.variable.clone(), pool.get(&m.value_selector).to_value()))
        .collect()
}
