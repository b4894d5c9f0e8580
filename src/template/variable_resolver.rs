use regex::Regex;
use std::sync::OnceLock;

use crate::core::variable_pool::VariablePool;
use crate::error::NodeError;

static SELECTOR_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn selector_pattern() -> Result<&'static Regex, NodeError> {
    SELECTOR_PATTERN
        .get_or_init(|| Regex::new(r"\{\{#([^#]+)#\}\}").ok())
        .as_ref()
        .ok_or_else(|| NodeError::TemplateError("invalid selector pattern".to_string()))
}

/// Replace every `{{#node.var#}}` reference in `text` with its display value.
///
/// Unknown references render as an empty string. Nested paths
/// (`{{#http.body.items.0#}}`) walk into objects and arrays.
pub fn resolve_variables(text: &str, pool: &VariablePool) -> Result<String, NodeError> {
    let pattern = selector_pattern()?;
    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;
    for cap in pattern.captures_iter(text) {
        let Some(whole) = cap.get(0) else { continue };
        rendered.push_str(&text[last..whole.start()]);
        let path: Vec<String> = cap[1].trim().split('.').map(str::to_string).collect();
        rendered.push_str(&pool.get(&path).to_display_string());
        last = whole.end();
    }
    rendered.push_str(&text[last..]);
    Ok(rendered)
}

/// Extract all variable selectors in the text.
pub fn extract_selectors(text: &str) -> Vec<String> {
    match selector_pattern() {
        Ok(re) => re
            .captures_iter(text)
            .map(|cap| cap[1].trim().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn pool_with(node: &str, outputs: serde_json::Value) -> VariablePool {
        let mut pool = VariablePool::new();
        let map: HashMap<String, serde_json::Value> =
            serde_json::from_value(outputs).unwrap();
        pool.add_node_outputs(node, &map).unwrap();
        pool
    }

    #[test]
    fn test_resolve_variables() {
        let pool = pool_with("node1", json!({"text": "hello"}));
        let result = resolve_variables("Result: {{#node1.text#}}", &pool).unwrap();
        assert_eq!(result, "Result: hello");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let pool = VariablePool::new();
        let result = resolve_variables("[{{#nope.x#}}]", &pool).unwrap();
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_extract_selectors() {
        let text = "Hello {{#input.name#}}, result is {{#llm.text#}}";
        assert_eq!(extract_selectors(text), vec!["input.name", "llm.text"]);
    }

    #[test]
    fn test_resolve_nested_and_numbers() {
        let pool = pool_with("http", json!({"body": {"count": 3}, "items": ["a", "b"]}));
        let result =
            resolve_variables("{{#http.body.count#}} {{#http.items.1#}}", &pool).unwrap();
        assert_eq!(result, "3 b");
    }
}
