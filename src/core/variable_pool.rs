use compact_str::CompactString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::WorkflowError;

/// Namespace holding system variables (`sys.query`, `sys.user_id`, ...).
pub const SYSTEM_VARIABLE_NODE_ID: &str = "sys";
/// Namespace holding environment variables declared by the workflow.
pub const ENVIRONMENT_VARIABLE_NODE_ID: &str = "env";
/// Namespace holding conversation-scoped variables.
pub const CONVERSATION_VARIABLE_NODE_ID: &str = "conversation";

const RESERVED_NAMESPACES: [&str; 3] = [
    SYSTEM_VARIABLE_NODE_ID,
    ENVIRONMENT_VARIABLE_NODE_ID,
    CONVERSATION_VARIABLE_NODE_ID,
];

// ================================
// Segment – Dify variable type system
// ================================

#[derive(Debug, Clone)]
pub enum Segment {
    None,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Object(HashMap<String, Segment>),
    ArrayString(Vec<String>),
    Array(Vec<Segment>),
}

impl Serialize for Segment {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        Ok(Segment::from_value(&v))
    }
}

impl Segment {
    /// Convert Segment → serde_json::Value
    pub fn to_value(&self) -> Value {
        match self {
            Segment::None => Value::Null,
            Segment::String(s) => Value::String(s.clone()),
            Segment::Integer(i) => serde_json::json!(*i),
            Segment::Float(f) => serde_json::json!(*f),
            Segment::Boolean(b) => Value::Bool(*b),
            Segment::Object(map) => {
                let m: serde_json::Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect();
                Value::Object(m)
            }
            Segment::ArrayString(v) => {
                Value::Array(v.iter().map(|s| Value::String(s.clone())).collect())
            }
            Segment::Array(v) => Value::Array(v.iter().map(|s| s.to_value()).collect()),
        }
    }

    /// Create Segment from serde_json::Value
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Null => Segment::None,
            Value::Bool(b) => Segment::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Segment::Integer(i)
                } else {
                    Segment::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => Segment::String(s.clone()),
            Value::Array(arr) => {
                if arr.is_empty() {
                    return Segment::Array(Vec::new());
                }
                if arr.iter().all(|v| v.is_string()) {
                    let items = arr
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect();
                    Segment::ArrayString(items)
                } else {
                    Segment::Array(arr.iter().map(Segment::from_value).collect())
                }
            }
            Value::Object(map) => {
                let m: HashMap<String, Segment> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Segment::from_value(v)))
                    .collect();
                Segment::Object(m)
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Segment::None)
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Segment::String(s) => Some(s.clone()),
            Segment::Integer(i) => Some(i.to_string()),
            Segment::Float(f) => Some(f.to_string()),
            Segment::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Segment::None => String::new(),
            Segment::String(s) => s.clone(),
            Segment::Integer(i) => i.to_string(),
            Segment::Float(f) => f.to_string(),
            Segment::Boolean(b) => b.to_string(),
            other => serde_json::to_string(&other.to_value()).unwrap_or_default(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Segment::Integer(i) => Some(*i as f64),
            Segment::Float(f) => Some(*f),
            Segment::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Segment::None => true,
            Segment::String(s) => s.is_empty(),
            Segment::ArrayString(v) => v.is_empty(),
            Segment::Array(v) => v.is_empty(),
            Segment::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Walk into an object field or array index.
    pub fn child(&self, key: &str) -> Segment {
        match self {
            Segment::Object(map) => map.get(key).cloned().unwrap_or(Segment::None),
            Segment::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Segment::None),
            Segment::ArrayString(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .map(Segment::String)
                .unwrap_or(Segment::None),
            _ => Segment::None,
        }
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Segment::None, Segment::None) => true,
            (Segment::String(a), Segment::String(b)) => a == b,
            (Segment::Integer(a), Segment::Integer(b)) => a == b,
            (Segment::Float(a), Segment::Float(b)) => (a - b).abs() < 1e-10,
            (Segment::Integer(a), Segment::Float(b)) | (Segment::Float(b), Segment::Integer(a)) => {
                (*a as f64 - b).abs() < 1e-10
            }
            (Segment::Boolean(a), Segment::Boolean(b)) => a == b,
            (Segment::ArrayString(a), Segment::ArrayString(b)) => a == b,
            _ => self.to_value() == other.to_value(),
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

// ================================
// Selector
// ================================

/// A two-part variable address: `(node_id, variable_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    node_id: String,
    variable_name: String,
}

impl Selector {
    pub fn new(node_id: impl Into<String>, variable_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            variable_name: variable_name.into(),
        }
    }

    /// Parse `["node", "var"]` or `"node.var"`.
    pub fn parse_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(arr) if arr.len() >= 2 => {
                let node = arr[0].as_str()?;
                let var = arr[1].as_str()?;
                Some(Self::new(node, var))
            }
            Value::String(s) => {
                let (node, var) = s.split_once('.')?;
                Some(Self::new(node, var))
            }
            _ => None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    pub fn to_path(&self) -> Vec<String> {
        vec![self.node_id.clone(), self.variable_name.clone()]
    }

    fn pool_key(&self) -> CompactString {
        make_key(&self.node_id, &self.variable_name)
    }
}

fn make_key(node_id: &str, var_name: &str) -> CompactString {
    let mut key = CompactString::with_capacity(node_id.len() + 1 + var_name.len());
    key.push_str(node_id);
    key.push('\0');
    key.push_str(var_name);
    key
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('\0')
}

// ================================
// VariablePool – Dify-compatible
// ================================

/// Serializable form of a [`VariablePool`], namespaced by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub variables: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub user_inputs: BTreeMap<String, Value>,
}

/// Per-run variable store.
///
/// Node namespaces are write-once: [`VariablePool::add_node_outputs`] refuses to
/// overwrite a key that already exists. The `conversation` namespace is the only
/// mutable one and is changed through [`VariablePool::set_conversation_variable`].
#[derive(Debug, Clone, Default)]
pub struct VariablePool {
    variables: HashMap<CompactString, Segment>,
    user_inputs: HashMap<String, Value>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Get a value by path: `["node_id", "var", "nested", ...]`.
    pub fn get(&self, path: &[String]) -> Segment {
        if path.len() < 2 {
            return Segment::None;
        }
        let Some(root) = self.variables.get(&make_key(&path[0], &path[1])) else {
            return Segment::None;
        };
        let mut current = root.clone();
        for key in &path[2..] {
            current = current.child(key);
            if current.is_none() {
                break;
            }
        }
        current
    }

    pub fn get_selector(&self, selector: &Selector) -> Segment {
        self.variables
            .get(&selector.pool_key())
            .cloned()
            .unwrap_or(Segment::None)
    }

    pub fn has(&self, selector: &Selector) -> bool {
        self.variables.contains_key(&selector.pool_key())
    }

    /// Seed a value without ownership checks. Used for system, environment and
    /// conversation variables before the run starts and when restoring a checkpoint.
    pub fn seed(&mut self, selector: &Selector, value: Segment) {
        self.variables.insert(selector.pool_key(), value);
    }

    pub fn seed_system_variables(&mut self, vars: &HashMap<String, Value>) {
        for (name, value) in vars {
            self.seed(
                &Selector::new(SYSTEM_VARIABLE_NODE_ID, name.as_str()),
                Segment::from_value(value),
            );
        }
    }

    pub fn seed_environment_variables(&mut self, vars: &HashMap<String, Value>) {
        for (name, value) in vars {
            self.seed(
                &Selector::new(ENVIRONMENT_VARIABLE_NODE_ID, name.as_str()),
                Segment::from_value(value),
            );
        }
    }

    pub fn seed_conversation_variables(&mut self, vars: &HashMap<String, Value>) {
        for (name, value) in vars {
            self.set_conversation_variable(name, Segment::from_value(value));
        }
    }

    pub fn set_user_inputs(&mut self, inputs: HashMap<String, Value>) {
        self.user_inputs = inputs;
    }

    pub fn user_inputs(&self) -> &HashMap<String, Value> {
        &self.user_inputs
    }

    /// Write the outputs a node produced. Every key must be new.
    pub fn add_node_outputs(
        &mut self,
        node_id: &str,
        outputs: &HashMap<String, Value>,
    ) -> Result<(), WorkflowError> {
        if RESERVED_NAMESPACES.contains(&node_id) {
            return Err(WorkflowError::VariableConflict(format!(
                "node '{}' cannot write into a reserved namespace",
                node_id
            )));
        }
        if let Some(existing) = outputs
            .keys()
            .find(|key| self.variables.contains_key(&make_key(node_id, key)))
        {
            return Err(WorkflowError::VariableConflict(format!(
                "{}.{}",
                node_id, existing
            )));
        }
        for (key, val) in outputs {
            self.variables
                .insert(make_key(node_id, key), Segment::from_value(val));
        }
        Ok(())
    }

    pub fn set_conversation_variable(&mut self, name: &str, value: Segment) {
        self.variables
            .insert(make_key(CONVERSATION_VARIABLE_NODE_ID, name), value);
    }

    pub fn get_node_variables(&self, node_id: &str) -> HashMap<String, Segment> {
        self.variables
            .iter()
            .filter_map(|(key, value)| {
                let (node, var) = split_key(key)?;
                (node == node_id).then(|| (var.to_string(), value.clone()))
            })
            .collect()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut variables: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (key, value) in &self.variables {
            if let Some((node, var)) = split_key(key) {
                variables
                    .entry(node.to_string())
                    .or_default()
                    .insert(var.to_string(), value.to_value());
            }
        }
        PoolSnapshot {
            variables,
            user_inputs: self
                .user_inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn restore(snapshot: &PoolSnapshot) -> Self {
        let mut pool = VariablePool::new();
        for (node, vars) in &snapshot.variables {
            for (var, value) in vars {
                pool.variables
                    .insert(make_key(node, var), Segment::from_value(value));
            }
        }
        pool.user_inputs = snapshot
            .user_inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pool
    }
}

impl PartialEq for VariablePool {
    fn eq(&self, other: &Self) -> bool {
        self.variables == other.variables && self.user_inputs == other.user_inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_add_and_get() {
        let mut pool = VariablePool::new();
        pool.add_node_outputs("llm1", &outputs(&[("text", json!("hi"))]))
            .unwrap();
        assert_eq!(
            pool.get(&["llm1".into(), "text".into()]),
            Segment::String("hi".into())
        );
        assert!(pool.get(&["llm1".into(), "missing".into()]).is_none());
    }

    #[test]
    fn test_write_once_per_key() {
        let mut pool = VariablePool::new();
        pool.add_node_outputs("n", &outputs(&[("x", json!(1))])).unwrap();
        let err = pool
            .add_node_outputs("n", &outputs(&[("x", json!(2))]))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::VariableConflict(_)));
        assert_eq!(pool.get(&["n".into(), "x".into()]), Segment::Integer(1));

        // a different key in the same namespace is fine
        pool.add_node_outputs("n", &outputs(&[("y", json!(2))])).unwrap();
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        let mut pool = VariablePool::new();
        assert!(pool
            .add_node_outputs("sys", &outputs(&[("query", json!("x"))]))
            .is_err());
    }

    #[test]
    fn test_conversation_variable_is_mutable() {
        let mut pool = VariablePool::new();
        pool.set_conversation_variable("count", Segment::Integer(1));
        pool.set_conversation_variable("count", Segment::Integer(2));
        assert_eq!(
            pool.get(&["conversation".into(), "count".into()]),
            Segment::Integer(2)
        );
    }

    #[test]
    fn test_nested_path_lookup() {
        let mut pool = VariablePool::new();
        pool.add_node_outputs(
            "http",
            &outputs(&[("body", json!({"items": [{"id": 7}]}))]),
        )
        .unwrap();
        let path: Vec<String> = ["http", "body", "items", "0", "id"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(pool.get(&path), Segment::Integer(7));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut pool = VariablePool::new();
        pool.seed(&Selector::new("sys", "query"), Segment::String("q".into()));
        pool.add_node_outputs(
            "a",
            &outputs(&[("list", json!(["x", "y"])), ("n", json!(1.5))]),
        )
        .unwrap();
        pool.set_user_inputs(HashMap::from([("name".to_string(), json!("bob"))]));

        let snapshot = pool.snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: PoolSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(VariablePool::restore(&decoded), pool);
    }

    #[test]
    fn test_selector_parse_value() {
        let sel = Selector::parse_value(&json!(["start", "query"])).unwrap();
        assert_eq!(sel.node_id(), "start");
        assert_eq!(sel.variable_name(), "query");
        let sel = Selector::parse_value(&json!("env.key")).unwrap();
        assert_eq!(sel.node_id(), "env");
        assert!(Selector::parse_value(&json!(42)).is_none());
    }
}
