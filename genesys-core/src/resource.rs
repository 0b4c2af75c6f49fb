//! Resource - Representing resources and their state

use std::collections::HashMap;

/// Unique identifier for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// Resource type (e.g., "oauth_client", "routing_wrapupcode")
    pub resource_type: String,
    /// Resource name (the label given in configuration)
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null, kept only where position matters (list elements)
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// An empty list, an empty map, or a list holding a single empty map.
    ///
    /// The API returns nested blocks that were never set in any of these
    /// shapes, so they compare equal to each other.
    pub fn is_empty_block(&self) -> bool {
        match self {
            Value::List(items) => match items.as_slice() {
                [] => true,
                [Value::Map(m)] => m.is_empty(),
                _ => false,
            },
            Value::Map(m) => m.is_empty(),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", key, map[key])?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Desired state declared in configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub attributes: HashMap<String, Value>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Current state fetched from the remote API
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: ResourceId,
    /// Remote identifier (usually a GUID assigned by the API)
    pub identifier: Option<String>,
    pub attributes: HashMap<String, Value>,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: HashMap::new(),
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: HashMap<String, Value>) -> Self {
        Self {
            id,
            identifier: None,
            attributes,
            exists: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_shapes() {
        assert!(Value::List(vec![]).is_empty_block());
        assert!(Value::Map(HashMap::new()).is_empty_block());
        assert!(Value::List(vec![Value::Map(HashMap::new())]).is_empty_block());
        assert!(!Value::List(vec![Value::Int(1)]).is_empty_block());
        assert!(!Value::String(String::new()).is_empty_block());
    }

    #[test]
    fn value_display_sorts_map_keys() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), Value::Int(2));
        map.insert("a".to_string(), Value::Bool(true));
        let value = Value::List(vec![Value::String("x".into()), Value::Map(map), Value::Null]);
        assert_eq!(value.to_string(), r#"["x", {a = true, b = 2}, null]"#);
    }

    #[test]
    fn state_with_identifier() {
        let state = State::existing(ResourceId::new("oauth_client", "ci"), HashMap::new())
            .with_identifier("abc-123");
        assert!(state.exists);
        assert_eq!(state.identifier.as_deref(), Some("abc-123"));
        assert_eq!(state.id.to_string(), "oauth_client.ci");
    }
}
