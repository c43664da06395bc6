use std::{
    fmt,
    sync::{Arc, RwLock},
};

/// A runtime value of the host, as seen by the engine when capturing
/// arguments, locals and return values.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Symbol(String),
    Array(Vec<Value>),
    /// Keyed map, as ordered pairs.
    Map(Vec<(Value, Value)>),
    /// Shared, mutable object. Objects can reference themselves.
    Object(Arc<Object>),
}

impl Value {
    /// Name of the runtime type of the value.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Array(_) => "Array",
            Value::Map(_) => "Hash",
            Value::Object(o) => o.type_name(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn symbol<T: Into<String>>(s: T) -> Self {
        Value::Symbol(s.into())
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Short, non-recursive representation.
    pub fn summary(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Symbol(s) => format!(":{s}"),
            Value::Array(a) => format!("[{} elements]", a.len()),
            Value::Map(m) => format!("{{{} entries}}", m.len()),
            Value::Object(o) => format!("#<{}>", o.type_name()),
        }
    }
}

// Objects can be cyclic, only show one level.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(a) => f.debug_list().entries(a.iter()).finish(),
            Value::Map(m) => f
                .debug_map()
                .entries(m.iter().map(|(k, v)| (k, v)))
                .finish(),
            other => write!(f, "{}", other.summary()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map(Into::into).unwrap_or_default()
    }
}

/// Instance of a user-defined type: a type name and named fields, in
/// definition order.
pub struct Object {
    type_name: String,
    fields: RwLock<Vec<(String, Value)>>,
}

impl Object {
    pub fn new<T: Into<String>>(type_name: T) -> Self {
        Self {
            type_name: type_name.into(),
            fields: RwLock::new(Vec::new()),
        }
    }

    pub fn with_field<N: Into<String>, V: Into<Value>>(self, name: N, value: V) -> Self {
        self.set(name, value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Set a field, replacing its former value if any.
    pub fn set<N: Into<String>, V: Into<Value>>(&self, name: N, value: V) {
        let name = name.into();
        let value = value.into();
        let mut fields = self.fields.write().unwrap();
        match fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields
            .read()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Copy of the fields. The lock is released on return, so walking the
    /// values can reach this object again.
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.fields.read().unwrap().clone()
    }

    /// Copy of the first `max` fields, along with the total field count.
    pub fn first_fields(&self, max: usize) -> (Vec<(String, Value)>, usize) {
        let fields = self.fields.read().unwrap();
        (fields.iter().take(max).cloned().collect(), fields.len())
    }

    pub fn field_count(&self) -> usize {
        self.fields.read().unwrap().len()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}>", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Value::Nil => "NilClass")]
    #[test_case(Value::from(true) => "TrueClass")]
    #[test_case(Value::from(false) => "FalseClass")]
    #[test_case(Value::from(21) => "Integer")]
    #[test_case(Value::from(1.5) => "Float")]
    #[test_case(Value::from("x") => "String")]
    #[test_case(Value::symbol("x") => "Symbol")]
    #[test_case(Value::from(vec![1, 2]) => "Array")]
    #[test_case(Value::Map(Vec::new()) => "Hash")]
    #[test_case(Value::object(Object::new("Widget")) => "Widget")]
    fn type_names(v: Value) -> String {
        v.type_name().to_string()
    }

    #[test]
    fn self_reference() {
        let node = Arc::new(Object::new("Node"));
        node.set("name", "root");
        node.set("next", Value::Object(Arc::clone(&node)));

        let next = node.get("next").unwrap();
        assert!(Arc::ptr_eq(next.as_object().unwrap(), &node));
        assert_eq!(node.field_count(), 2);
        assert_eq!(format!("{next:?}"), "#<Node>");

        // Break the cycle so the object is released.
        node.set("next", Value::Nil);
    }

    #[test]
    fn set_replaces() {
        let o = Object::new("Point").with_field("x", 1).with_field("y", 2);
        o.set("x", 3);

        let fields = o.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "x");
        assert!(matches!(fields[0].1, Value::Integer(3)));
    }

    #[test]
    fn first_fields() {
        let o = Object::new("Point")
            .with_field("x", 1)
            .with_field("y", 2)
            .with_field("z", 3);

        let (fields, total) = o.first_fields(2);
        assert_eq!(total, 3);
        let names: Vec<_> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(o.first_fields(5).0.len(), 3);
    }
}
