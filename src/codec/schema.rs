use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde_json::{Map, Number, Value};

use crate::codec::Configuration;
use crate::{Error, Result};

/// Primitive type of a leaf field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Bool,
    Integer,
    Float,
    Text,
}

impl LeafKind {
    /// Parses a stored value as this kind.
    pub fn parse(self, key: &str, raw: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Decoding(format!("{}: stored value is not valid UTF-8", key)))?;
        let mismatch = || Error::Decoding(format!("{}: cannot parse {:?} as {}", key, text, self.name()));
        match self {
            LeafKind::Text => Ok(Value::String(text.to_string())),
            LeafKind::Bool => parse_bool(text.trim()).map(Value::Bool).ok_or_else(mismatch),
            LeafKind::Integer => {
                let trimmed = text.trim();
                trimmed
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| trimmed.parse::<u64>().map(Value::from))
                    .map_err(|_| mismatch())
            }
            LeafKind::Float => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
        }
    }

    fn name(self) -> &'static str {
        match self {
            LeafKind::Bool => "boolean",
            LeafKind::Integer => "integer",
            LeafKind::Float => "floating point",
            LeafKind::Text => "string",
        }
    }
}

pub(crate) fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Shape of one position in a configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafKind),
    /// Known fields. Keys outside them are still kept as text, so a map whose
    /// default already has entries accepts new ones.
    Struct(BTreeMap<String, Node>),
    /// Open string-keyed map; every key below it is kept as text until the
    /// target type says what it is.
    Map,
    /// Unset optional. Holds the stored text, or a map of it for an optional structure.
    Unset,
    /// Sequences. Keys landing here are ignored.
    Opaque,
}

impl Node {
    fn describe(value: &Value) -> Node {
        match value {
            Value::Bool(_) => Node::Leaf(LeafKind::Bool),
            Value::Number(n) if n.is_f64() => Node::Leaf(LeafKind::Float),
            Value::Number(_) => Node::Leaf(LeafKind::Integer),
            Value::String(_) => Node::Leaf(LeafKind::Text),
            Value::Object(fields) if fields.is_empty() => Node::Map,
            Value::Object(fields) => Node::Struct(
                fields
                    .iter()
                    .map(|(name, field)| (name.clone(), Node::describe(field)))
                    .collect(),
            ),
            Value::Null => Node::Unset,
            Value::Array(_) => Node::Opaque,
        }
    }
}

/// Decoding plan for one configuration type: its shape plus its default values.
#[derive(Debug)]
pub struct Schema {
    root: Node,
    defaults: Value,
}

impl Schema {
    /// Returns the cached schema for `T`, building it on first use.
    pub fn of<T: Configuration>() -> Result<Arc<Schema>> {
        static CACHE: OnceLock<RwLock<HashMap<TypeId, Arc<Schema>>>> = OnceLock::new();
        let cache = CACHE.get_or_init(Default::default);
        let id = TypeId::of::<T>();

        if let Some(schema) = cache.read().unwrap_or_else(PoisonError::into_inner).get(&id) {
            return Ok(schema.clone());
        }

        let defaults = serde_json::to_value(T::default())
            .map_err(|e| Error::Encoding(format!("cannot describe {}: {}", std::any::type_name::<T>(), e)))?;
        let schema = Arc::new(Schema::from_defaults(defaults));
        let mut cache = cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(id).or_insert(schema).clone())
    }

    /// Builds a schema from a serialized default value.
    ///
    /// A `null` root (for example `serde_json::Value`) becomes an open map.
    pub fn from_defaults(defaults: Value) -> Self {
        match defaults {
            Value::Null => Self {
                root: Node::Map,
                defaults: Value::Object(Map::new()),
            },
            defaults => Self {
                root: Node::describe(&defaults),
                defaults,
            },
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    /// Writes the stored value for `key` into `doc`, which must start out as a copy of [`Schema::defaults`].
    ///
    /// Keys running past a leaf or into a sequence are skipped. Other keys the
    /// schema does not know are kept as text for the deserializer to sort out.
    pub fn assign(&self, doc: &mut Value, key: &str, raw: &[u8]) -> Result<()> {
        let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        let mut node = &self.root;
        let mut slot = doc;

        for (depth, segment) in segments.iter().enumerate() {
            match node {
                Node::Struct(fields) => {
                    let Some(next) = fields.get(*segment) else {
                        return insert_text(slot, &segments[depth..], key, raw);
                    };
                    node = next;
                    slot = match slot.as_object_mut().and_then(|o| o.get_mut(*segment)) {
                        Some(s) => s,
                        None => return Ok(()),
                    };
                }
                Node::Map => return insert_text(slot, &segments[depth..], key, raw),
                Node::Unset => {
                    if !slot.is_object() {
                        *slot = Value::Object(Map::new());
                    }
                    return insert_text(slot, &segments[depth..], key, raw);
                }
                Node::Leaf(_) | Node::Opaque => return Ok(()),
            }
        }

        match node {
            Node::Leaf(kind) => *slot = kind.parse(key, raw)?,
            Node::Unset => *slot = LeafKind::Text.parse(key, raw)?,
            _ => {}
        }
        Ok(())
    }
}

fn insert_text(slot: &mut Value, rest: &[&str], key: &str, raw: &[u8]) -> Result<()> {
    let Some((last, parents)) = rest.split_last() else {
        return Ok(());
    };
    let text = LeafKind::Text.parse(key, raw)?;

    let mut current = slot;
    for segment in parents {
        let Value::Object(object) = current else {
            return Ok(());
        };
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Value::Object(object) = current {
        object.insert(last.to_string(), text);
    }
    Ok(())
}
