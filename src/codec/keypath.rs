use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::lenient::Lenient;
use crate::codec::{Configuration, Schema};
use crate::{join_key, ConfigTree, Error, Result};

/// Flattens `value` into one `(key, text)` pair per primitive leaf, keyed under `prefix`.
///
/// Nested structures and maps contribute one path segment per level. Unset
/// optional fields are skipped; sequences are rejected.
pub fn flatten<S: Serialize + ?Sized>(value: &S, prefix: &str) -> Result<ConfigTree> {
    let tree = serde_json::to_value(value).map_err(|e| Error::Encoding(e.to_string()))?;
    let fields = match tree {
        Value::Object(fields) => fields,
        other => {
            return Err(Error::Encoding(format!(
                "expected a structure or map at the root, found {}",
                type_of(&other)
            )))
        }
    };

    let mut pairs = ConfigTree::new();
    flatten_object(&fields, prefix, &mut pairs)?;
    Ok(pairs)
}

fn flatten_object(fields: &Map<String, Value>, prefix: &str, out: &mut ConfigTree) -> Result<()> {
    for (name, value) in fields {
        if name.is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(Error::Encoding(format!(
                "field name {:?} under {:?} cannot be used as a path segment",
                name, prefix
            )));
        }
        let key = join_key(prefix, name);
        match value {
            Value::Object(nested) => flatten_object(nested, &key, out)?,
            Value::Null => {}
            Value::Array(_) => {
                return Err(Error::Encoding(format!("{}: sequences are not supported", key)));
            }
            Value::Bool(b) => {
                out.insert(key, b.to_string().into_bytes());
            }
            Value::Number(n) => {
                out.insert(key, n.to_string().into_bytes());
            }
            Value::String(s) => {
                out.insert(key, s.clone().into_bytes());
            }
        }
    }
    Ok(())
}

/// Decodes `pairs` (keyed relative to the structure root) into `T`.
///
/// Keys `T` has no field for are ignored and fields without a key keep their
/// default value. A present value that does not parse as its field's type is a
/// [`Error::Decoding`]. Map values and optionals are parsed once the target
/// type names their primitive type.
pub fn unflatten<T: Configuration>(pairs: &ConfigTree) -> Result<T> {
    let schema = Schema::of::<T>()?;
    let mut doc = schema.defaults().clone();
    for (key, raw) in pairs {
        schema.assign(&mut doc, key, raw)?;
    }
    T::deserialize(Lenient(doc)).map_err(|e| Error::Decoding(e.to_string()))
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a map",
    }
}
