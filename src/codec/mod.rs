/// Mapping between configuration structures and flat key paths.
///
/// A structure is serialized through `serde`, so the key path segments are the
/// serialized field names (use `#[serde(rename_all = "PascalCase")]` and friends
/// to control them). Decoding is driven by a [`Schema`] derived once per target
/// type from its `Default` value.
pub mod keypath;
mod lenient;
/// Per-type schema describing which key paths a structure accepts.
pub mod schema;

pub use keypath::{flatten, unflatten};
pub use schema::{LeafKind, Node, Schema};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Types that can be stored as a configuration tree and decoded back.
///
/// Implemented for every `Serialize + DeserializeOwned + Default` type, which
/// covers structures of primitives, nested structures, optionals and
/// string-keyed maps of primitives.
pub trait Configuration: Serialize + DeserializeOwned + Default + Send + 'static {}

impl<T> Configuration for T where T: Serialize + DeserializeOwned + Default + Send + 'static {}
