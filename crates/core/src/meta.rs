//! Object and list metadata plus the `Resource` trait every stored kind implements.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Kind/apiVersion pair carried on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, rename = "apiVersion", skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Decimal store revision of the last write. Never persisted inside the value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// RFC 3339, UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
}

/// A persisted, named, versioned kind.
///
/// `Default` doubles as the kind's "new empty object" factory and `ObjectList<Self>`
/// as its list factory.
pub trait Resource: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
    const API_VERSION: &'static str;
    /// Lowercase plural used in URLs and store keys.
    const PLURAL: &'static str;
    const NAMESPACED: bool;

    fn type_meta(&self) -> &TypeMeta;
    fn type_meta_mut(&mut self) -> &mut TypeMeta;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Stamp kind/apiVersion for this type.
    fn fill_type_meta(&mut self) {
        let tm = self.type_meta_mut();
        tm.kind = Self::KIND.to_string();
        tm.api_version = Self::API_VERSION.to_string();
    }
}

/// Ordered snapshot of one kind taken at `metadata.resource_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ObjectList<T> {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T: Resource> ObjectList<T> {
    pub fn new(items: Vec<T>, resource_version: u64) -> Self {
        Self {
            type_meta: TypeMeta { kind: format!("{}List", T::KIND), api_version: T::API_VERSION.to_string() },
            metadata: ListMeta { resource_version: resource_version.to_string() },
            items,
        }
    }
}

impl<T> Default for ObjectList<T> {
    fn default() -> Self {
        Self { type_meta: TypeMeta::default(), metadata: ListMeta::default(), items: Vec::new() }
    }
}

/// Options accepted by delete. `resource_version` is an optional precondition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}
