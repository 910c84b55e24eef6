//! The Configuration kind: a cluster-scoped, typed bag of flags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectList, ObjectMeta, Resource, TypeMeta};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Immutable after create; exposed to field selectors as `type`.
    #[serde(default, rename = "type")]
    pub type_: String,
    /// Editable key/value flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, String>,
}

pub type ConfigurationList = ObjectList<Configuration>;

impl Configuration {
    pub fn new(name: &str, type_: &str) -> Self {
        let mut c = Self { type_: type_.to_string(), ..Default::default() };
        c.metadata.name = name.to_string();
        c.fill_type_meta();
        c
    }

    pub fn with_label(mut self, k: &str, v: &str) -> Self {
        self.metadata.labels.insert(k.to_string(), v.to_string());
        self
    }

    pub fn with_flag(mut self, k: &str, v: &str) -> Self {
        self.flags.insert(k.to_string(), v.to_string());
        self
    }
}

impl Resource for Configuration {
    const KIND: &'static str = "Configuration";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "configurations";
    const NAMESPACED: bool = false;

    fn type_meta(&self) -> &TypeMeta {
        &self.type_meta
    }

    fn type_meta_mut(&mut self) -> &mut TypeMeta {
        &mut self.type_meta
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let c = Configuration::new("db", "postgres").with_label("team", "a").with_flag("max_conn", "10");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["kind"], "Configuration");
        assert_eq!(v["apiVersion"], "v1");
        assert_eq!(v["metadata"]["name"], "db");
        assert_eq!(v["metadata"]["labels"]["team"], "a");
        assert_eq!(v["type"], "postgres");
        assert_eq!(v["flags"]["max_conn"], "10");
        assert!(v["metadata"].get("namespace").is_none());
        assert!(v["metadata"].get("resourceVersion").is_none());

        let back: Configuration = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn list_kind_is_derived() {
        let l = ConfigurationList::new(vec![Configuration::new("a", "x")], 7);
        let v = serde_json::to_value(&l).unwrap();
        assert_eq!(v["kind"], "ConfigurationList");
        assert_eq!(v["metadata"]["resourceVersion"], "7");
        assert_eq!(v["items"][0]["metadata"]["name"], "a");
    }
}
