//! Field validation for Configuration objects. Every violation is collected;
//! nothing is coerced.

use std::collections::BTreeMap;

use keel_core::{Configuration, FieldError, ObjectMeta};
use once_cell::sync::Lazy;
use regex::Regex;

pub const DNS1123_LABEL_MAX: usize = 63;
pub const DNS1123_SUBDOMAIN_MAX: usize = 253;
pub const QUALIFIED_NAME_MAX: usize = 63;
pub const LABEL_VALUE_MAX: usize = 63;
pub const FLAG_KEY_MAX: usize = 253;
pub const TOTAL_ANNOTATION_SIZE_MAX: usize = 256 * 1024;

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("valid regex")
});
static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").expect("valid regex"));
static FLAG_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid regex"));

pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= DNS1123_LABEL_MAX && DNS1123_LABEL.is_match(s)
}

pub fn is_dns1123_subdomain(s: &str) -> bool {
    s.len() <= DNS1123_SUBDOMAIN_MAX && DNS1123_SUBDOMAIN.is_match(s)
}

pub fn is_qualified_name(s: &str) -> bool {
    s.len() <= QUALIFIED_NAME_MAX && QUALIFIED_NAME.is_match(s)
}

/// All violations in `cfg`, in field order. Empty means valid.
pub fn validate_configuration(cfg: &Configuration) -> Vec<FieldError> {
    let mut errs = validate_object_meta(&cfg.metadata);
    if cfg.type_.is_empty() {
        errs.push(FieldError::required("type", "type is required"));
    } else if cfg.type_.len() > DNS1123_LABEL_MAX {
        errs.push(FieldError::too_long("type", &cfg.type_, DNS1123_LABEL_MAX));
    } else if !is_dns1123_label(&cfg.type_) {
        errs.push(FieldError::invalid("type", &cfg.type_, "must be a DNS-1123 label (lowercase alphanumerics and '-')"));
    }
    for key in cfg.flags.keys() {
        let field = format!("flags[{}]", key);
        if key.is_empty() {
            errs.push(FieldError::required("flags", "flag keys must be non-empty"));
        } else if key.len() > FLAG_KEY_MAX {
            errs.push(FieldError::too_long(field, key, FLAG_KEY_MAX));
        } else if !FLAG_KEY.is_match(key) {
            errs.push(FieldError::invalid(field, key, "must consist of alphanumerics, '-', '_' or '.'"));
        }
    }
    errs
}

pub fn validate_object_meta(meta: &ObjectMeta) -> Vec<FieldError> {
    let mut errs = Vec::new();
    if meta.name.is_empty() {
        errs.push(FieldError::required("metadata.name", "name is required"));
    } else if meta.name.len() > DNS1123_SUBDOMAIN_MAX {
        errs.push(FieldError::too_long("metadata.name", &meta.name, DNS1123_SUBDOMAIN_MAX));
    } else if !is_dns1123_subdomain(&meta.name) {
        errs.push(FieldError::invalid(
            "metadata.name",
            &meta.name,
            "must be a DNS-1123 subdomain (lowercase alphanumerics, '-' or '.', starting and ending alphanumeric)",
        ));
    }
    validate_labels(&meta.labels, &mut errs);
    validate_annotations(&meta.annotations, &mut errs);
    errs
}

fn validate_labels(labels: &BTreeMap<String, String>, errs: &mut Vec<FieldError>) {
    for (k, v) in labels {
        validate_key("metadata.labels", k, errs);
        if v.is_empty() {
            continue;
        }
        let field = format!("metadata.labels[{}]", k);
        if v.len() > LABEL_VALUE_MAX {
            errs.push(FieldError::too_long(field, v, LABEL_VALUE_MAX));
        } else if !QUALIFIED_NAME.is_match(v) {
            errs.push(FieldError::invalid(field, v, "label values must be empty or alphanumerics with '-', '_' or '.'"));
        }
    }
}

fn validate_annotations(annotations: &BTreeMap<String, String>, errs: &mut Vec<FieldError>) {
    let mut total = 0usize;
    for (k, v) in annotations {
        validate_key("metadata.annotations", k, errs);
        total += k.len() + v.len();
    }
    if total > TOTAL_ANNOTATION_SIZE_MAX {
        errs.push(FieldError::too_long("metadata.annotations", format!("{} bytes", total), TOTAL_ANNOTATION_SIZE_MAX));
    }
}

/// `[prefix/]name` where prefix is a DNS subdomain and name a qualified name.
fn validate_key(path: &str, key: &str, errs: &mut Vec<FieldError>) {
    let field = format!("{}[{}]", path, key);
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || !is_dns1123_subdomain(p) {
            errs.push(FieldError::invalid(&field, key, "prefix part must be a DNS-1123 subdomain"));
        }
    }
    if name.is_empty() {
        errs.push(FieldError::invalid(&field, key, "name part must be non-empty"));
    } else if name.len() > QUALIFIED_NAME_MAX {
        errs.push(FieldError::too_long(&field, key, QUALIFIED_NAME_MAX));
    } else if !QUALIFIED_NAME.is_match(name) {
        errs.push(FieldError::invalid(
            &field,
            key,
            "name part must be alphanumerics with '-', '_' or '.', starting and ending alphanumeric",
        ));
    }
}
