//! Equality-based label/field selectors.
//!
//! Grammar: comma-separated requirements, each one of `k=v`, `k==v`, `k!=v`,
//! `k` (key exists) or `!k` (key absent). The empty string selects everything.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ApiError;

/// Attribute set a selector is evaluated against.
pub type Set = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Equals(String),
    NotEquals(String),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub op: Op,
}

impl Requirement {
    pub fn matches(&self, set: &Set) -> bool {
        match &self.op {
            Op::Equals(v) => set.get(&self.key) == Some(v),
            // A missing key satisfies `!=`.
            Op::NotEquals(v) => set.get(&self.key) != Some(v),
            Op::Exists => set.contains_key(&self.key),
            Op::DoesNotExist => !set.contains_key(&self.key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    /// Selector matching every set.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.reqs
    }

    pub fn matches(&self, set: &Set) -> bool {
        self.reqs.iter().all(|r| r.matches(set))
    }

    pub fn parse(s: &str) -> Result<Self, ApiError> {
        let mut reqs = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self { reqs });
        }
        for raw in s.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                return Err(ApiError::BadRequest(format!("invalid selector {:?}: empty requirement", s)));
            }
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement { key: key(k, s)?, op: Op::NotEquals(value(v, s)?) }
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement { key: key(k, s)?, op: Op::Equals(value(v, s)?) }
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement { key: key(k, s)?, op: Op::Equals(value(v, s)?) }
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement { key: key(k, s)?, op: Op::DoesNotExist }
            } else {
                Requirement { key: key(term, s)?, op: Op::Exists }
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }
}

fn key(k: &str, whole: &str) -> Result<String, ApiError> {
    let k = k.trim();
    if k.is_empty() || k.chars().any(|c| c.is_whitespace() || "=!,".contains(c)) {
        return Err(ApiError::BadRequest(format!("invalid selector {:?}: bad key {:?}", whole, k)));
    }
    Ok(k.to_string())
}

fn value(v: &str, whole: &str) -> Result<String, ApiError> {
    let v = v.trim();
    if v.chars().any(|c| c.is_whitespace() || "=!,".contains(c)) {
        return Err(ApiError::BadRequest(format!("invalid selector {:?}: bad value {:?}", whole, v)));
    }
    Ok(v.to_string())
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match &r.op {
                Op::Equals(v) => write!(f, "{}={}", r.key, v)?,
                Op::NotEquals(v) => write!(f, "{}!={}", r.key, v)?,
                Op::Exists => f.write_str(&r.key)?,
                Op::DoesNotExist => write!(f, "!{}", r.key)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Selector {
    type Err = ApiError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
