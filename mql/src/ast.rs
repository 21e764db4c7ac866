//! Abstract Syntax Tree for MQL documents

use crate::value::Value;
use std::fmt;

/// A dotted field path such as `address.city`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True for the top-level `_id` field
    pub fn is_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == "_id"
    }

    /// Whether `self` is `other` or lies below it
    pub fn starts_with(&self, other: &FieldPath) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    pub fn from_operator(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(CmpOp::Eq),
            "$ne" => Some(CmpOp::Ne),
            "$gt" => Some(CmpOp::Gt),
            "$gte" => Some(CmpOp::Gte),
            "$lt" => Some(CmpOp::Lt),
            "$lte" => Some(CmpOp::Lte),
            _ => None,
        }
    }

    /// The SQL operator token
    pub fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }
}

/// A parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// The empty filter: matches every document
    All,
    Compare {
        path: FieldPath,
        op: CmpOp,
        value: Value,
    },
    In {
        path: FieldPath,
        values: Vec<Value>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

/// A parsed update specification
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `$set` / `$unset` / `$inc` operators, applied in order
    Operators(Vec<UpdateOp>),
    /// A whole replacement document; `_id` is carried over from the original
    Replace(crate::value::Document),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(FieldPath, Value),
    Unset(FieldPath),
    Inc(FieldPath, Value),
}

impl UpdateOp {
    pub fn path(&self) -> &FieldPath {
        match self {
            UpdateOp::Set(p, _) | UpdateOp::Unset(p) | UpdateOp::Inc(p, _) => p,
        }
    }
}

/// A parsed find projection
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only the listed paths (plus `_id` unless `include_id` is false)
    Include {
        paths: Vec<FieldPath>,
        include_id: bool,
    },
    /// Drop the listed paths
    Exclude { paths: Vec<FieldPath> },
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// One `ORDER BY` key
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub path: FieldPath,
    pub direction: SortDirection,
}
