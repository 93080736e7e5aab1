//! Simple indexed-field filtering over [`crate::Record`] collections.

/// A value extracted from a record for indexing and filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    pub(crate) fn as_text(&self) -> String {
        match self {
            IndexValue::Text(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => b.to_string(),
        }
    }

    pub(crate) fn as_num(&self) -> Option<f64> {
        match self {
            IndexValue::Int(i) => Some(*i as f64),
            IndexValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            IndexValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

/// One `field op value` clause. [`Store::query`](crate::Store::query) ANDs
/// every filter passed to it.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: IndexValue) -> Self {
        Self { field: field.into(), op, value }
    }

    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub(crate) fn matches(&self, candidate: &IndexValue) -> bool {
        match self.op {
            FilterOp::Eq => candidate == &self.value,
            FilterOp::Ne => candidate != &self.value,
            FilterOp::Contains => candidate.as_text().contains(&self.value.as_text()),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                match (candidate.as_num(), self.value.as_num()) {
                    (Some(a), Some(b)) => match self.op {
                        FilterOp::Gt => a > b,
                        FilterOp::Gte => a >= b,
                        FilterOp::Lt => a < b,
                        FilterOp::Lte => a <= b,
                        _ => unreachable!(),
                    },
                    _ => false,
                }
            }
        }
    }
}
