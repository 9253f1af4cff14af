use serde_json::Value;

/// Documents are plain JSON objects.  The primary key lives inside the doc
/// (`name` for accounts, `_id` elsewhere) but is always passed alongside so
/// the store never has to know per-collection key rules.
pub type Document = Value;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Options for `find`: sort fields applied in order, then a limit.
#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted_desc(field: &str) -> Self {
        Self {
            sort: vec![(field.to_owned(), SortOrder::Desc)],
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn then_desc(mut self, field: &str) -> Self {
        self.sort.push((field.to_owned(), SortOrder::Desc));
        self
    }
}

/// One entry of an unordered bulk write.
#[derive(Clone, Debug)]
pub enum BulkOp {
    Insert {
        collection: String,
        key: String,
        doc: Document,
    },
    /// Apply a Mongo-style operator document; creates the doc when absent.
    Update {
        collection: String,
        key: String,
        ops: Value,
    },
    Replace {
        collection: String,
        key: String,
        doc: Document,
    },
    Delete {
        collection: String,
        key: String,
    },
}

impl BulkOp {
    pub fn collection(&self) -> &str {
        match self {
            BulkOp::Insert { collection, .. } => collection,
            BulkOp::Update { collection, .. } => collection,
            BulkOp::Replace { collection, .. } => collection,
            BulkOp::Delete { collection, .. } => collection,
        }
    }
}

/// Orders two JSON values for sort purposes: null, then numbers, then
/// strings.  Mixed-type fields compare by that rank, which is enough for
/// the warmup queries (numeric weights and timestamps).
pub fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(0.0);
            let yf = y.as_f64().unwrap_or(0.0);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Applies `FindOptions` to a scanned doc set.
pub fn apply_find_options(mut docs: Vec<Document>, opts: &FindOptions) -> Vec<Document> {
    if !opts.sort.is_empty() {
        docs.sort_by(|a, b| {
            for (field, order) in &opts.sort {
                let av = a.get(field).unwrap_or(&Value::Null);
                let bv = b.get(field).unwrap_or(&Value::Null);
                let ord = match order {
                    SortOrder::Asc => compare_values(av, bv),
                    SortOrder::Desc => compare_values(bv, av),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    if let Some(limit) = opts.limit {
        docs.truncate(limit);
    }
    docs
}
