//! Mongo-style update operators over JSON documents.
//!
//! This is the single implementation used both by the state cache (live
//! in-memory mutation) and by the stores when replaying an operator doc at
//! flush time, so the two can never drift apart.

use ethnum::U256;
use serde_json::{Map, Value};

use crate::errors::{DbError, DbResult};

/// Applies an operator document (`{"$set": {...}, "$inc": {...}}`) to a
/// doc in place.
pub fn apply_update(doc: &mut Value, update: &Value) -> DbResult<()> {
    if !doc.is_object() {
        return Err(DbError::NotAnObject);
    }
    let ops = update.as_object().ok_or(DbError::MalformedUpdate)?;

    for (op, args) in ops {
        let args = args.as_object().ok_or(DbError::MalformedUpdate)?;
        for (path, arg) in args {
            match op.as_str() {
                "$set" => set_path(doc, path, arg.clone()),
                "$unset" => {
                    unset_path(doc, path);
                }
                "$inc" => inc_path(doc, path, arg)?,
                "$push" => push_path(doc, path, arg.clone())?,
                "$pull" => pull_path(doc, path, arg),
                other => return Err(DbError::UnknownOperator(other.to_owned())),
            }
        }
    }
    Ok(())
}

/// Walks to the parent object of a dotted path, optionally creating
/// intermediate objects.  Returns the parent map and the final segment.
fn path_parent_mut<'a>(
    root: &'a mut Value,
    path: &str,
    create: bool,
) -> Option<(&'a mut Map<String, Value>, String)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop()?.to_owned();

    let mut cur = root;
    for seg in segments {
        let map = cur.as_object_mut()?;
        if !map.contains_key(seg) {
            if !create {
                return None;
            }
            map.insert(seg.to_owned(), Value::Object(Map::new()));
        }
        cur = map.get_mut(seg)?;
        if !cur.is_object() {
            return None;
        }
    }
    cur.as_object_mut().map(|m| (m, last))
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    if let Some((parent, key)) = path_parent_mut(doc, path, true) {
        parent.insert(key, value);
    }
}

fn unset_path(doc: &mut Value, path: &str) -> Option<Value> {
    let (parent, key) = path_parent_mut(doc, path, false)?;
    parent.remove(&key)
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn inc_path(doc: &mut Value, path: &str, inc: &Value) -> DbResult<()> {
    let cur = get_path(doc, path).cloned().unwrap_or(Value::Null);
    let next = inc_value(&cur, inc, path)?;
    set_path(doc, path, next);
    Ok(())
}

/// Numeric addition across the mixed number/decimal-string amount
/// representations.  A result touching a string operand stays a string.
fn inc_value(cur: &Value, inc: &Value, path: &str) -> DbResult<Value> {
    // Absent fields initialize to the increment itself.
    if cur.is_null() {
        return match inc {
            Value::Number(_) | Value::String(_) => Ok(inc.clone()),
            _ => Err(DbError::IncNotNumeric(path.to_owned())),
        };
    }

    let string_result = cur.is_string() || inc.is_string();
    if string_result {
        let cur_n = value_to_u256(cur, path)?;
        let next = match inc {
            Value::String(_) => cur_n
                .checked_add(value_to_u256(inc, path)?)
                .ok_or_else(|| DbError::IncOutOfRange(path.to_owned()))?,
            Value::Number(n) => {
                let d = n
                    .as_i64()
                    .ok_or_else(|| DbError::IncNotNumeric(path.to_owned()))?;
                if d >= 0 {
                    cur_n
                        .checked_add(U256::from(d as u64))
                        .ok_or_else(|| DbError::IncOutOfRange(path.to_owned()))?
                } else {
                    cur_n
                        .checked_sub(U256::from(d.unsigned_abs()))
                        .ok_or_else(|| DbError::IncOutOfRange(path.to_owned()))?
                }
            }
            _ => return Err(DbError::IncNotNumeric(path.to_owned())),
        };
        return Ok(Value::String(next.to_string()));
    }

    let (Value::Number(a), Value::Number(b)) = (cur, inc) else {
        return Err(DbError::IncNotNumeric(path.to_owned()));
    };
    let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) else {
        return Err(DbError::IncNotNumeric(path.to_owned()));
    };
    let sum = a
        .checked_add(b)
        .ok_or_else(|| DbError::IncOutOfRange(path.to_owned()))?;
    Ok(Value::from(sum))
}

fn value_to_u256(v: &Value, path: &str) -> DbResult<U256> {
    match v {
        Value::String(s) => U256::from_str_radix(s, 10)
            .map_err(|_| DbError::IncNotNumeric(path.to_owned())),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| DbError::IncNotNumeric(path.to_owned())),
        _ => Err(DbError::IncNotNumeric(path.to_owned())),
    }
}

fn push_path(doc: &mut Value, path: &str, value: Value) -> DbResult<()> {
    let cur = get_path(doc, path);
    match cur {
        None => {
            set_path(doc, path, Value::Array(vec![value]));
            Ok(())
        }
        Some(Value::Array(_)) => {
            if let Some((parent, key)) = path_parent_mut(doc, path, false) {
                if let Some(Value::Array(arr)) = parent.get_mut(&key) {
                    arr.push(value);
                }
            }
            Ok(())
        }
        Some(_) => Err(DbError::PushNotArray(path.to_owned())),
    }
}

fn pull_path(doc: &mut Value, path: &str, predicate: &Value) {
    let Some((parent, key)) = path_parent_mut(doc, path, false) else {
        return;
    };
    let Some(Value::Array(arr)) = parent.get_mut(&key) else {
        return;
    };
    arr.retain(|el| !pull_matches(el, predicate));
}

/// Object predicates match when every predicate key equals the element's;
/// anything else matches by plain equality.
fn pull_matches(el: &Value, predicate: &Value) -> bool {
    match predicate.as_object() {
        Some(pred) if !pred.is_empty() => {
            let Some(el) = el.as_object() else {
                return false;
            };
            pred.iter().all(|(k, v)| el.get(k) == Some(v))
        }
        _ => el == predicate,
    }
}
