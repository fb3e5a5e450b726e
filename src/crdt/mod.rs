// Per-column CRDT merge engine.
//
// Invoked when an insert with `ON CONFLICT MERGE` collides with an existing
// primary key. Each column dispatches to the resolver named by its declared
// merge policy; columns without a policy fall back to last-writer-wins keyed
// by the commit sequence.
//
// Stateful policies carry their state inside `Value::Array` in canonical
// (sorted, deduplicated) form:
// - `orset`:       array of `[element, tag]` pairs
// - `mv_register`: array of `[stamp, value]` pairs
// - `map_lww`:     array of `[key, value, stamp]` triples

use crate::error::{DbError, Result};
use crate::types::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared merge policy for a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Last-writer-wins by companion stamp, ties by (txn_id, site_id).
    Lww,
    /// Numeric addition of the incoming delta.
    Sum,
    /// Numeric addition clamped to `[lo, hi]`.
    SumBounded { lo: f64, hi: f64 },
    /// Lattice join under the value total order.
    Max,
    /// Lattice meet under the value total order.
    Min,
    /// Grow-only set union.
    GSet,
    /// Observed-remove set over uniquely tagged elements.
    OrSet,
    /// Multi-value register: concurrent values survive until a causally
    /// greater write replaces them.
    MvRegister,
    /// Per-key last-writer-wins map.
    MapLww,
}

impl MergePolicy {
    /// Parses a policy name with optional numeric arguments, as written in
    /// a column's `MERGE <policy>` option.
    pub fn parse(name: &str, args: &[f64]) -> Result<MergePolicy> {
        let lower = name.to_ascii_lowercase();
        match (lower.as_str(), args) {
            ("lww", []) => Ok(MergePolicy::Lww),
            ("sum", []) => Ok(MergePolicy::Sum),
            ("sum_bounded", [lo, hi]) => {
                if lo > hi {
                    return Err(DbError::Semantic(format!(
                        "sum_bounded bounds out of order: [{}, {}]",
                        lo, hi
                    )));
                }
                Ok(MergePolicy::SumBounded { lo: *lo, hi: *hi })
            }
            ("max", []) => Ok(MergePolicy::Max),
            ("min", []) => Ok(MergePolicy::Min),
            ("gset", []) => Ok(MergePolicy::GSet),
            ("orset", []) => Ok(MergePolicy::OrSet),
            ("mv_register", []) => Ok(MergePolicy::MvRegister),
            ("map_lww", []) => Ok(MergePolicy::MapLww),
            _ => Err(DbError::Semantic(format!(
                "unknown merge policy {}({})",
                name,
                args.len()
            ))),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Lww => write!(f, "lww"),
            MergePolicy::Sum => write!(f, "sum"),
            MergePolicy::SumBounded { lo, hi } => write!(f, "sum_bounded({},{})", lo, hi),
            MergePolicy::Max => write!(f, "max"),
            MergePolicy::Min => write!(f, "min"),
            MergePolicy::GSet => write!(f, "gset"),
            MergePolicy::OrSet => write!(f, "orset"),
            MergePolicy::MvRegister => write!(f, "mv_register"),
            MergePolicy::MapLww => write!(f, "map_lww"),
        }
    }
}

/// Causal metadata handed to a resolver invocation.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext {
    /// Stamp of the stored value (commit sequence of its version).
    pub existing_stamp: u64,
    /// Stamp the merging write will commit under.
    pub incoming_stamp: u64,
    /// Transaction that created the stored value.
    pub existing_txn: u32,
    /// Transaction performing the merge.
    pub incoming_txn: u32,
    /// Site identifier; a single-node engine always reports 0.
    pub site_id: u32,
}

/// Merges `incoming` into `existing` under `policy`.
pub fn merge(
    policy: &MergePolicy,
    existing: &Value,
    incoming: &Value,
    ctx: &MergeContext,
) -> Result<Value> {
    if incoming.is_null() && !matches!(policy, MergePolicy::Lww) {
        // Absent input is identity for every stateful resolver.
        return Ok(existing.clone());
    }
    match policy {
        MergePolicy::Lww => Ok(lww(existing, incoming, ctx)),
        MergePolicy::Sum => value_add(existing, incoming),
        MergePolicy::SumBounded { lo, hi } => {
            let sum = value_add(existing, incoming)?;
            clamp(&sum, *lo, *hi)
        }
        MergePolicy::Max => Ok(std::cmp::max(existing, incoming).clone()),
        MergePolicy::Min => {
            if existing.is_null() {
                Ok(incoming.clone())
            } else if incoming.is_null() {
                Ok(existing.clone())
            } else {
                Ok(std::cmp::min(existing, incoming).clone())
            }
        }
        MergePolicy::GSet => gset_union(existing, incoming),
        MergePolicy::OrSet => orset_merge(existing, incoming),
        MergePolicy::MvRegister => mv_register_merge(existing, incoming, ctx),
        MergePolicy::MapLww => map_lww_merge(existing, incoming, ctx),
    }
}

/// Converts an inserted literal into the stored representation for the
/// policy: or-set elements get fresh tags, register writes get their causal
/// stamp, and map entries are stamped per key.
pub fn prepare_insert(policy: &MergePolicy, incoming: &Value, stamp: u64) -> Result<Value> {
    if incoming.is_null() {
        return Ok(Value::Null);
    }
    match policy {
        MergePolicy::OrSet => match incoming {
            Value::Array(items) if items.iter().all(is_tagged_pair) => Ok(incoming.clone()),
            Value::Array(items) => Ok(Value::canonical_set(
                items.iter().map(|e| tag_element(e.clone())).collect(),
            )),
            _ => Err(DbError::DataType(
                "orset columns require set values".to_string(),
            )),
        },
        MergePolicy::MvRegister => match incoming {
            Value::Array(items) if items.iter().all(is_stamped_pair) => Ok(incoming.clone()),
            _ => Ok(Value::Array(vec![Value::Array(vec![
                Value::BigInt(stamp as i64),
                incoming.clone(),
            ])])),
        },
        MergePolicy::MapLww => match incoming {
            Value::Array(items) if items.iter().all(is_stamped_triple) => Ok(incoming.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(kv) if kv.len() == 2 => out.push(Value::Array(vec![
                            kv[0].clone(),
                            kv[1].clone(),
                            Value::BigInt(stamp as i64),
                        ])),
                        _ => {
                            return Err(DbError::DataType(
                                "map_lww columns require [key, value] pairs".to_string(),
                            ))
                        }
                    }
                }
                Ok(Value::canonical_set(out))
            }
            _ => Err(DbError::DataType(
                "map_lww columns require [key, value] pairs".to_string(),
            )),
        },
        _ => Ok(incoming.clone()),
    }
}

/// Collapses stored CRDT state into its user-facing reading.
pub fn read_value(policy: &MergePolicy, stored: &Value) -> Value {
    match (policy, stored) {
        (MergePolicy::OrSet, Value::Array(items)) => Value::canonical_set(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Array(pair) if pair.len() == 2 => Some(pair[0].clone()),
                    _ => None,
                })
                .collect(),
        ),
        (MergePolicy::MvRegister, Value::Array(items)) => {
            let mut values: Vec<Value> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Array(pair) if pair.len() == 2 => Some(pair[1].clone()),
                    _ => None,
                })
                .collect();
            values.sort();
            values.dedup();
            if values.len() == 1 {
                values.pop().unwrap()
            } else {
                Value::Array(values)
            }
        }
        (MergePolicy::MapLww, Value::Array(items)) => Value::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Array(triple) if triple.len() == 3 => {
                        Some(Value::Array(vec![triple[0].clone(), triple[1].clone()]))
                    }
                    _ => None,
                })
                .collect(),
        ),
        _ => stored.clone(),
    }
}

/// Removes every currently observed tag for `element` from or-set state.
pub fn orset_remove(state: &Value, element: &Value) -> Result<Value> {
    match state {
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .filter(|item| match item {
                    Value::Array(pair) if pair.len() == 2 => &pair[0] != element,
                    _ => true,
                })
                .cloned()
                .collect(),
        )),
        Value::Null => Ok(Value::Null),
        _ => Err(DbError::DataType("orset state must be an array".to_string())),
    }
}

// ----------------------------------------------------------------------
// Resolvers
// ----------------------------------------------------------------------

fn lww(existing: &Value, incoming: &Value, ctx: &MergeContext) -> Value {
    if ctx.incoming_stamp != ctx.existing_stamp {
        if ctx.incoming_stamp > ctx.existing_stamp {
            incoming.clone()
        } else {
            existing.clone()
        }
    } else if (ctx.incoming_txn, ctx.site_id) > (ctx.existing_txn, ctx.site_id) {
        incoming.clone()
    } else {
        existing.clone()
    }
}

fn value_add(existing: &Value, incoming: &Value) -> Result<Value> {
    if existing.is_null() {
        return Ok(incoming.clone());
    }
    if incoming.is_null() {
        return Ok(existing.clone());
    }
    match (existing, incoming) {
        (Value::Double(_), _) | (_, Value::Double(_)) => {
            let (a, b) = (
                existing
                    .as_f64()
                    .ok_or_else(|| non_numeric("sum", existing))?,
                incoming
                    .as_f64()
                    .ok_or_else(|| non_numeric("sum", incoming))?,
            );
            Ok(Value::Double(a + b))
        }
        _ => {
            let a = existing
                .as_i64()
                .ok_or_else(|| non_numeric("sum", existing))?;
            let b = incoming
                .as_i64()
                .ok_or_else(|| non_numeric("sum", incoming))?;
            let sum = a
                .checked_add(b)
                .ok_or_else(|| DbError::DataType("sum overflow".to_string()))?;
            rebuild_integer(existing, sum)
        }
    }
}

fn clamp(value: &Value, lo: f64, hi: f64) -> Result<Value> {
    match value {
        Value::Double(v) => Ok(Value::Double(v.clamp(lo, hi))),
        v => {
            let raw = v.as_i64().ok_or_else(|| non_numeric("sum_bounded", v))?;
            let clamped = (raw as f64).clamp(lo, hi) as i64;
            rebuild_integer(v, clamped)
        }
    }
}

fn rebuild_integer(like: &Value, raw: i64) -> Result<Value> {
    let out_of_range = || DbError::DataType(format!("{} out of range for {}", raw, like.type_name()));
    match like {
        Value::TinyInt(_) => i8::try_from(raw).map(Value::TinyInt).map_err(|_| out_of_range()),
        Value::SmallInt(_) => i16::try_from(raw).map(Value::SmallInt).map_err(|_| out_of_range()),
        Value::Integer(_) => i32::try_from(raw).map(Value::Integer).map_err(|_| out_of_range()),
        Value::BigInt(_) => Ok(Value::BigInt(raw)),
        other => Err(non_numeric("sum", other)),
    }
}

fn gset_union(existing: &Value, incoming: &Value) -> Result<Value> {
    let mut items = as_set_items(existing, "gset")?;
    items.extend(as_set_items(incoming, "gset")?);
    Ok(Value::canonical_set(items))
}

fn orset_merge(existing: &Value, incoming: &Value) -> Result<Value> {
    let mut items = as_set_items(existing, "orset")?;
    items.extend(as_set_items(incoming, "orset")?);
    for item in &items {
        if !is_tagged_pair(item) {
            return Err(DbError::DataType(
                "orset state entries must be [element, tag] pairs".to_string(),
            ));
        }
    }
    Ok(Value::canonical_set(items))
}

fn mv_register_merge(existing: &Value, incoming: &Value, ctx: &MergeContext) -> Result<Value> {
    let existing_state = to_register_state(existing, ctx.existing_stamp);
    let incoming_state = to_register_state(incoming, ctx.incoming_stamp);
    let mut pairs: Vec<(i64, Value)> = Vec::new();
    for state in [&existing_state, &incoming_state] {
        for (stamp, value) in state {
            pairs.push((*stamp, value.clone()));
        }
    }
    let max_stamp = pairs.iter().map(|(s, _)| *s).max().unwrap_or(0);
    // Only values at the causal frontier survive.
    let survivors: Vec<Value> = pairs
        .into_iter()
        .filter(|(s, _)| *s == max_stamp)
        .map(|(s, v)| Value::Array(vec![Value::BigInt(s), v]))
        .collect();
    Ok(Value::canonical_set(survivors))
}

fn to_register_state(value: &Value, stamp: u64) -> Vec<(i64, Value)> {
    match value {
        Value::Array(items) if items.iter().all(is_stamped_pair) => items
            .iter()
            .map(|item| match item {
                Value::Array(pair) => (
                    pair[0].as_i64().unwrap_or(0),
                    pair[1].clone(),
                ),
                _ => unreachable!(),
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![(stamp as i64, other.clone())],
    }
}

fn map_lww_merge(existing: &Value, incoming: &Value, ctx: &MergeContext) -> Result<Value> {
    use std::collections::BTreeMap;
    let mut merged: BTreeMap<Value, (Value, i64)> = BTreeMap::new();
    for (state, default_stamp) in [
        (existing, ctx.existing_stamp),
        (incoming, ctx.incoming_stamp),
    ] {
        for (key, value, stamp) in to_map_entries(state, default_stamp)? {
            let keep_held = merged
                .get(&key)
                .is_some_and(|(held, held_stamp)| (*held_stamp, held) >= (stamp, &value));
            if !keep_held {
                merged.insert(key, (value, stamp));
            }
        }
    }
    Ok(Value::Array(
        merged
            .into_iter()
            .map(|(k, (v, s))| Value::Array(vec![k, v, Value::BigInt(s)]))
            .collect(),
    ))
}

fn to_map_entries(value: &Value, default_stamp: u64) -> Result<Vec<(Value, Value, i64)>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Array(triple) if triple.len() == 3 && triple[2].as_i64().is_some() => {
                        out.push((
                            triple[0].clone(),
                            triple[1].clone(),
                            triple[2].as_i64().unwrap(),
                        ));
                    }
                    Value::Array(pair) if pair.len() == 2 => {
                        out.push((pair[0].clone(), pair[1].clone(), default_stamp as i64));
                    }
                    _ => {
                        return Err(DbError::DataType(
                            "map_lww state entries must be [key, value, stamp]".to_string(),
                        ))
                    }
                }
            }
            Ok(out)
        }
        _ => Err(DbError::DataType("map_lww state must be an array".to_string())),
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn as_set_items(value: &Value, policy: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(DbError::DataType(format!(
            "{} expects a set value, got {}",
            policy,
            other.type_name()
        ))),
    }
}

fn is_tagged_pair(item: &Value) -> bool {
    matches!(item, Value::Array(pair) if pair.len() == 2 && matches!(pair[1], Value::Text(_)))
}

fn is_stamped_pair(item: &Value) -> bool {
    matches!(item, Value::Array(pair) if pair.len() == 2 && pair[0].as_i64().is_some())
}

fn is_stamped_triple(item: &Value) -> bool {
    matches!(item, Value::Array(triple) if triple.len() == 3 && triple[2].as_i64().is_some())
}

fn tag_element(element: Value) -> Value {
    let tag: u64 = rand::random();
    Value::Array(vec![element, Value::Text(format!("{:016x}", tag))])
}

fn non_numeric(policy: &str, value: &Value) -> DbError {
    DbError::DataType(format!(
        "{} is not defined for {} values",
        policy,
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(existing_stamp: u64, incoming_stamp: u64) -> MergeContext {
        MergeContext {
            existing_stamp,
            incoming_stamp,
            existing_txn: 1,
            incoming_txn: 2,
            site_id: 0,
        }
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn set(items: &[&str]) -> Value {
        Value::canonical_set(items.iter().map(|s| text(s)).collect())
    }

    #[test]
    fn test_lww_greater_stamp_wins() {
        let c = ctx(1, 2);
        assert_eq!(
            merge(&MergePolicy::Lww, &text("Ada"), &text("Ada Lovelace"), &c).unwrap(),
            text("Ada Lovelace")
        );
        let c = ctx(5, 2);
        assert_eq!(
            merge(&MergePolicy::Lww, &text("Ada"), &text("stale"), &c).unwrap(),
            text("Ada")
        );
    }

    #[test]
    fn test_lww_tie_breaks_on_txn() {
        let c = ctx(3, 3);
        // incoming_txn (2) > existing_txn (1)
        assert_eq!(
            merge(&MergePolicy::Lww, &text("a"), &text("b"), &c).unwrap(),
            text("b")
        );
    }

    #[test]
    fn test_sum_and_bounds() {
        let c = ctx(1, 2);
        assert_eq!(
            merge(&MergePolicy::Sum, &Value::Integer(10), &Value::Integer(15), &c).unwrap(),
            Value::Integer(25)
        );
        let bounded = MergePolicy::SumBounded { lo: 0.0, hi: 20.0 };
        assert_eq!(
            merge(&bounded, &Value::Integer(10), &Value::Integer(15), &c).unwrap(),
            Value::Integer(20)
        );
        assert_eq!(
            merge(&bounded, &Value::Integer(5), &Value::Integer(-50), &c).unwrap(),
            Value::Integer(0)
        );
    }

    #[test]
    fn test_sum_associative_commutative() {
        let c = ctx(1, 2);
        let (a, b, d) = (Value::Integer(1), Value::Integer(2), Value::Integer(3));
        let left = merge(
            &MergePolicy::Sum,
            &merge(&MergePolicy::Sum, &a, &b, &c).unwrap(),
            &d,
            &c,
        )
        .unwrap();
        let right = merge(
            &MergePolicy::Sum,
            &a,
            &merge(&MergePolicy::Sum, &b, &d, &c).unwrap(),
            &c,
        )
        .unwrap();
        assert_eq!(left, right);
        assert_eq!(
            merge(&MergePolicy::Sum, &a, &b, &c).unwrap(),
            merge(&MergePolicy::Sum, &b, &a, &c).unwrap()
        );
    }

    #[test]
    fn test_max_min_lattice() {
        let c = ctx(1, 2);
        assert_eq!(
            merge(&MergePolicy::Max, &Value::Integer(3), &Value::Integer(9), &c).unwrap(),
            Value::Integer(9)
        );
        assert_eq!(
            merge(&MergePolicy::Min, &Value::Integer(3), &Value::Integer(9), &c).unwrap(),
            Value::Integer(3)
        );
        // Idempotent.
        assert_eq!(
            merge(&MergePolicy::Max, &Value::Integer(3), &Value::Integer(3), &c).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_gset_union_aci() {
        let c = ctx(1, 2);
        let a = set(&["engineer", "math"]);
        let b = set(&["leader"]);
        let merged = merge(&MergePolicy::GSet, &a, &b, &c).unwrap();
        assert_eq!(merged, set(&["engineer", "leader", "math"]));
        // Commutative and idempotent.
        assert_eq!(merged, merge(&MergePolicy::GSet, &b, &a, &c).unwrap());
        assert_eq!(
            merge(&MergePolicy::GSet, &a, &a, &c).unwrap(),
            a
        );
        // Associative.
        let d = set(&["poet"]);
        let left = merge(
            &MergePolicy::GSet,
            &merge(&MergePolicy::GSet, &a, &b, &c).unwrap(),
            &d,
            &c,
        )
        .unwrap();
        let right = merge(
            &MergePolicy::GSet,
            &a,
            &merge(&MergePolicy::GSet, &b, &d, &c).unwrap(),
            &c,
        )
        .unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_orset_add_then_remove() {
        let tagged = prepare_insert(&MergePolicy::OrSet, &set(&["a", "b"]), 1).unwrap();
        assert_eq!(read_value(&MergePolicy::OrSet, &tagged), set(&["a", "b"]));
        let removed = orset_remove(&tagged, &text("a")).unwrap();
        assert_eq!(read_value(&MergePolicy::OrSet, &removed), set(&["b"]));
        // A concurrently re-added element survives the old removal: merging
        // the removed state with a fresh add keeps the new tag.
        let readd = prepare_insert(&MergePolicy::OrSet, &set(&["a"]), 2).unwrap();
        let merged = merge(&MergePolicy::OrSet, &removed, &readd, &ctx(1, 2)).unwrap();
        assert_eq!(read_value(&MergePolicy::OrSet, &merged), set(&["a", "b"]));
    }

    #[test]
    fn test_orset_merge_idempotent() {
        let tagged = prepare_insert(&MergePolicy::OrSet, &set(&["a"]), 1).unwrap();
        let merged = merge(&MergePolicy::OrSet, &tagged, &tagged, &ctx(1, 1)).unwrap();
        assert_eq!(merged, tagged);
    }

    #[test]
    fn test_mv_register_replace_and_concurrent() {
        let c = ctx(1, 2);
        let state = prepare_insert(&MergePolicy::MvRegister, &text("v1"), 1).unwrap();
        // A causally greater write replaces.
        let replaced = merge(&MergePolicy::MvRegister, &state, &text("v2"), &c).unwrap();
        assert_eq!(read_value(&MergePolicy::MvRegister, &replaced), text("v2"));
        // Concurrent writes (equal stamp) both survive.
        let concurrent = merge(&MergePolicy::MvRegister, &state, &text("v2"), &ctx(1, 1)).unwrap();
        assert_eq!(
            read_value(&MergePolicy::MvRegister, &concurrent),
            Value::Array(vec![text("v1"), text("v2")])
        );
    }

    #[test]
    fn test_map_lww_per_key() {
        let c = ctx(1, 2);
        let a = prepare_insert(
            &MergePolicy::MapLww,
            &Value::Array(vec![
                Value::Array(vec![text("city"), text("London")]),
                Value::Array(vec![text("role"), text("engineer")]),
            ]),
            1,
        )
        .unwrap();
        let b = prepare_insert(
            &MergePolicy::MapLww,
            &Value::Array(vec![Value::Array(vec![text("city"), text("Paris")])]),
            2,
        )
        .unwrap();
        let merged = merge(&MergePolicy::MapLww, &a, &b, &c).unwrap();
        let read = read_value(&MergePolicy::MapLww, &merged);
        assert_eq!(
            read,
            Value::Array(vec![
                Value::Array(vec![text("city"), text("Paris")]),
                Value::Array(vec![text("role"), text("engineer")]),
            ])
        );
        // Commutative.
        assert_eq!(merged, merge(&MergePolicy::MapLww, &b, &a, &c).unwrap());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(MergePolicy::parse("LWW", &[]).unwrap(), MergePolicy::Lww);
        assert_eq!(
            MergePolicy::parse("sum_bounded", &[0.0, 100.0]).unwrap(),
            MergePolicy::SumBounded { lo: 0.0, hi: 100.0 }
        );
        assert!(MergePolicy::parse("sum_bounded", &[5.0, 1.0]).is_err());
        assert!(MergePolicy::parse("nope", &[]).is_err());
    }
}
