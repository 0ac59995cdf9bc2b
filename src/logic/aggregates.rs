//! Argument and result adapters for `aggregate`, `count` and `groupBy`.
//!
//! User arguments name aggregates at the top level (`{ _avg: { views: true } }`)
//! while the engine expects them under `select` with their own nested
//! selection (`{ select: { _avg: { select: { views: true } } } }`).

use serde_json::{json, Map, Value};

const AGGREGATE_KEYS: [&str; 5] = ["_count", "_avg", "_sum", "_min", "_max"];

fn counts_all(args: &Value) -> bool {
    matches!(args.get("_count"), Some(Value::Bool(_)))
}

pub fn map_aggregate_args(args: Value) -> Value {
    let Value::Object(args) = args else {
        return json!({ "select": {} });
    };

    let mut select = Map::new();
    let mut mapped = Map::new();

    for (key, value) in args {
        if AGGREGATE_KEYS.contains(&key.as_str()) {
            let selection = match value {
                Value::Bool(flag) => json!({ "_all": flag }),
                other => other,
            };
            select.insert(key, json!({ "select": selection }));
        } else {
            mapped.insert(key, value);
        }
    }

    mapped.insert("select".to_string(), Value::Object(select));
    Value::Object(mapped)
}

/// `_count: true` reads back as a plain number
pub fn unpack_aggregate(args: &Value, mut data: Value) -> Value {
    if counts_all(args) {
        if let Some(count) = data.get("_count").and_then(|count| count.get("_all")).cloned() {
            data["_count"] = count;
        }
    }
    data
}

pub fn map_count_args(args: Value) -> Value {
    let Value::Object(mut args) = args else {
        return json!({ "select": { "_count": { "select": { "_all": true } } } });
    };

    let selection = match args.remove("select") {
        Some(select @ Value::Object(_)) => select,
        _ => json!({ "_all": true }),
    };
    args.insert(
        "select".to_string(),
        json!({ "_count": { "select": selection } }),
    );
    Value::Object(args)
}

/// A user `select` yields the per-field counts, otherwise the total
pub fn unpack_count(args: &Value, data: Value) -> Value {
    let counts = data.get("_count").cloned().unwrap_or(Value::Null);
    if args.get("select").map_or(false, Value::is_object) {
        counts
    } else {
        counts.get("_all").cloned().unwrap_or(Value::Null)
    }
}

pub fn map_group_by_args(args: Value) -> Value {
    let by: Vec<String> = match args.get("by") {
        Some(Value::Array(fields)) => fields
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(field)) => vec![field.clone()],
        _ => Vec::new(),
    };

    let mut mapped = map_aggregate_args(args);
    if let Some(Value::Object(select)) = mapped.get_mut("select") {
        for field in by {
            select.insert(field, Value::Bool(true));
        }
    }
    mapped
}

pub fn unpack_group_by(args: &Value, data: Value) -> Value {
    match data {
        Value::Array(groups) => Value::Array(
            groups
                .into_iter()
                .map(|group| unpack_aggregate(args, group))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_args_move_under_select() {
        let mapped = map_aggregate_args(json!({
            "where": { "published": true },
            "_count": true,
            "_avg": { "views": true }
        }));
        assert_eq!(
            mapped,
            json!({
                "where": { "published": true },
                "select": {
                    "_count": { "select": { "_all": true } },
                    "_avg": { "select": { "views": true } }
                }
            })
        );

        let unpacked = unpack_aggregate(
            &json!({ "_count": true }),
            json!({ "_count": { "_all": 4 }, "_avg": { "views": 2.5 } }),
        );
        assert_eq!(unpacked, json!({ "_count": 4, "_avg": { "views": 2.5 } }));
    }

    #[test]
    fn test_count_with_and_without_select() {
        assert_eq!(
            map_count_args(json!({ "where": { "id": 1 } })),
            json!({ "where": { "id": 1 }, "select": { "_count": { "select": { "_all": true } } } })
        );
        assert_eq!(unpack_count(&json!({}), json!({ "_count": { "_all": 3 } })), json!(3));

        let args = json!({ "select": { "_all": true, "name": true } });
        assert_eq!(
            map_count_args(args.clone()),
            json!({ "select": { "_count": { "select": { "_all": true, "name": true } } } })
        );
        assert_eq!(
            unpack_count(&args, json!({ "_count": { "_all": 3, "name": 2 } })),
            json!({ "_all": 3, "name": 2 })
        );
    }

    #[test]
    fn test_group_by_selects_grouping_fields() {
        let args = json!({ "by": ["published"], "_count": true, "_sum": { "views": true } });
        let mapped = map_group_by_args(args.clone());
        assert_eq!(mapped["select"]["published"], json!(true));
        assert_eq!(mapped["select"]["_sum"], json!({ "select": { "views": true } }));
        assert_eq!(mapped["by"], json!(["published"]));

        let unpacked = unpack_group_by(
            &args,
            json!([{ "published": true, "_count": { "_all": 2 }, "_sum": { "views": 7 } }]),
        );
        assert_eq!(unpacked[0]["_count"], json!(2));
    }
}
