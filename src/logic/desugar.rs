use crate::error::ClientError;
use crate::model::{FieldDescriptor, ModelCatalog, ModelDescriptor};
use itertools::Itertools;
use serde_json::{Map, Value};

/// Keys of an explicit composite update envelope
const COMPOSITE_ENVELOPE: [&str; 5] = ["set", "unset", "update", "upsert", "push"];

/// Normalizes user arguments for a record-shaped action.
///
/// - `null` entries inside any `select`/`include` are dropped (they stand for
///   an absent key, not for an exclusion)
/// - composite field values in write payloads become `{ set: value }` unless
///   they already are an update envelope
///
/// Pure and idempotent.
pub fn desugar_args(catalog: &ModelCatalog, model: &ModelDescriptor, args: Value) -> Value {
    let Value::Object(mut args) = args else {
        return args;
    };

    desugar_selection(catalog, model, &mut args);

    for key in ["data", "create", "update"] {
        if let Some(payload) = args.remove(key) {
            args.insert(key.to_string(), desugar_data(catalog, model, payload));
        }
    }

    Value::Object(args)
}

fn desugar_selection(catalog: &ModelCatalog, model: &ModelDescriptor, args: &mut Map<String, Value>) {
    for key in ["select", "include"] {
        let Some(Value::Object(selection)) = args.get_mut(key) else {
            continue;
        };
        selection.retain(|_, value| !value.is_null());

        for (name, value) in selection.iter_mut() {
            let Value::Object(nested) = value else {
                continue;
            };
            if name == "_count" {
                if let Some(Value::Object(counted)) = nested.get_mut("select") {
                    counted.retain(|_, value| !value.is_null());
                }
                continue;
            }
            if let Some(target) = related_model(catalog, model, name) {
                desugar_selection(catalog, &target, nested);
            }
        }
    }
}

fn related_model(catalog: &ModelCatalog, model: &ModelDescriptor, field: &str) -> Option<std::sync::Arc<ModelDescriptor>> {
    model
        .field(field)
        .filter(|field| field.is_relation())
        .and_then(|field| catalog.get_model(&field.type_name))
}

fn is_envelope(value: &Value) -> bool {
    match value.as_object() {
        Some(map) if !map.is_empty() => map
            .keys()
            .all(|key| COMPOSITE_ENVELOPE.contains(&key.as_str())),
        _ => false,
    }
}

/// Applies the composite rule to a write payload (one record or a list)
fn desugar_data(catalog: &ModelCatalog, model: &ModelDescriptor, payload: Value) -> Value {
    match payload {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| desugar_data(catalog, model, item))
                .collect(),
        ),
        Value::Object(record) => Value::Object(
            record
                .into_iter()
                .map(|(key, value)| {
                    let value = match model.field(&key) {
                        Some(field) if field.is_composite() && !is_envelope(&value) => {
                            let mut envelope = Map::new();
                            envelope.insert("set".to_string(), value);
                            Value::Object(envelope)
                        }
                        Some(field) if field.is_relation() => desugar_nested_write(catalog, field, value),
                        _ => value,
                    };
                    (key, value)
                })
                .collect(),
        ),
        other => other,
    }
}

/// `create`, `connectOrCreate`, `createMany`, `update` and `upsert` under a relation field
fn desugar_nested_write(catalog: &ModelCatalog, field: &FieldDescriptor, value: Value) -> Value {
    let (Value::Object(mut operations), Some(target)) = (value.clone(), catalog.get_model(&field.type_name))
    else {
        return value;
    };

    for (operation, payload) in operations.iter_mut() {
        let taken = std::mem::take(payload);
        *payload = match operation.as_str() {
            "create" => desugar_data(catalog, &target, taken),
            "connectOrCreate" => map_each(taken, |item| with_key(item, "create", |create| desugar_data(catalog, &target, create))),
            "createMany" => with_key(taken, "data", |data| desugar_data(catalog, &target, data)),
            "update" => map_each(taken, |item| {
                // list relations wrap the payload in `{ where, data }`
                if item.get("data").is_some() && target.field("data").is_none() {
                    with_key(item, "data", |data| desugar_data(catalog, &target, data))
                } else {
                    desugar_data(catalog, &target, item)
                }
            }),
            "upsert" => map_each(taken, |item| {
                let item = with_key(item, "create", |create| desugar_data(catalog, &target, create));
                with_key(item, "update", |update| desugar_data(catalog, &target, update))
            }),
            _ => taken,
        };
    }

    Value::Object(operations)
}

fn map_each(value: Value, mut apply: impl FnMut(Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(&mut apply).collect()),
        single => apply(single),
    }
}

fn with_key(value: Value, key: &str, apply: impl FnOnce(Value) -> Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if let Some(inner) = map.remove(key) {
                map.insert(key.to_string(), apply(inner));
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true) | Value::Object(_))
}

/// Rejects selections the engine could not satisfy: unknown keys, empty
/// selects and `select` combined with `include`.
pub fn validate_selection(catalog: &ModelCatalog, model: &ModelDescriptor, args: &Value) -> Result<(), ClientError> {
    let Some(args) = args.as_object() else {
        return Ok(());
    };

    let select = args.get("select").and_then(Value::as_object);
    let include = args.get("include").and_then(Value::as_object);

    if select.is_some() && include.is_some() {
        return Err(ClientError::validation(format!(
            "Please either use `include` or `select` on type {}, but not both at the same time.",
            model.name
        )));
    }

    if let Some(select) = select {
        if !select.values().any(is_truthy) {
            return Err(empty_selection(&model.name, select_options(model)));
        }
        for (key, value) in select {
            validate_entry(catalog, model, key, value, "select")?;
        }
    }

    if let Some(include) = include {
        for (key, value) in include {
            if key != "_count" && !model.field(key).map_or(false, FieldDescriptor::is_relation) {
                return Err(unknown_field(key, "include", &model.name, include_options(model)));
            }
            validate_entry(catalog, model, key, value, "include")?;
        }
    }

    Ok(())
}

fn validate_entry(
    catalog: &ModelCatalog,
    model: &ModelDescriptor,
    key: &str,
    value: &Value,
    statement: &str,
) -> Result<(), ClientError> {
    if key == "_count" {
        return validate_count(model, value);
    }

    let Some(field) = model.field(key) else {
        return Err(unknown_field(key, statement, &model.name, select_options(model)));
    };

    if value.is_object() && !field.is_composite() {
        match catalog.get_model(&field.type_name) {
            Some(target) if field.is_relation() => validate_selection(catalog, &target, value)?,
            _ => {
                return Err(ClientError::validation(format!(
                    "Field `{}` on type {} is not a relation and only accepts a boolean in `{}`.",
                    key, model.name, statement
                )))
            }
        }
    }

    Ok(())
}

/// `_count: { select: { posts: true } }` is checked against `<Model>CountOutputType`
fn validate_count(model: &ModelDescriptor, value: &Value) -> Result<(), ClientError> {
    let Some(select) = value.get("select").and_then(Value::as_object) else {
        return Ok(());
    };

    let type_name = model.count_output_type();
    let options: Vec<String> = model
        .relation_fields()
        .filter(|field| field.is_list)
        .map(|field| field.name.clone())
        .collect();

    if !select.values().any(is_truthy) {
        return Err(empty_selection(&type_name, options));
    }
    for key in select.keys() {
        if !options.contains(key) {
            return Err(unknown_field(key, "select", &type_name, options));
        }
    }
    Ok(())
}

fn select_options(model: &ModelDescriptor) -> Vec<String> {
    let mut options: Vec<String> = model.fields.iter().map(|field| field.name.clone()).collect();
    if model.relation_fields().any(|field| field.is_list) {
        options.push("_count".to_string());
    }
    options
}

fn include_options(model: &ModelDescriptor) -> Vec<String> {
    let mut options: Vec<String> = model.relation_fields().map(|field| field.name.clone()).collect();
    if model.relation_fields().any(|field| field.is_list) {
        options.push("_count".to_string());
    }
    options
}

fn empty_selection(type_name: &str, options: Vec<String>) -> ClientError {
    ClientError::validation(format!(
        "The `select` statement for type {} must not be empty. Available options: {}",
        type_name,
        options.iter().map(|option| format!("`{}`", option)).join(", ")
    ))
}

fn unknown_field(key: &str, statement: &str, type_name: &str, options: Vec<String>) -> ClientError {
    ClientError::validation(format!(
        "Unknown field `{}` for {} statement on type {}. Available options: {}",
        key,
        statement,
        type_name,
        options.iter().map(|option| format!("`{}`", option)).join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ModelCatalog {
        ModelCatalog::from_value(json!({
            "models": [
                {
                    "name": "User",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "String", "is_id": true },
                        { "name": "email", "kind": "scalar", "type": "String" },
                        { "name": "profile", "kind": "composite", "type": "Profile", "is_required": false },
                        { "name": "posts", "kind": "relation", "type": "Post", "is_list": true,
                          "relation": { "name": "UserPosts" } }
                    ]
                },
                {
                    "name": "Post",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "Int", "is_id": true },
                        { "name": "title", "kind": "scalar", "type": "String" },
                        { "name": "authorId", "kind": "scalar", "type": "String" },
                        { "name": "author", "kind": "relation", "type": "User",
                          "relation": { "name": "UserPosts", "fields": ["authorId"], "references": ["id"] } }
                    ]
                }
            ],
            "types": [
                { "name": "Profile", "fields": [ { "name": "bio", "kind": "scalar", "type": "String" } ] }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_undefined_select_keys_are_dropped() {
        let catalog = catalog();
        let post = catalog.get_model("Post").unwrap();
        let args = json!({ "select": { "author": { "select": { "id": true, "_count": null } } } });

        let desugared = desugar_args(&catalog, &post, args);
        assert_eq!(desugared, json!({ "select": { "author": { "select": { "id": true } } } }));
        assert!(validate_selection(&catalog, &post, &desugared).is_ok());
    }

    #[test]
    fn test_only_undefined_key_leaves_empty_select() {
        let catalog = catalog();
        let post = catalog.get_model("Post").unwrap();
        let args = json!({ "select": { "author": { "select": { "_count": null } } } });

        let desugared = desugar_args(&catalog, &post, args);
        let error = validate_selection(&catalog, &post, &desugared).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("The `select` statement for type User must not be empty"));
        assert!(message.contains("`email`"));
        assert!(message.contains("`_count`"));
    }

    #[test]
    fn test_composite_values_get_set_envelope() {
        let catalog = catalog();
        let user = catalog.get_model("User").unwrap();
        let args = json!({
            "data": {
                "email": "a@b.com",
                "profile": { "bio": "hi" },
                "posts": { "create": [{ "title": "x" }] }
            }
        });

        let desugared = desugar_args(&catalog, &user, args);
        assert_eq!(desugared["data"]["profile"], json!({ "set": { "bio": "hi" } }));
        assert_eq!(desugared["data"]["email"], json!("a@b.com"));
        assert_eq!(desugared["data"]["posts"], json!({ "create": [{ "title": "x" }] }));

        let envelope = json!({ "data": { "profile": { "unset": true } } });
        assert_eq!(desugar_args(&catalog, &user, envelope.clone()), envelope);
    }

    #[test]
    fn test_desugar_is_idempotent() {
        let catalog = catalog();
        let user = catalog.get_model("User").unwrap();
        let samples = [
            json!({ "where": { "id": "1" }, "data": { "profile": { "bio": "b" } }, "select": { "id": true, "email": null } }),
            json!({ "create": { "profile": null }, "update": { "profile": { "bio": "c" } }, "where": { "id": "2" } }),
            json!({ "data": [{ "profile": { "bio": "d" } }, { "email": "e" }] }),
            json!({ "include": { "posts": { "select": { "title": true, "author": null } }, "_count": { "select": { "posts": null } } } }),
            json!(null),
        ];

        for sample in samples {
            let once = desugar_args(&catalog, &user, sample);
            let twice = desugar_args(&catalog, &user, once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_selection_errors() {
        let catalog = catalog();
        let user = catalog.get_model("User").unwrap();

        let unknown = validate_selection(&catalog, &user, &json!({ "select": { "nickname": true } }));
        assert!(unknown.unwrap_err().to_string().contains("Unknown field `nickname`"));

        let both = validate_selection(&catalog, &user, &json!({ "select": { "id": true }, "include": { "posts": true } }));
        assert!(both.is_err());

        let empty_count = validate_selection(
            &catalog,
            &user,
            &json!({ "select": { "id": true, "_count": { "select": {} } } }),
        );
        assert!(empty_count
            .unwrap_err()
            .to_string()
            .contains("UserCountOutputType"));

        let falsy = validate_selection(&catalog, &user, &json!({ "select": { "id": false } }));
        assert!(falsy.is_err());
    }
}
