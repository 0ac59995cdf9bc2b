use crate::logic::desugar::desugar_args;
use crate::model::{ModelCatalog, ModelDescriptor, Request};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Model the request currently points at, and whether that is a list
fn current_target(catalog: &ModelCatalog, request: &Request) -> Option<(Arc<ModelDescriptor>, bool)> {
    let mut model = catalog.get_model(&request.model)?;
    let mut is_list = false;

    for segment in request
        .data_path
        .iter()
        .filter(|segment| !matches!(segment.as_str(), "select" | "include"))
    {
        let field = model.field(segment).filter(|field| field.is_relation())?;
        is_list = field.is_list;
        let next = catalog.get_model(&field.type_name)?;
        model = next;
    }

    Some((model, is_list))
}

fn deep_set(target: &mut Value, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        *target = value;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(entries) = target {
        let slot = entries.entry(head.clone()).or_insert(Value::Null);
        deep_set(slot, rest, value);
    }
}

/// Derive the request for `relation` of the record `request` returns.
///
/// The relation is selected inside the parent's arguments at the current data
/// path, so one engine call answers it. Only record-returning actions chain,
/// and only while the current target is a single record.
pub fn chain(catalog: &ModelCatalog, request: &Request, relation: &str, args: Option<Value>) -> Option<Request> {
    if !request.action.is_fluent() {
        return None;
    }

    let (model, is_list) = current_target(catalog, request)?;
    if is_list {
        return None;
    }
    model.field(relation).filter(|field| field.is_relation())?;

    let mut next = request.clone();
    let pointer: String = next
        .data_path
        .iter()
        .map(|segment| format!("/{}", segment))
        .collect();
    if let Some(Value::Object(level)) = next.args.pointer_mut(&pointer) {
        level.remove("include");
    }

    let selection = match args {
        None | Some(Value::Null) => Value::Bool(true),
        Some(args) => args,
    };
    let mut path = next.data_path.clone();
    path.push("select".to_string());
    path.push(relation.to_string());
    deep_set(&mut next.args, &path, selection);

    let root = catalog.get_model(&request.model)?;
    next.args = desugar_args(catalog, &root, next.args);
    next.data_path = path;
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelAction;
    use serde_json::json;

    fn catalog() -> ModelCatalog {
        ModelCatalog::from_value(json!({
            "models": [
                {
                    "name": "User",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "Int", "is_id": true },
                        { "name": "posts", "kind": "relation", "type": "Post", "is_list": true,
                          "relation": { "name": "UserPosts" } }
                    ]
                },
                {
                    "name": "Post",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "Int", "is_id": true },
                        { "name": "authorId", "kind": "scalar", "type": "Int" },
                        { "name": "author", "kind": "relation", "type": "User",
                          "relation": { "name": "UserPosts", "fields": ["authorId"], "references": ["id"] } }
                    ]
                }
            ]
        }))
        .unwrap()
    }

    fn find_post() -> Request {
        Request {
            model: "Post".to_string(),
            action: ModelAction::FindUnique,
            args: json!({ "where": { "id": 1 }, "include": { "author": true } }),
            data_path: Vec::new(),
            client_method: "post.findUnique".to_string(),
            call_site: None,
            transaction: None,
        }
    }

    #[test]
    fn test_chain_nests_selection() {
        let catalog = catalog();
        let author = chain(&catalog, &find_post(), "author", None).unwrap();
        assert_eq!(author.args, json!({ "where": { "id": 1 }, "select": { "author": true } }));
        assert_eq!(author.data_path, vec!["select", "author"]);

        let posts = chain(&catalog, &author, "posts", Some(json!({ "take": 2 }))).unwrap();
        assert_eq!(
            posts.args,
            json!({ "where": { "id": 1 }, "select": { "author": { "select": { "posts": { "take": 2 } } } } })
        );
        assert_eq!(posts.data_path, vec!["select", "author", "select", "posts"]);

        // a list target cannot chain further
        assert!(chain(&catalog, &posts, "author", None).is_none());
    }

    #[test]
    fn test_chain_rejects_non_fluent_and_unknown() {
        let catalog = catalog();
        let mut many = find_post();
        many.action = ModelAction::FindMany;
        assert!(chain(&catalog, &many, "author", None).is_none());
        assert!(chain(&catalog, &find_post(), "id", None).is_none());
        assert!(chain(&catalog, &find_post(), "nothing", None).is_none());
    }
}
