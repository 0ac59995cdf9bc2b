use crate::model::{FieldKind, ModelDescriptor};
use serde::{Deserialize, Serialize};

/// Reference to a scalar or enum field, usable in filters that compare columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub model_name: String,
    pub name: String,
    pub type_name: String,
    pub is_list: bool,
    pub is_enum: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRefs {
    pub model_name: String,
    pub refs: Vec<FieldRef>,
}

impl FieldRefs {
    pub fn for_model(model: &ModelDescriptor) -> Self {
        let refs = model
            .fields
            .iter()
            .filter(|field| matches!(field.kind, FieldKind::Scalar | FieldKind::Enum))
            .map(|field| FieldRef {
                model_name: model.name.clone(),
                name: field.name.clone(),
                type_name: field.type_name.clone(),
                is_list: field.is_list,
                is_enum: field.kind == FieldKind::Enum,
            })
            .collect();

        Self {
            model_name: model.name.clone(),
            refs,
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldRef> {
        self.refs.iter().find(|field| field.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().map(|field| field.name.as_str())
    }
}
