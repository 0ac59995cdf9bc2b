use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Operations a model can expose. `Count` is client-only and travels to the
/// engine as `Aggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelAction {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
    Aggregate,
    Count,
    GroupBy,
}

impl ModelAction {
    /// Every action the engine understands (`Count` excluded, it is derived)
    pub const ENGINE_ACTIONS: [ModelAction; 14] = [
        ModelAction::FindUnique,
        ModelAction::FindUniqueOrThrow,
        ModelAction::FindFirst,
        ModelAction::FindFirstOrThrow,
        ModelAction::FindMany,
        ModelAction::Create,
        ModelAction::CreateMany,
        ModelAction::Update,
        ModelAction::UpdateMany,
        ModelAction::Upsert,
        ModelAction::Delete,
        ModelAction::DeleteMany,
        ModelAction::Aggregate,
        ModelAction::GroupBy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelAction::FindUnique => "findUnique",
            ModelAction::FindUniqueOrThrow => "findUniqueOrThrow",
            ModelAction::FindFirst => "findFirst",
            ModelAction::FindFirstOrThrow => "findFirstOrThrow",
            ModelAction::FindMany => "findMany",
            ModelAction::Create => "create",
            ModelAction::CreateMany => "createMany",
            ModelAction::Update => "update",
            ModelAction::UpdateMany => "updateMany",
            ModelAction::Upsert => "upsert",
            ModelAction::Delete => "delete",
            ModelAction::DeleteMany => "deleteMany",
            ModelAction::Aggregate => "aggregate",
            ModelAction::Count => "count",
            ModelAction::GroupBy => "groupBy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ENGINE_ACTIONS
            .iter()
            .copied()
            .chain(std::iter::once(ModelAction::Count))
            .find(|action| action.as_str() == name)
    }

    /// Actions whose result exposes chainable relation sub-queries
    pub fn is_fluent(&self) -> bool {
        matches!(
            self,
            ModelAction::FindUnique
                | ModelAction::FindUniqueOrThrow
                | ModelAction::FindFirst
                | ModelAction::FindFirstOrThrow
                | ModelAction::Create
                | ModelAction::Update
                | ModelAction::Upsert
                | ModelAction::Delete
        )
    }

    /// Actions whose response is scalar or grouped rather than record shaped
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ModelAction::Aggregate | ModelAction::Count | ModelAction::GroupBy
        )
    }

    pub fn is_or_throw(&self) -> bool {
        matches!(
            self,
            ModelAction::FindUniqueOrThrow | ModelAction::FindFirstOrThrow
        )
    }

    /// The action name sent to the engine
    pub fn wire_action(&self) -> ModelAction {
        match self {
            ModelAction::Count => ModelAction::Aggregate,
            other => *other,
        }
    }
}

impl fmt::Display for ModelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Scalar,
    Enum,
    Relation,
    Composite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldDefault {
    Uuid,
    Autoincrement,
    Now,
    Value(serde_json::Value),
}

/// Relation metadata, named after the relation so both sides can find each other.
/// `fields` is non-empty on the side that stores the foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Scalar type name, enum name, related model or composite type
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub is_list: bool,
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default)]
    pub is_id: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldDefault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationInfo>,
}

fn default_true() -> bool {
    true
}

impl FieldDescriptor {
    pub fn is_relation(&self) -> bool {
        self.kind == FieldKind::Relation
    }

    pub fn is_composite(&self) -> bool {
        self.kind == FieldKind::Composite
    }

    pub fn is_nullable(&self) -> bool {
        !self.is_required
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default = "default_actions")]
    pub actions: Vec<ModelAction>,
}

fn default_actions() -> Vec<ModelAction> {
    ModelAction::ENGINE_ACTIONS.to_vec()
}

impl ModelDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.is_relation())
    }

    pub fn id_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.is_id)
    }

    /// Whether the model supports the given client action.
    /// `count` is available whenever `aggregate` is.
    pub fn supports(&self, action: ModelAction) -> bool {
        match action {
            ModelAction::Count => self.actions.contains(&ModelAction::Aggregate),
            other => self.actions.contains(&other),
        }
    }

    /// Client-visible action names, in catalog order with `count` appended
    pub fn action_names(&self) -> Vec<ModelAction> {
        let mut actions = self.actions.clone();
        if self.supports(ModelAction::Count) && !actions.contains(&ModelAction::Count) {
            actions.push(ModelAction::Count);
        }
        actions
    }

    /// Name used in client method display strings (`user.findMany`)
    pub fn client_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Name of the synthetic type backing `_count` selections
    pub fn count_output_type(&self) -> String {
        format!("{}CountOutputType", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTypeDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

/// Serialized form of the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub types: Vec<CompositeTypeDescriptor>,
}

/// Read-only view over the schema's models. Descriptors are shared by
/// reference with every request built for them.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<Arc<ModelDescriptor>>,
    types: Vec<Arc<CompositeTypeDescriptor>>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    pub fn new(document: CatalogDocument) -> Self {
        let index = document
            .models
            .iter()
            .enumerate()
            .map(|(position, model)| (model.name.clone(), position))
            .collect();

        Self {
            models: document.models.into_iter().map(Arc::new).collect(),
            types: document.types.into_iter().map(Arc::new).collect(),
            index,
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        Ok(Self::new(document))
    }

    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        let document: CatalogDocument = serde_json::from_value(value)?;
        Ok(Self::new(document))
    }

    pub fn list_models(&self) -> Vec<String> {
        self.models.iter().map(|model| model.name.clone()).collect()
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.index.get(name).map(|&position| self.models[position].clone())
    }

    pub fn get_action_names(&self, model: &str) -> Vec<ModelAction> {
        self.get_model(model)
            .map(|model| model.action_names())
            .unwrap_or_default()
    }

    pub fn get_type(&self, name: &str) -> Option<Arc<CompositeTypeDescriptor>> {
        self.types.iter().find(|ty| ty.name == name).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.iter()
    }
}
