#![allow(dead_code)]

use oat_db_client::{
    Client, ClientBuilder, ClientConfig, EngineCapabilities, EngineEvent, MemoryEngine,
    ModelCatalog,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// User/Post blog schema with a composite profile on users
pub fn blog_catalog() -> Arc<ModelCatalog> {
    Arc::new(
        ModelCatalog::from_value(json!({
            "models": [
                {
                    "name": "User",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "String", "is_id": true, "default": "uuid" },
                        { "name": "email", "kind": "scalar", "type": "String", "is_unique": true },
                        { "name": "name", "kind": "scalar", "type": "String", "is_required": false },
                        { "name": "profile", "kind": "composite", "type": "Profile", "is_required": false },
                        { "name": "posts", "kind": "relation", "type": "Post", "is_list": true,
                          "relation": { "name": "UserPosts" } }
                    ]
                },
                {
                    "name": "Post",
                    "fields": [
                        { "name": "id", "kind": "scalar", "type": "Int", "is_id": true, "default": "autoincrement" },
                        { "name": "title", "kind": "scalar", "type": "String" },
                        { "name": "published", "kind": "scalar", "type": "Boolean", "default": { "value": false } },
                        { "name": "views", "kind": "scalar", "type": "Int", "default": { "value": 0 } },
                        { "name": "authorId", "kind": "scalar", "type": "String" },
                        { "name": "author", "kind": "relation", "type": "User",
                          "relation": { "name": "UserPosts", "fields": ["authorId"], "references": ["id"] } }
                    ]
                }
            ],
            "types": [
                {
                    "name": "Profile",
                    "fields": [
                        { "name": "bio", "kind": "scalar", "type": "String", "is_required": false },
                        { "name": "website", "kind": "scalar", "type": "String", "is_required": false }
                    ]
                }
            ]
        }))
        .expect("blog catalog"),
    )
}

/// A client over a fresh memory engine, with the engine kept for inspection
pub struct TestClient {
    pub client: Client,
    pub engine: Arc<MemoryEngine>,
}

impl TestClient {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(configure: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Self {
        Self::with_engine(MemoryEngine::new(blog_catalog()), configure)
    }

    pub fn with_capabilities(
        capabilities: EngineCapabilities,
        configure: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Self {
        Self::with_engine(
            MemoryEngine::new(blog_catalog()).with_capabilities(capabilities),
            configure,
        )
    }

    pub fn with_engine(
        engine: MemoryEngine,
        configure: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Self {
        let engine = Arc::new(engine);
        let builder = Client::builder(blog_catalog(), engine.clone()).config(ClientConfig::default());
        Self {
            client: configure(builder).build(),
            engine,
        }
    }

    /// Events after the initial connect
    pub fn events(&self) -> Vec<EngineEvent> {
        self.engine
            .events()
            .into_iter()
            .filter(|event| *event != EngineEvent::Connect)
            .collect()
    }

    pub async fn create_user(&self, email: &str) -> Value {
        self.client
            .model("user")
            .expect("user model")
            .call(oat_db_client::ModelAction::Create, json!({ "data": { "email": email } }))
            .expect("create")
            .await
            .expect("user created")
    }
}

pub fn no_batching() -> EngineCapabilities {
    EngineCapabilities {
        supports_batching: false,
        supports_interactive_transactions: true,
    }
}
