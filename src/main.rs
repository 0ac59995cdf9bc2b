use anyhow::{anyhow, Context};
use oat_db_client::{Client, ClientConfig, ClientError, LazyRequest, MemoryEngine, ModelAction, ModelCatalog};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// A list of operations to run against a fresh in-memory engine
#[derive(Debug, Deserialize)]
struct Script {
    #[serde(default)]
    transaction: bool,
    operations: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    model: String,
    action: String,
    #[serde(default)]
    args: Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = ClientConfig::load()?;

    let mut args = std::env::args().skip(1);
    let first = args.next();
    let second = args.next();
    let (catalog_path, script_path) = match (first, second) {
        (Some(catalog), Some(script)) => (catalog, script),
        (Some(script), None) => {
            let catalog = config
                .catalog_path
                .clone()
                .ok_or_else(|| anyhow!("no catalog given and OAT_CLIENT__CATALOG_PATH is not set"))?;
            (catalog, script)
        }
        _ => return Err(anyhow!("usage: oat-client <catalog.json> <script.json>")),
    };

    let catalog_json = std::fs::read_to_string(&catalog_path)
        .with_context(|| format!("reading catalog {}", catalog_path))?;
    let catalog = Arc::new(ModelCatalog::from_json(&catalog_json)?);
    let script: Script = serde_json::from_str(
        &std::fs::read_to_string(&script_path)
            .with_context(|| format!("reading script {}", script_path))?,
    )?;
    log::info!(
        "Loaded {} model(s) and {} operation(s)",
        catalog.list_models().len(),
        script.operations.len()
    );

    let engine = Arc::new(MemoryEngine::new(catalog.clone()));
    let client = Client::builder(catalog, engine).config(config).build();
    client.connect().await?;

    let results = if script.transaction {
        let operations = script.operations;
        client
            .transaction(Default::default(), move |tx: Client| async move {
                run_operations(&tx, &operations).await
            })
            .await?
    } else {
        run_operations(&client, &script.operations).await?
    };

    println!("{}", serde_json::to_string_pretty(&Value::Array(results))?);
    client.disconnect().await?;

    Ok(())
}

fn build(client: &Client, operation: &Operation) -> Result<LazyRequest, ClientError> {
    let model = client
        .model(&operation.model)
        .ok_or_else(|| ClientError::validation(format!("Unknown model `{}`", operation.model)))?;
    let action = ModelAction::from_name(&operation.action)
        .ok_or_else(|| ClientError::validation(format!("Unknown action `{}`", operation.action)))?;

    model.call(action, operation.args.clone()).ok_or_else(|| {
        ClientError::validation(format!(
            "`{}` does not support `{}`",
            operation.model, operation.action
        ))
    })
}

/// Operations run one after another so later ones see earlier writes
async fn run_operations(client: &Client, operations: &[Operation]) -> Result<Vec<Value>, ClientError> {
    let mut results = Vec::with_capacity(operations.len());
    for operation in operations {
        results.push(build(client, operation)?.await?);
    }
    Ok(results)
}
