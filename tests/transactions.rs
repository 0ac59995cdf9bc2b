mod common;

use common::{no_batching, TestClient};
use oat_db_client::{
    Client, ClientError, EngineCall, EngineCapabilities, EngineEvent, ModelAction,
    TransactionErrorKind, TransactionOptions, TransactionState,
};
use serde_json::{json, Value};
use std::time::Duration;

fn create(client: &Client, email: &str) -> oat_db_client::LazyRequest {
    client
        .model("user")
        .unwrap()
        .call(ModelAction::Create, json!({ "data": { "email": email } }))
        .unwrap()
}

/// Three sequential creates in one transaction, returning its id
async fn create_three(client: &Client, prefix: &'static str) -> Result<String, ClientError> {
    client
        .transaction(TransactionOptions::default(), move |tx| async move {
            for n in 0..3 {
                create(&tx, &format!("{}{}@b.com", prefix, n)).await?;
            }
            Ok::<String, ClientError>(tx.transaction_handle().unwrap().id)
        })
        .await
}

#[tokio::test]
async fn test_failing_callback_rolls_back_in_order() {
    let t = TestClient::new();

    let outcome: Result<(), anyhow::Error> = t
        .client
        .transaction(TransactionOptions::default(), |tx| async move {
            create(&tx, "a@b.com").await?;
            create(&tx, "c@d.com").await?;
            Err(anyhow::anyhow!("boom"))
        })
        .await;

    assert_eq!(outcome.unwrap_err().to_string(), "boom");

    let events = t.events();
    assert_eq!(events.len(), 4);
    let EngineEvent::StartTransaction { id } = &events[0] else {
        panic!("expected startTransaction first, got {:?}", events[0]);
    };
    for event in &events[1..3] {
        assert_eq!(
            *event,
            EngineEvent::Execute {
                model: "User".to_string(),
                action: ModelAction::Create,
                transaction: Some(id.clone()),
            }
        );
    }
    assert_eq!(events[3], EngineEvent::Rollback { id: id.clone() });

    assert!(t.engine.rows("User").is_empty());
    assert_eq!(t.engine.open_transactions(), 0);
    println!("✓ startTransaction, create, create, rollback");
}

#[tokio::test]
async fn test_successful_callback_commits() {
    let t = TestClient::new();

    let emails = t
        .client
        .transaction(TransactionOptions::default(), |tx| async move {
            assert!(tx.is_transaction());
            assert_eq!(tx.transaction_handle().unwrap().state, TransactionState::Active);

            let first = create(&tx, "a@b.com").await?;
            let second = create(&tx, "c@d.com").await?;
            Ok::<Vec<Value>, ClientError>(vec![first["email"].clone(), second["email"].clone()])
        })
        .await
        .unwrap();

    assert_eq!(emails, vec![json!("a@b.com"), json!("c@d.com")]);
    assert_eq!(t.engine.rows("User").len(), 2);
    assert!(matches!(t.events().last(), Some(EngineEvent::Commit { .. })));
}

#[tokio::test]
async fn test_requests_joined_inside_a_transaction_keep_creation_order() {
    let t = TestClient::new();

    t.client
        .transaction(TransactionOptions::default(), |tx| async move {
            let first = create(&tx, "a@b.com");
            let lookup = tx
                .model("user")
                .unwrap()
                .call(ModelAction::Count, json!({}))
                .unwrap();
            let second = create(&tx, "c@d.com");

            // observed out of order, executed in creation order
            let (second, lookup, first) = tokio::join!(second.result(), lookup.result(), first.result());
            assert!(first.is_ok() && second.is_ok());
            assert_eq!(lookup?, json!(1));
            Ok::<(), ClientError>(())
        })
        .await
        .unwrap();

    let actions: Vec<ModelAction> = t
        .events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::Execute { action, .. } => Some(action),
            _ => None,
        })
        .collect();
    assert_eq!(
        actions,
        vec![ModelAction::Create, ModelAction::Count, ModelAction::Create]
    );
}

#[tokio::test]
async fn test_timeout_rolls_back() {
    let t = TestClient::new();

    let outcome = t
        .client
        .transaction(
            TransactionOptions::default().with_timeout(Duration::from_millis(50)),
            |tx| async move {
                create(&tx, "a@b.com").await?;
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<(), ClientError>(())
            },
        )
        .await;

    assert_eq!(
        outcome.unwrap_err(),
        ClientError::Transaction(TransactionErrorKind::Timeout { timeout_ms: 50 })
    );
    assert!(matches!(t.events().last(), Some(EngineEvent::Rollback { .. })));
    assert!(t.engine.rows("User").is_empty());
}

#[tokio::test]
async fn test_nested_transaction_is_rejected() {
    let t = TestClient::new();

    t.client
        .transaction(TransactionOptions::default(), |tx| async move {
            let nested = tx
                .transaction(TransactionOptions::default(), |_inner| async {
                    Ok::<(), ClientError>(())
                })
                .await;
            assert_eq!(
                nested.unwrap_err(),
                ClientError::Transaction(TransactionErrorKind::Nested)
            );

            let batch = tx.transaction_batch(vec![create(&tx, "a@b.com")], TransactionOptions::default()).await;
            assert_eq!(
                batch.unwrap_err(),
                ClientError::Transaction(TransactionErrorKind::Nested)
            );
            Ok::<(), ClientError>(())
        })
        .await
        .unwrap();

    let starts = t
        .events()
        .iter()
        .filter(|event| matches!(event, EngineEvent::StartTransaction { .. }))
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn test_requests_after_close_fail() {
    let t = TestClient::new();

    let escaped = t
        .client
        .transaction(TransactionOptions::default(), |tx| async move {
            Ok::<Client, ClientError>(tx)
        })
        .await
        .unwrap();

    let handle = escaped.transaction_handle().unwrap();
    assert_eq!(handle.state, TransactionState::Committed);

    let error = create(&escaped, "a@b.com").await.unwrap_err();
    assert!(matches!(
        error,
        ClientError::Transaction(TransactionErrorKind::Closed(ref id)) if *id == handle.id
    ));
    assert!(t.engine.rows("User").is_empty());
}

#[tokio::test]
async fn test_lease_failures() {
    let refused = TestClient::with(|builder| {
        builder.use_engine(|call, next| async move {
            match call {
                EngineCall::StartTransaction(_) => Err(ClientError::unknown("no connection available")),
                call => next.run(call).await,
            }
        })
    });
    let outcome = refused
        .client
        .transaction(TransactionOptions::default(), |_tx| async {
            Ok::<(), ClientError>(())
        })
        .await;
    assert!(matches!(
        outcome,
        Err(ClientError::Transaction(TransactionErrorKind::LeaseFailed(_)))
    ));

    let slow = TestClient::with(|builder| {
        builder.use_engine(|call, next| async move {
            if matches!(call, EngineCall::StartTransaction(_)) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            next.run(call).await
        })
    });
    let outcome = slow
        .client
        .transaction(
            TransactionOptions::default().with_max_wait(Duration::from_millis(20)),
            |_tx| async { Ok::<(), ClientError>(()) },
        )
        .await;
    assert_eq!(
        outcome.unwrap_err(),
        ClientError::Transaction(TransactionErrorKind::LeaseTimeout { max_wait_ms: 20 })
    );
}

#[tokio::test]
async fn test_lease_granted_after_max_wait_is_released() {
    let t = TestClient::with(|builder| {
        builder.use_engine(|call, next| async move {
            if matches!(call, EngineCall::StartTransaction(_)) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            next.run(call).await
        })
    });

    let outcome = t
        .client
        .transaction(
            TransactionOptions::default().with_max_wait(Duration::from_millis(20)),
            |_tx| async { Ok::<(), ClientError>(()) },
        )
        .await;
    assert_eq!(
        outcome.unwrap_err(),
        ClientError::Transaction(TransactionErrorKind::LeaseTimeout { max_wait_ms: 20 })
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = t.events();
    let EngineEvent::StartTransaction { id } = &events[0] else {
        panic!("expected the late startTransaction, got {:?}", events);
    };
    assert_eq!(events, vec![
        EngineEvent::StartTransaction { id: id.clone() },
        EngineEvent::Rollback { id: id.clone() },
    ]);
    assert_eq!(t.engine.open_transactions(), 0);
}

#[tokio::test]
async fn test_concurrent_transactions_do_not_interleave() {
    let t = TestClient::new();

    let (first, second) = tokio::join!(
        create_three(&t.client, "a"),
        create_three(&t.client, "c")
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second);

    let events = t.events();
    for id in [&first, &second] {
        let own: Vec<(usize, &EngineEvent)> = events
            .iter()
            .enumerate()
            .filter(|(_, event)| match event {
                EngineEvent::StartTransaction { id: own }
                | EngineEvent::Commit { id: own }
                | EngineEvent::Rollback { id: own } => own == id,
                EngineEvent::Execute { transaction, .. } => transaction.as_ref() == Some(id),
                _ => false,
            })
            .collect();

        assert_eq!(own.len(), 5, "events of {}: {:?}", id, own);
        assert_eq!(*own[0].1, EngineEvent::StartTransaction { id: id.clone() });
        assert_eq!(*own[4].1, EngineEvent::Commit { id: id.clone() });
        for (_, event) in &own[1..4] {
            assert!(matches!(event, EngineEvent::Execute { action: ModelAction::Create, .. }));
        }
        // every call of this transaction sits between its start and its commit
        assert!(own.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }
    println!("✓ Two concurrent transactions kept their own call order");
}

#[tokio::test]
async fn test_rollback_failure_does_not_replace_the_callback_error() {
    let t = TestClient::with(|builder| {
        builder.use_engine(|call, next| async move {
            match call {
                EngineCall::RollbackTransaction(_) => Err(ClientError::unknown("rollback lost")),
                call => next.run(call).await,
            }
        })
    });

    let outcome: Result<(), ClientError> = t
        .client
        .transaction(TransactionOptions::default(), |tx| async move {
            create(&tx, "a@b.com").await?;
            Err(ClientError::validation("callback failed"))
        })
        .await;

    assert_eq!(outcome.unwrap_err(), ClientError::validation("callback failed"));
    assert!(t.engine.rows("User").is_empty());
}

#[tokio::test]
async fn test_commit_failure_rolls_back() {
    let t = TestClient::with(|builder| {
        builder.use_engine(|call, next| async move {
            match call {
                EngineCall::CommitTransaction(_) => Err(ClientError::unknown("commit lost")),
                call => next.run(call).await,
            }
        })
    });

    let outcome = t
        .client
        .transaction(TransactionOptions::default(), |tx| async move {
            create(&tx, "a@b.com").await?;
            Ok::<(), ClientError>(())
        })
        .await;

    assert!(matches!(
        outcome,
        Err(ClientError::Transaction(TransactionErrorKind::CommitFailed(_)))
    ));
    assert!(matches!(t.events().last(), Some(EngineEvent::Rollback { .. })));
    assert_eq!(t.engine.open_transactions(), 0);
}

#[tokio::test]
async fn test_unsupported_backend() {
    let t = TestClient::with_capabilities(
        EngineCapabilities {
            supports_batching: false,
            supports_interactive_transactions: false,
        },
        |builder| builder,
    );

    let outcome = t
        .client
        .transaction(TransactionOptions::default(), |_tx| async {
            Ok::<(), ClientError>(())
        })
        .await;
    assert!(matches!(
        outcome,
        Err(ClientError::Transaction(TransactionErrorKind::Unsupported(_)))
    ));

    let batch = t
        .client
        .transaction_batch(vec![create(&t.client, "a@b.com")], TransactionOptions::default())
        .await;
    assert!(matches!(
        batch,
        Err(ClientError::Transaction(TransactionErrorKind::Unsupported(_)))
    ));
}

#[tokio::test]
async fn test_batch_transaction_is_one_atomic_call() {
    let t = TestClient::new();

    let results = t
        .client
        .transaction_batch(
            vec![create(&t.client, "a@b.com"), create(&t.client, "c@d.com")],
            TransactionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1]["email"], json!("c@d.com"));
    assert_eq!(
        t.events(),
        vec![EngineEvent::Batch {
            operations: vec!["createUser".to_string(), "createUser".to_string()],
            atomic: true,
        }]
    );

    // a failing member discards the whole batch
    let error = t
        .client
        .transaction_batch(
            vec![create(&t.client, "e@f.com"), create(&t.client, "a@b.com")],
            TransactionOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some("P2002"));
    assert_eq!(t.engine.rows("User").len(), 2);
}

#[tokio::test]
async fn test_batch_transaction_rejects_observed_requests() {
    let t = TestClient::new();
    let observed = create(&t.client, "a@b.com");
    observed.result().await.unwrap();

    let error = t
        .client
        .transaction_batch(vec![observed], TransactionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Validation { .. }));

    let invalid = t
        .client
        .model("user")
        .unwrap()
        .call(ModelAction::FindMany, json!({ "select": { "nickname": true } }))
        .unwrap();
    let error = t
        .client
        .transaction_batch(
            vec![create(&t.client, "c@d.com"), invalid],
            TransactionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Validation { .. }));
    assert_eq!(t.engine.rows("User").len(), 1);
}

#[tokio::test]
async fn test_batch_transaction_falls_back_to_interactive() {
    let t = TestClient::with_capabilities(no_batching(), |builder| builder);

    let results = t
        .client
        .transaction_batch(
            vec![create(&t.client, "a@b.com"), create(&t.client, "c@d.com")],
            TransactionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(results[0]["email"], json!("a@b.com"));

    let events = t.events();
    assert!(matches!(events.first(), Some(EngineEvent::StartTransaction { .. })));
    assert!(matches!(events.last(), Some(EngineEvent::Commit { .. })));
    assert_eq!(events.len(), 4);
    assert_eq!(t.engine.rows("User").len(), 2);
}
