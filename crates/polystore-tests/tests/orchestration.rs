//! End-to-end orchestration scenarios: fallback under fault injection,
//! filesystem persistence, tamper detection and cross-backend queries.

use std::sync::Arc;
use std::time::Duration;

use polystore_core::{
    CommonOptions, FsBackend, GetOptions, MemoryBackend, PolyStore, QueryOptions, QueryResult,
    SetOptions, SortOrder, StorageBackend, StoreBuilder, StoreConfig, StoreError, TtlStatus,
};
use polystore_tests::{FlakyBackend, UnavailableBackend};
use serde_json::{json, Value};

fn fast_config() -> StoreConfig {
    StoreConfig {
        kdf: polystore_core::KdfParams { iterations: 1_000 },
        ..Default::default()
    }
}

async fn store_with(backends: Vec<Arc<dyn StorageBackend>>) -> PolyStore {
    polystore_tests::init_tracing();
    let mut builder = StoreBuilder::new(fast_config());
    for backend in backends {
        builder = builder.backend(backend);
    }
    builder.build().await.unwrap()
}

#[tokio::test]
async fn test_registration_probe_routes_around_down_backend() {
    let store = store_with(vec![
        UnavailableBackend::new("native"),
        Arc::new(MemoryBackend::new("memory")),
    ])
    .await;

    store
        .set("k", json!({"v": 1}), &SetOptions::default())
        .await
        .unwrap();
    let got: Option<Value> = store.get("k", &GetOptions::default()).await.unwrap();
    assert_eq!(got, Some(json!({"v": 1})));

    // Targeting the down backend explicitly is an error, not a silent miss.
    let on_native = GetOptions {
        common: CommonOptions::on("native"),
        ..Default::default()
    };
    let err = store.get::<Value>("k", &on_native).await.unwrap_err();
    assert!(matches!(err, StoreError::NoAvailableBackend { .. }));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_runtime_failure_falls_back_to_redundant_copy() {
    let flaky = FlakyBackend::new("primary");
    let store = store_with(vec![
        flaky.clone(),
        Arc::new(MemoryBackend::new("secondary")),
    ])
    .await;

    // Redundant write to both backends.
    let both = SetOptions {
        common: CommonOptions {
            storage: vec!["primary".into(), "secondary".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    store.set("k", json!("payload"), &both).await.unwrap();

    flaky.set_failing(true);
    let got: Option<String> = store.get("k", &GetOptions::default()).await.unwrap();
    assert_eq!(got.as_deref(), Some("payload"));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_every_backend_down_is_an_error() {
    let store = store_with(vec![UnavailableBackend::new("only")]).await;

    let err = store
        .set("k", json!(1), &SetOptions::default())
        .await
        .unwrap_err();
    match err {
        StoreError::NoAvailableBackend { registered, .. } => {
            assert_eq!(registered, vec!["only".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_partial_redundant_write_surfaces_and_keeps_earlier_copy() {
    let flaky = FlakyBackend::new("second");
    let first = Arc::new(MemoryBackend::new("first"));
    let store = store_with(vec![first.clone(), flaky.clone()]).await;
    flaky.set_failing(true);

    let both = SetOptions {
        common: CommonOptions {
            storage: vec!["first".into(), "second".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let err = store.set("k", json!(1), &both).await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)));

    // The write that succeeded before the failure is still there.
    assert!(first.has("k").await.unwrap());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_fs_backend_survives_store_rebuild() {
    let dir = tempfile::tempdir().unwrap();

    let store = store_with(vec![Arc::new(FsBackend::new("fs", dir.path()))]).await;
    store
        .set(
            "user:7",
            json!({"name": "grace", "score": 42}),
            &SetOptions::default(),
        )
        .await
        .unwrap();
    store.close().await.unwrap();

    // A fresh instance rebuilds its index from the directory.
    let store = store_with(vec![Arc::new(FsBackend::new("fs", dir.path()))]).await;
    let got: Option<Value> = store.get("user:7", &GetOptions::default()).await.unwrap();
    assert_eq!(got, Some(json!({"name": "grace", "score": 42})));
    assert_eq!(
        store.keys(None, &CommonOptions::default()).await.unwrap(),
        vec!["user:7".to_string()]
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_tampered_ciphertext_is_detected() {
    let memory = Arc::new(MemoryBackend::new("memory"));
    let store = store_with(vec![memory.clone()]).await;

    let encrypted = SetOptions {
        password: Some("hunter2".into()),
        ..Default::default()
    };
    store.set("secret", json!("top"), &encrypted).await.unwrap();

    // Flip one ciphertext byte behind the facade's back.
    let mut env = memory.get("secret").await.unwrap().unwrap();
    let last = env.payload.len() - 1;
    env.payload[last] ^= 0x01;
    memory.set("secret", env).await.unwrap();

    let opts = GetOptions {
        password: Some("hunter2".into()),
        ..Default::default()
    };
    let err = store.get::<Value>("secret", &opts).await.unwrap_err();
    assert!(matches!(err, StoreError::Decryption));

    // Tolerant mode maps the same failure to a miss.
    let tolerant = GetOptions {
        ignore_decryption_errors: true,
        ..opts
    };
    let got: Option<Value> = store.get("secret", &tolerant).await.unwrap();
    assert_eq!(got, None);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_a_decryption_error() {
    let store = store_with(vec![Arc::new(MemoryBackend::new("memory"))]).await;
    let encrypted = SetOptions {
        password: Some("right".into()),
        ..Default::default()
    };
    store.set("secret", json!("top"), &encrypted).await.unwrap();

    let wrong = GetOptions {
        password: Some("wrong".into()),
        ..Default::default()
    };
    let err = store.get::<Value>("secret", &wrong).await.unwrap_err();
    assert!(matches!(err, StoreError::Decryption));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_query_unions_across_backends_with_preference_order() {
    let store = store_with(vec![
        Arc::new(MemoryBackend::new("hot")),
        Arc::new(MemoryBackend::new("cold")),
    ])
    .await;

    let on_hot = SetOptions {
        common: CommonOptions::on("hot"),
        ..Default::default()
    };
    let on_cold = SetOptions {
        common: CommonOptions::on("cold"),
        ..Default::default()
    };
    store
        .set("a", json!({"rank": 3}), &on_hot)
        .await
        .unwrap();
    store
        .set("b", json!({"rank": 1}), &on_cold)
        .await
        .unwrap();
    // Same key on both; the preferred backend's copy must win.
    store
        .set("c", json!({"rank": 2, "from": "hot"}), &on_hot)
        .await
        .unwrap();
    store
        .set("c", json!({"rank": 9, "from": "cold"}), &on_cold)
        .await
        .unwrap();

    let opts = QueryOptions {
        sort_by: Some("rank".into()),
        order: SortOrder::Ascending,
        ..Default::default()
    };
    let hits: Vec<QueryResult<Value>> = store
        .query(&json!({"rank": {"$lte": 5}}), &opts)
        .await
        .unwrap();

    let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
    assert_eq!(keys, vec!["b", "c", "a"]);
    let c = hits.iter().find(|h| h.key == "c").unwrap();
    assert_eq!(c.backend, "hot");
    assert_eq!(c.value["from"], json!("hot"));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_namespace_scopes_keys_and_clear() {
    let store = store_with(vec![Arc::new(MemoryBackend::new("memory"))]).await;

    let app = CommonOptions {
        namespace: Some("app".into()),
        ..Default::default()
    };
    let other = CommonOptions {
        namespace: Some("other".into()),
        ..Default::default()
    };
    for (ns, key) in [(&app, "a"), (&app, "b"), (&other, "a")] {
        let opts = SetOptions {
            common: ns.clone(),
            ..Default::default()
        };
        store.set(key, json!(1), &opts).await.unwrap();
    }

    assert_eq!(
        store.keys(None, &app).await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );

    store.clear(&app).await.unwrap();
    assert!(store.keys(None, &app).await.unwrap().is_empty());
    // The sibling namespace is untouched.
    assert_eq!(store.keys(None, &other).await.unwrap(), vec!["a".to_string()]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_ttl_status_and_persist_through_facade() {
    let store = store_with(vec![Arc::new(MemoryBackend::new("memory"))]).await;

    let short = SetOptions {
        ttl: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    store.set("k", json!(1), &short).await.unwrap();

    match store.get_ttl("k", &GetOptions::default()).await.unwrap() {
        TtlStatus::Expires(left) => assert!(left <= Duration::from_secs(60)),
        other => panic!("unexpected ttl status: {other:?}"),
    }

    assert!(store.persist("k", &GetOptions::default()).await.unwrap());
    assert_eq!(
        store.get_ttl("k", &GetOptions::default()).await.unwrap(),
        TtlStatus::Persistent
    );
    assert_eq!(
        store.get_ttl("ghost", &GetOptions::default()).await.unwrap(),
        TtlStatus::Missing
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let store = store_with(vec![Arc::new(MemoryBackend::new("memory"))]).await;
    store.close().await.unwrap();
    store.close().await.unwrap(); // idempotent

    let err = store
        .set("k", json!(1), &SetOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Closed));
    let err = store.get::<Value>("k", &GetOptions::default()).await.unwrap_err();
    assert!(matches!(err, StoreError::Closed));
}
