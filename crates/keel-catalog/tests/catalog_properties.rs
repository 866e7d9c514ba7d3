//! End-to-end behavior of the catalog engine over real RocksDB stores.

use keel_catalog::{AttributeSpec, Catalog, CatalogError, TableSpec, CATALOG_SUB_STORE};
use keel_commons::catalog_key::catalog_key;
use keel_commons::{
    AttributeName, CatalogConfig, CatalogEntry, DatabaseName, IndexBuildState, IndexingLease,
    TableId, TableName, WorkerId,
};
use keel_store::{RocksDriver, StoreDriver, StoreError, SubStoreOptions};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn init() -> TempDir {
    let _ = env_logger::builder().is_test(true).try_init();
    TempDir::new().unwrap()
}

fn orders_spec() -> TableSpec {
    TableSpec::new("sales", "orders")
        .attribute(AttributeSpec::primary_key("orderId"))
        .attribute(AttributeSpec::indexed("customerId"))
        .origin("orders-service")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ensure_table_is_idempotent() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let first = catalog.ensure_table(orders_spec()).await.unwrap();
    let version = first.schema_version();

    let second = catalog.ensure_table(orders_spec()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.schema_version(), version);
    catalog.indexing_idle().await;

    let attrs = second.attributes();
    assert_eq!(attrs[0].name.as_str(), "orderId");
    assert!(attrs[0].is_primary_key);
    assert!(attrs.iter().any(|a| a.name.as_str() == "customerId" && a.indexed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_primary_key_is_id() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(TableSpec::new("sales", "orders"))
        .await
        .unwrap();
    assert_eq!(table.primary_key_name().as_str(), "id");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_primary_key_is_a_conflict() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));
    catalog.ensure_table(orders_spec()).await.unwrap();

    let conflicting = TableSpec::new("sales", "orders")
        .attribute(AttributeSpec::primary_key("somethingElse"))
        .origin("rogue-service");
    match catalog.ensure_table(conflicting).await.unwrap_err() {
        CatalogError::SchemaConflict { attribute, .. } => {
            assert_eq!(attribute.as_str(), "somethingElse");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_backfill_indexes_every_existing_record() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders").attribute(AttributeSpec::primary_key("orderId")),
        )
        .await
        .unwrap();

    let statuses = ["open", "packed", "shipped", "billed"];
    for i in 0..10_000u32 {
        let pk = format!("ord-{:05}", i);
        table
            .put_record(
                pk.as_bytes(),
                &json!({"orderId": pk, "status": statuses[(i % 4) as usize]}),
            )
            .unwrap();
    }

    // Index an attribute the records already carry; the backfill must cover
    // all of them.
    catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::indexed("status")),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    let status = AttributeName::new("status");
    for value in statuses {
        let hits = table.lookup_index(&status, &json!(value)).unwrap();
        assert_eq!(hits.len(), 2_500, "status {value}");
    }
    assert!(matches!(
        table.attribute(&status).unwrap().build,
        IndexBuildState::Complete
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_build_resumes_from_checkpoint() {
    let dir = init();
    let db_path = dir.path().join("sales.keel");
    let table_name = TableName::new("orders");
    let status = AttributeName::new("status");

    // Simulate a crashed sibling: records on disk, the first half already
    // indexed, and an InProgress entry whose lease expired mid-build.
    {
        let driver = RocksDriver::new();
        let store = driver.open(&db_path).unwrap();
        let cat = store
            .open_sub_store(CATALOG_SUB_STORE, SubStoreOptions::default())
            .unwrap();
        let data = store
            .open_sub_store("data:orders", SubStoreOptions::primary())
            .unwrap();
        let idx = store
            .open_sub_store("idx:orders:status", SubStoreOptions::index())
            .unwrap();

        for i in 0..1_000u32 {
            let pk = format!("ord-{:04}", i);
            let value = if i % 2 == 0 { "open" } else { "closed" };
            data.put(
                pk.as_bytes(),
                &serde_json::to_vec(&json!({"id": pk, "status": value})).unwrap(),
            )
            .unwrap();
            if i < 500 {
                let mut key = value.as_bytes().to_vec();
                key.push(0x00);
                key.extend_from_slice(pk.as_bytes());
                idx.put(&key, pk.as_bytes()).unwrap();
            }
        }

        let pk_entry = CatalogEntry {
            attribute: AttributeName::new("id"),
            indexed: false,
            is_primary_key: true,
            schema_defined: false,
            table_id: TableId::new(1),
            origins: Default::default(),
            build: IndexBuildState::NotStarted,
        };
        cat.put(
            &catalog_key(Some(&table_name), &AttributeName::new("id")),
            &pk_entry.encode().unwrap(),
        )
        .unwrap();

        let abandoned = CatalogEntry {
            attribute: status.clone(),
            indexed: true,
            is_primary_key: false,
            schema_defined: false,
            table_id: TableId::new(1),
            origins: Default::default(),
            build: IndexBuildState::InProgress {
                checkpoint: Some(b"ord-0499".to_vec()),
                lease: IndexingLease {
                    owner: WorkerId::new("crashed-sibling"),
                    expires_at_ms: 1,
                    fencing_token: 5,
                },
            },
        };
        cat.put(
            &catalog_key(Some(&table_name), &status),
            &abandoned.encode().unwrap(),
        )
        .unwrap();
        store.close().unwrap();
    }

    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));
    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("id"))
                .attribute(AttributeSpec::indexed("status")),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    let open = table.lookup_index(&status, &json!("open")).unwrap();
    let closed = table.lookup_index(&status, &json!("closed")).unwrap();
    assert_eq!(open.len(), 500);
    assert_eq!(closed.len(), 500);
    // Exactly once: the resumed build produced no duplicate entries for the
    // pre-checkpoint half.
    let mut all: Vec<Vec<u8>> = open.into_iter().chain(closed).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 1_000);
    assert!(matches!(
        table.attribute(&status).unwrap().build,
        IndexBuildState::Complete
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_writes_during_backfill_win() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders").attribute(AttributeSpec::primary_key("orderId")),
        )
        .await
        .unwrap();
    for i in 0..2_000u32 {
        let pk = format!("ord-{:04}", i);
        table
            .put_record(pk.as_bytes(), &json!({"orderId": pk, "status": "open"}))
            .unwrap();
    }

    catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::indexed("status")),
        )
        .await
        .unwrap();

    // Overwrite a slice of records while the backfill is (possibly still)
    // running; whichever side writes last, the final index must reflect the
    // final values.
    let writer = {
        let table = Arc::clone(&table);
        tokio::task::spawn_blocking(move || {
            for i in (0..2_000u32).step_by(7) {
                let pk = format!("ord-{:04}", i);
                table
                    .put_record(pk.as_bytes(), &json!({"orderId": pk, "status": "cancelled"}))
                    .unwrap();
            }
        })
    };
    writer.await.unwrap();
    catalog.indexing_idle().await;

    let status = AttributeName::new("status");
    let cancelled = table.lookup_index(&status, &json!("cancelled")).unwrap();
    let open = table.lookup_index(&status, &json!("open")).unwrap();
    let expected_cancelled = (0..2_000u32).step_by(7).count();
    assert_eq!(cancelled.len(), expected_cancelled);
    assert_eq!(open.len(), 2_000 - expected_cancelled);
    for pk in &cancelled {
        assert!(!open.contains(pk));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_preserves_table_identity() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let before = catalog.ensure_table(orders_spec()).await.unwrap();
    catalog.indexing_idle().await;
    let version = before.schema_version();

    catalog.reload().await;

    let db = DatabaseName::new("sales");
    let name = TableName::new("orders");
    let after = catalog.get_table(&db, &name).await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.schema_version() > version);
    assert!(after
        .attributes()
        .iter()
        .any(|a| a.name.as_str() == "customerId" && a.indexed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_drops_dangling_tables_and_closes_stores() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    catalog
        .ensure_table(TableSpec::new("sales", "orders"))
        .await
        .unwrap();
    let doomed = catalog
        .ensure_table(TableSpec::new("scratch", "temp"))
        .await
        .unwrap();
    catalog.indexing_idle().await;

    std::fs::remove_dir_all(dir.path().join("scratch.keel")).unwrap();
    catalog.reload().await;

    let databases = catalog.get_databases().await;
    assert!(databases.contains_key(&DatabaseName::new("sales")));
    assert!(!databases.contains_key(&DatabaseName::new("scratch")));

    // A stale handle held from before the reload errors cleanly.
    match doomed.get_record(b"k").unwrap_err() {
        CatalogError::Store(StoreError::Closed(_)) => {}
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sole_origin_release_drops_index() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog.ensure_table(orders_spec()).await.unwrap();
    table
        .put_record(b"ord-1", &json!({"orderId": "ord-1", "customerId": "c-9"}))
        .unwrap();
    let customer = AttributeName::new("customerId");
    assert_eq!(
        table.lookup_index(&customer, &json!("c-9")).unwrap(),
        vec![b"ord-1".to_vec()]
    );

    // The sole declaring origin stops declaring customerId: index and entry go.
    catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .origin("orders-service"),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    assert!(table.attribute(&customer).is_none());
    assert!(table.indexed_attributes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_foreign_origin_keeps_shared_index_alive() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    catalog.ensure_table(orders_spec()).await.unwrap();
    // A second origin joins the same attribute.
    let table = catalog
        .ensure_table(orders_spec().origin("reporting-service"))
        .await
        .unwrap();
    catalog.indexing_idle().await;

    // The first origin releases it; the second still declares it.
    catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .origin("orders-service"),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    let customer = AttributeName::new("customerId");
    let attr = table.attribute(&customer).unwrap();
    assert!(attr.indexed);
    assert_eq!(attr.origins.len(), 1);
    assert!(attr.origins.contains("reporting-service"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discovers_legacy_single_table_store() {
    let dir = init();
    let legacy_path = dir.path().join("sales").join("orders.keel");
    std::fs::create_dir_all(legacy_path.parent().unwrap()).unwrap();

    {
        let driver = RocksDriver::new();
        let store = driver.open(&legacy_path).unwrap();
        let cat = store
            .open_sub_store(CATALOG_SUB_STORE, SubStoreOptions::default())
            .unwrap();
        let entry = CatalogEntry {
            attribute: AttributeName::new("id"),
            indexed: false,
            is_primary_key: true,
            schema_defined: false,
            table_id: TableId::new(1),
            origins: Default::default(),
            build: IndexBuildState::NotStarted,
        };
        // Legacy stores use bare attribute keys.
        cat.put(&catalog_key(None, &AttributeName::new("id")), &entry.encode().unwrap())
            .unwrap();
        store.close().unwrap();
    }

    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));
    let table = catalog
        .get_table(&DatabaseName::new("sales"), &TableName::new("orders"))
        .await
        .unwrap();
    assert!(table.is_legacy());
    assert_eq!(table.primary_key_name().as_str(), "id");

    // Ensure against the adopted legacy table extends it in place.
    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("id"))
                .attribute(AttributeSpec::indexed("status")),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;
    assert!(table.is_legacy());
    table
        .put_record(b"o1", &json!({"id": "o1", "status": "open"}))
        .unwrap();
    assert_eq!(
        table
            .lookup_index(&AttributeName::new("status"), &json!("open"))
            .unwrap(),
        vec![b"o1".to_vec()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreadable_store_degrades_that_path_only() {
    let dir = init();
    std::fs::write(dir.path().join("broken.keel"), b"not a store").unwrap();

    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));
    catalog
        .ensure_table(TableSpec::new("sales", "orders"))
        .await
        .unwrap();

    catalog.reload().await;
    let databases = catalog.get_databases().await;
    assert!(databases.contains_key(&DatabaseName::new("sales")));
    assert!(!databases.contains_key(&DatabaseName::new("broken")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drop_table_metadata_removes_entries_and_indexes() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog.ensure_table(orders_spec()).await.unwrap();
    table
        .put_record(b"ord-1", &json!({"orderId": "ord-1", "customerId": "c-1"}))
        .unwrap();
    catalog.indexing_idle().await;

    let db = DatabaseName::new("sales");
    let name = TableName::new("orders");
    catalog.drop_table_metadata(&db, &name).await.unwrap();

    assert!(catalog.get_table(&db, &name).await.is_none());
    match catalog.drop_table_metadata(&db, &name).await.unwrap_err() {
        CatalogError::TableNotFound { .. } => {}
        other => panic!("unexpected error: {other}"),
    }

    // Re-ensuring finds no catalog entries and creates the table fresh, while
    // the primary records survive the metadata drop.
    let recreated = catalog
        .ensure_table(
            TableSpec::new("sales", "orders").attribute(AttributeSpec::primary_key("orderId")),
        )
        .await
        .unwrap();
    assert!(recreated.get_record(b"ord-1").unwrap().is_some());
    assert!(recreated.indexed_attributes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recreated_table_backfills_surviving_records() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders").attribute(AttributeSpec::primary_key("orderId")),
        )
        .await
        .unwrap();
    for i in 0..300u32 {
        let pk = format!("ord-{:03}", i);
        table
            .put_record(pk.as_bytes(), &json!({"orderId": pk, "status": "open"}))
            .unwrap();
    }

    let db = DatabaseName::new("sales");
    let name = TableName::new("orders");
    catalog.drop_table_metadata(&db, &name).await.unwrap();

    // The metadata drop left the records behind; recreating with an index
    // must backfill them before the index reports complete.
    let recreated = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::indexed("status")),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    let status = AttributeName::new("status");
    assert_eq!(
        recreated.lookup_index(&status, &json!("open")).unwrap().len(),
        300
    );
    assert!(matches!(
        recreated.attribute(&status).unwrap().build,
        IndexBuildState::Complete
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attribute_order_survives_schema_changes() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::new("zeta"))
                .attribute(AttributeSpec::new("alpha")),
        )
        .await
        .unwrap();
    let attributes = table.attributes();
    let names: Vec<&str> = attributes.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["orderId", "zeta", "alpha"]);

    // A schema change must not reshuffle the surviving attributes; the new
    // one appends.
    catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::new("zeta"))
                .attribute(AttributeSpec::new("alpha"))
                .attribute(AttributeSpec::new("middle")),
        )
        .await
        .unwrap();
    let attributes = table.attributes();
    let names: Vec<&str> = attributes.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["orderId", "zeta", "alpha", "middle"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_index_claims_converge() {
    let dir = init();
    // Short lease so a build superseded mid-race can be re-claimed promptly.
    let mut config = CatalogConfig::with_root(dir.path());
    config.lease_duration = std::time::Duration::from_millis(100);
    let catalog = Catalog::open(config);

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::new("status")),
        )
        .await
        .unwrap();
    for i in 0..500u32 {
        let pk = format!("ord-{:03}", i);
        table
            .put_record(pk.as_bytes(), &json!({"orderId": pk, "status": "open"}))
            .unwrap();
    }

    // Two services request the same index at once. Whichever claim wins,
    // the index must end up built and carrying both origins.
    let spec_for = |origin: &str| {
        TableSpec::new("sales", "orders")
            .attribute(AttributeSpec::primary_key("orderId"))
            .attribute(AttributeSpec::indexed("status"))
            .origin(origin)
    };
    let (a, b) = tokio::join!(
        catalog.ensure_table(spec_for("svc-a")),
        catalog.ensure_table(spec_for("svc-b"))
    );
    a.unwrap();
    b.unwrap();
    catalog.indexing_idle().await;

    // If the racing pair superseded the winning build, the claim is sitting
    // on an expired lease now; one more ensure resumes and finishes it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    catalog.ensure_table(spec_for("svc-a")).await.unwrap();
    catalog.indexing_idle().await;
    catalog.reload().await;

    let status = AttributeName::new("status");
    let attr = table.attribute(&status).unwrap();
    assert!(attr.indexed);
    assert!(attr.origins.contains("svc-a"), "origins: {:?}", attr.origins);
    assert!(attr.origins.contains("svc-b"), "origins: {:?}", attr.origins);
    assert_eq!(
        table.lookup_index(&status, &json!("open")).unwrap().len(),
        500
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_array_values_fan_out_in_live_index() {
    let dir = init();
    let catalog = Catalog::open(CatalogConfig::with_root(dir.path()));

    let table = catalog
        .ensure_table(
            TableSpec::new("sales", "orders")
                .attribute(AttributeSpec::primary_key("orderId"))
                .attribute(AttributeSpec::indexed("tags")),
        )
        .await
        .unwrap();
    catalog.indexing_idle().await;

    let tags = AttributeName::new("tags");
    table
        .put_record(b"o1", &json!({"orderId": "o1", "tags": ["rush", "gift"]}))
        .unwrap();
    assert_eq!(
        table.lookup_index(&tags, &json!("rush")).unwrap(),
        vec![b"o1".to_vec()]
    );
    assert_eq!(
        table.lookup_index(&tags, &json!("gift")).unwrap(),
        vec![b"o1".to_vec()]
    );

    // Rewriting with one tag removed retracts the stale entry.
    table
        .put_record(b"o1", &json!({"orderId": "o1", "tags": ["gift"]}))
        .unwrap();
    assert!(table.lookup_index(&tags, &json!("rush")).unwrap().is_empty());
    assert_eq!(
        table.lookup_index(&tags, &json!("gift")).unwrap(),
        vec![b"o1".to_vec()]
    );
}
