//! End-to-end archive tests against the SQLite backend and fs storage.

use muninn_archive::{
    Archive, ArchiveOptions, AttachOptions, CascadeRule, IngestOptions, ProductTypePlugin,
    Registry, SearchQuery,
};
use muninn_archive::AnalyzeResult;
use muninn_core::expr::{ParameterValue, Parameters};
use muninn_core::{Properties, Result, SchemaRegistry, Value};
use muninn_database::{DatabaseBackend, SqliteBackend};
use muninn_storage::{FilesystemBackend, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;

/// Simple single-file product type; files land under `abc/2024`.
struct AbcPlugin {
    cascade_rule: CascadeRule,
    product_type: &'static str,
    archive_path: &'static str,
}

impl AbcPlugin {
    fn new(product_type: &'static str, archive_path: &'static str) -> Self {
        Self {
            cascade_rule: CascadeRule::Ignore,
            product_type,
            archive_path,
        }
    }

    fn with_cascade_rule(mut self, rule: CascadeRule) -> Self {
        self.cascade_rule = rule;
        self
    }
}

#[async_trait::async_trait]
impl ProductTypePlugin for AbcPlugin {
    fn product_type(&self) -> &str {
        self.product_type
    }

    fn use_enclosing_directory(&self) -> bool {
        false
    }

    fn cascade_rule(&self) -> CascadeRule {
        self.cascade_rule
    }

    fn identify(&self, paths: &[PathBuf]) -> bool {
        paths.len() == 1
            && paths[0]
                .extension()
                .is_some_and(|extension| extension == "dat")
    }

    fn analyze(&self, paths: &[PathBuf]) -> Result<AnalyzeResult> {
        let name = paths[0].file_name().unwrap().to_string_lossy().into_owned();
        let mut properties = Properties::new();
        properties.set("product_name", Value::Text(name));
        Ok(properties.into())
    }

    fn archive_path(&self, _properties: &Properties) -> Result<String> {
        Ok(self.archive_path.to_string())
    }
}

struct TestArchive {
    archive: Archive,
    dir: tempfile::TempDir,
}

async fn test_archive(registry: Registry) -> TestArchive {
    let dir = tempfile::tempdir().unwrap();
    let schemas = Arc::new(SchemaRegistry::new());
    let database = SqliteBackend::new(
        dir.path().join("catalogue.db").to_str().unwrap(),
        "",
        None,
        schemas.clone(),
    )
    .unwrap();
    let storage = FilesystemBackend::new(dir.path().join("archive"));
    let archive = Archive::new(
        Arc::new(database),
        Arc::new(storage),
        schemas,
        registry,
        ArchiveOptions::default(),
    );
    archive.prepare(false).await.unwrap();
    TestArchive { archive, dir }
}

fn abc_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_product_type(Arc::new(AbcPlugin::new("ABC", "abc/2024")))
        .unwrap();
    registry
}

fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn ingest_and_search_roundtrip() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");

    let properties = fixture
        .archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap();
    let uuid = properties.core_uuid().unwrap();

    let found = fixture
        .archive
        .search(&SearchQuery::new("product_name == \"alpha.dat\""))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let product = &found[0];
    assert_eq!(product.core_uuid().unwrap(), uuid);
    assert_eq!(product.core_long("size"), Some(5));
    assert_eq!(product.core_text("archive_path"), Some("abc/2024"));
    assert_eq!(
        product.core_text("hash"),
        Some("md5:5d41402abc4b2a76b9719d911017c592")
    );
    assert_eq!(product.core_bool("active"), Some(true));
    assert!(product.core_timestamp("archive_date").is_some());

    // retrieved bytes are identical to what went in
    let target = fixture.dir.path().join("out");
    std::fs::create_dir(&target).unwrap();
    let retrieved = fixture
        .archive
        .retrieve_by_uuid(uuid, &target, false)
        .await
        .unwrap();
    assert_eq!(std::fs::read(retrieved).unwrap(), b"hello");
}

#[tokio::test]
async fn duplicate_ingest_conflicts() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");

    fixture
        .archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    let error = fixture
        .archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(error, muninn_core::Error::Conflict(_)),
        "expected conflict, got {error}"
    );
    assert_eq!(
        fixture.archive.count("", &Parameters::new()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn forced_ingest_reclaims_the_slot() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");

    fixture
        .archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    let properties = fixture
        .archive
        .ingest(
            &[source],
            IngestOptions {
                force: true,
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        fixture.archive.count("", &Parameters::new()).await.unwrap(),
        1
    );
    assert_eq!(properties.core_bool("active"), Some(true));
}

#[tokio::test]
async fn cascade_purge_removes_derived_products() {
    let mut registry = Registry::new();
    registry
        .register_product_type(Arc::new(AbcPlugin::new("RAW", "raw")))
        .unwrap();
    registry
        .register_product_type(Arc::new(
            AbcPlugin::new("L1", "l1").with_cascade_rule(CascadeRule::Purge),
        ))
        .unwrap();
    let fixture = test_archive(registry).await;

    let source = write_file(&fixture.dir, "source.dat", b"raw bytes");
    let derived = write_file(&fixture.dir, "derived.dat", b"level one");
    let source_props = fixture
        .archive
        .ingest(
            &[source],
            IngestOptions {
                product_type: Some("RAW".to_string()),
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    let derived_props = fixture
        .archive
        .ingest(
            &[derived],
            IngestOptions {
                product_type: Some("L1".to_string()),
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    fixture
        .archive
        .link(
            derived_props.core_uuid().unwrap(),
            &[source_props.core_uuid().unwrap()],
        )
        .await
        .unwrap();

    let removed = fixture
        .archive
        .remove(
            "uuid == @uuid",
            &single_uuid(source_props.core_uuid().unwrap()),
            false,
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);

    // the derived product went with its source
    assert_eq!(
        fixture.archive.count("", &Parameters::new()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn cascade_rule_strip_keeps_rows() {
    let mut registry = Registry::new();
    registry
        .register_product_type(Arc::new(AbcPlugin::new("RAW", "raw")))
        .unwrap();
    registry
        .register_product_type(Arc::new(
            AbcPlugin::new("L1", "l1").with_cascade_rule(CascadeRule::Strip),
        ))
        .unwrap();
    let fixture = test_archive(registry).await;

    let source = write_file(&fixture.dir, "source.dat", b"raw bytes");
    let derived = write_file(&fixture.dir, "derived.dat", b"level one");
    let source_props = fixture
        .archive
        .ingest(
            &[source],
            IngestOptions {
                product_type: Some("RAW".to_string()),
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    let derived_props = fixture
        .archive
        .ingest(
            &[derived],
            IngestOptions {
                product_type: Some("L1".to_string()),
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    let derived_uuid = derived_props.core_uuid().unwrap();
    fixture
        .archive
        .link(derived_uuid, &[source_props.core_uuid().unwrap()])
        .await
        .unwrap();

    fixture
        .archive
        .remove(
            "uuid == @uuid",
            &single_uuid(source_props.core_uuid().unwrap()),
            false,
        )
        .await
        .unwrap();

    // the derived row survives, its bytes do not
    let rows = fixture
        .archive
        .search(&SearchQuery::new("product_type == \"L1\""))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].core_text("archive_path").is_none());
    assert!(rows[0].core_timestamp("archive_date").is_none());
}

#[tokio::test]
async fn null_is_matched_by_inequality_only() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");
    fixture
        .archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap();

    let hits = fixture
        .archive
        .search(&SearchQuery::new("remote_url != \"x\""))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    let hits = fixture
        .archive
        .search(&SearchQuery::new("is_defined(remote_url)"))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn validity_interval_arithmetic() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");
    let mut supplied = Properties::new();
    supplied.set("product_name", Value::Text("alpha.dat".to_string()));
    supplied.set(
        "validity_start",
        Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:00:00").unwrap()),
    );
    supplied.set(
        "validity_stop",
        Value::Timestamp(muninn_core::parse_timestamp("2024-01-01T00:05:00").unwrap()),
    );
    fixture
        .archive
        .ingest(
            &[source],
            IngestOptions {
                properties: Some(supplied),
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();

    let hits = fixture
        .archive
        .search(&SearchQuery::new("validity_stop - validity_start > 299"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    let hits = fixture
        .archive
        .search(&SearchQuery::new("validity_stop - validity_start > 301"))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn strip_then_attach_restores_the_product() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");
    let properties = fixture
        .archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    let uuid = properties.core_uuid().unwrap();
    let original_hash = properties.core_text("hash").unwrap().to_string();

    let stripped = fixture
        .archive
        .strip("uuid == @uuid", &single_uuid(uuid), false)
        .await
        .unwrap();
    assert_eq!(stripped, 1);

    let row = fixture
        .archive
        .retrieve_properties(uuid)
        .await
        .unwrap();
    assert!(row.core_text("archive_path").is_none());
    assert!(row.core_timestamp("archive_date").is_none());
    assert_eq!(row.core_bool("active"), Some(true));

    let restored = fixture
        .archive
        .attach(&[source], AttachOptions::default())
        .await
        .unwrap();
    assert_eq!(restored.core_uuid().unwrap(), uuid);
    assert_eq!(restored.core_text("archive_path"), Some("abc/2024"));
    assert_eq!(restored.core_long("size"), Some(5));
    assert_eq!(restored.core_text("hash"), Some(original_hash.as_str()));
    assert!(fixture
        .archive
        .verify_hash("uuid == @uuid", &single_uuid(uuid))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn attach_refuses_when_bytes_exist() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");
    fixture
        .archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();

    let error = fixture
        .archive
        .attach(&[source], AttachOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(error, muninn_core::Error::State(_)),
        "expected state error, got {error}"
    );
}

#[tokio::test]
async fn prepare_destroy_leaves_nothing() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");
    fixture
        .archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap();

    fixture.archive.destroy().await.unwrap();

    let database = SqliteBackend::new(
        fixture.dir.path().join("catalogue.db").to_str().unwrap(),
        "",
        None,
        Arc::new(SchemaRegistry::new()),
    )
    .unwrap();
    assert!(!database.exists().await.unwrap());
    let storage = FilesystemBackend::new(fixture.dir.path().join("archive"));
    assert!(!storage.exists().await.unwrap());
}

#[tokio::test]
async fn catalogue_only_ingest_and_properties_lifecycle() {
    let fixture = test_archive(abc_registry()).await;
    let source = write_file(&fixture.dir, "alpha.dat", b"hello");

    let properties = fixture
        .archive
        .ingest(
            &[source],
            IngestOptions {
                ingest_product: false,
                ..IngestOptions::default()
            },
        )
        .await
        .unwrap();
    let uuid = properties.core_uuid().unwrap();
    assert!(properties.core_text("archive_path").is_none());

    // update a property and read it back
    let mut update = Properties::new();
    update.set("remote_url", Value::Text("https://example.com/alpha.dat".to_string()));
    fixture
        .archive
        .update_properties(&mut update, Some(uuid), false)
        .await
        .unwrap();
    let row = fixture.archive.retrieve_properties(uuid).await.unwrap();
    assert_eq!(
        row.core_text("remote_url"),
        Some("https://example.com/alpha.dat")
    );

    // delete_properties leaves storage alone and skips cascade
    let deleted = fixture
        .archive
        .delete_properties("uuid == @uuid", &single_uuid(uuid))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(
        fixture.archive.count("", &Parameters::new()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn tags_and_links_are_idempotent() {
    let fixture = test_archive(abc_registry()).await;
    let a = write_file(&fixture.dir, "a.dat", b"a");
    let b = write_file(&fixture.dir, "b.dat", b"b");
    let product_a = fixture
        .archive
        .ingest(&[a], IngestOptions::default())
        .await
        .unwrap();
    let product_b = fixture
        .archive
        .ingest(&[b], IngestOptions::default())
        .await
        .unwrap();
    let uuid_a = product_a.core_uuid().unwrap();
    let uuid_b = product_b.core_uuid().unwrap();

    fixture.archive.tag(uuid_a, &["nrt".to_string()]).await.unwrap();
    fixture.archive.tag(uuid_a, &["nrt".to_string()]).await.unwrap();
    assert_eq!(fixture.archive.tags(uuid_a).await.unwrap(), vec!["nrt"]);
    assert!(fixture.archive.tag(uuid_a, &["".to_string()]).await.is_err());

    fixture.archive.link(uuid_b, &[uuid_a]).await.unwrap();
    fixture.archive.link(uuid_b, &[uuid_a]).await.unwrap();
    assert_eq!(
        fixture.archive.source_products(uuid_b).await.unwrap(),
        vec![uuid_a]
    );
    // self-links are rejected
    assert!(fixture.archive.link(uuid_a, &[uuid_a]).await.is_err());

    let hits = fixture
        .archive
        .search(&SearchQuery::new("has_tag(\"nrt\")"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].core_uuid().unwrap(), uuid_a);
}

#[tokio::test]
async fn summary_over_ingested_products() {
    let fixture = test_archive(abc_registry()).await;
    for (name, content) in [("a.dat", "xx"), ("b.dat", "yyy"), ("c.dat", "zzzz")] {
        let path = write_file(&fixture.dir, name, content.as_bytes());
        fixture
            .archive
            .ingest(&[path], IngestOptions::default())
            .await
            .unwrap();
    }

    let result = fixture
        .archive
        .summary(&muninn_archive::SummaryQuery {
            group_by: vec!["core.product_type".to_string()],
            aggregates: vec!["core.size.sum".to_string()],
            ..muninn_archive::SummaryQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0], Some(Value::Text("ABC".to_string())));
    assert_eq!(result.rows[0][1], Some(Value::Long(3)));
    assert_eq!(result.rows[0][2], Some(Value::Long(9)));
}

fn single_uuid(uuid: uuid::Uuid) -> Parameters {
    let mut parameters = Parameters::new();
    parameters.insert("uuid".to_string(), ParameterValue::Single(Value::Uuid(uuid)));
    parameters
}
