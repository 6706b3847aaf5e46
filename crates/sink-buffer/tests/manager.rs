//! Write-cycle behavior of the buffer manager against the in-memory target.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sink_buffer::{BufferManager, MemoryTarget};
use sink_core::{
    ColumnDef, ColumnType, DestinationKey, InsertMode, LoadMode, PrimaryKeyMode, SinkConfig,
    SinkError, SinkRecord, TableDescription, UpdateMode,
};

fn key(table: &str) -> DestinationKey {
    DestinationKey::new(None, table)
}

fn record(topic: &str, value: Value) -> SinkRecord {
    SinkRecord::new(topic, None, Some(value))
}

/// Upserts keyed by the `id` value field, tables created on demand.
fn upsert_config(max_batch_wait_ms: u64) -> SinkConfig {
    let mut config = SinkConfig::default();
    config.writer.insert_mode = InsertMode::Upsert;
    config.writer.pk_mode = PrimaryKeyMode::RecordValue;
    config.writer.pk_fields = vec!["id".to_string()];
    config.writer.auto_create = true;
    config.writer.auto_evolve = true;
    config.writer.max_batch_wait_ms = max_batch_wait_ms;
    config.connection.backoff_ms = 10;
    config
}

fn manager(config: SinkConfig, target: &MemoryTarget) -> BufferManager {
    BufferManager::new(config, Arc::new(target.clone())).unwrap()
}

async fn ids(target: &MemoryTarget, table: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = target
        .rows(&key(table))
        .await
        .iter()
        .filter_map(|r| r["id"].as_i64())
        .collect();
    ids.sort_unstable();
    ids
}

#[tokio::test(start_paused = true)]
async fn test_sweep_flushes_at_max_batch_wait() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(1000), &target);

    let report = manager
        .process_cycle(vec![
            record("users", json!({"id": 1, "name": "ada"})),
            record("users", json!({"id": 2, "name": "grace"})),
        ])
        .await?;
    assert_eq!(report.records, 2);
    assert_eq!(report.routed, 2);
    assert_eq!(report.flushed_buffers, 0);
    assert_eq!(manager.live_buffers(), vec![key("users")]);
    assert!(target.rows(&key("users")).await.is_empty());

    tokio::time::advance(Duration::from_millis(999)).await;
    let report = manager.process_cycle(vec![]).await?;
    assert_eq!(report.flushed_buffers, 0);
    assert_eq!(manager.pending_rows(), 2);

    tokio::time::advance(Duration::from_millis(1)).await;
    let report = manager.process_cycle(vec![]).await?;
    assert_eq!(report.flushed_buffers, 1);
    assert_eq!(report.flushed_rows, 2);
    assert_eq!(report.live_buffers, 0);
    assert_eq!(ids(&target, "users").await, vec![1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_full_buffer_is_flushed_early() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = upsert_config(60_000);
    config.writer.batch_size = 2;
    let mut manager = manager(config, &target);

    let report = manager
        .process_cycle((1..=3).map(|id| record("users", json!({"id": id}))).collect())
        .await?;
    assert_eq!(report.early_flushes, 1);
    assert_eq!(report.flushed_rows, 2);
    assert_eq!(report.flushed_buffers, 0);

    // The early flush was committed with the cycle; the third row waits.
    assert_eq!(ids(&target, "users").await, vec![1, 2]);
    assert_eq!(manager.pending_rows(), 1);
    assert_eq!(manager.live_buffers(), vec![key("users")]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_rolls_back_every_destination() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(0), &target);
    target.fail_table(key("orders"), "disk full").await;

    let err = manager
        .process_cycle(vec![
            record("users", json!({"id": 1})),
            record("orders", json!({"id": 10, "total": 9.5})),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Load { .. }));
    assert!(err.is_retriable());

    assert!(target.rows(&key("users")).await.is_empty());
    assert!(target.rows(&key("orders")).await.is_empty());
    assert_eq!(target.rollbacks().await, 1);
    assert_eq!(manager.live_buffers(), vec![key("orders"), key("users")]);
    assert_eq!(manager.pending_rows(), 2);

    target.clear_failure(&key("orders")).await;
    let report = manager.process_cycle(vec![]).await?;
    assert_eq!(report.flushed_buffers, 2);
    assert_eq!(ids(&target, "users").await, vec![1]);
    assert_eq!(ids(&target, "orders").await, vec![10]);
    assert!(manager.live_buffers().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failure_rolls_back_destinations_flushed_earlier() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(0), &target);
    target.fail_table(key("zeta"), "disk full").await;

    // `alpha` is flushed and executed before `zeta` fails.
    let err = manager
        .process_cycle(vec![
            record("alpha", json!({"id": 1})),
            record("zeta", json!({"id": 26})),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Load { .. }));
    assert!(target.rows(&key("alpha")).await.is_empty());
    assert!(target.rows(&key("zeta")).await.is_empty());
    assert_eq!(manager.live_buffers(), vec![key("alpha"), key("zeta")]);

    target.clear_failure(&key("zeta")).await;
    manager.process_cycle(vec![]).await?;
    assert_eq!(ids(&target, "alpha").await, vec![1]);
    assert_eq!(ids(&target, "zeta").await, vec![26]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_and_is_idempotent() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(60_000), &target);

    manager
        .process_cycle(vec![record("users", json!({"id": 7}))])
        .await?;
    assert!(target.rows(&key("users")).await.is_empty());

    manager.close().await?;
    assert!(manager.is_closed());
    assert_eq!(ids(&target, "users").await, vec![7]);
    let commits = target.commits().await;

    manager.close().await?;
    assert_eq!(target.commits().await, commits);

    let err = manager.process_cycle(vec![]).await.unwrap_err();
    assert!(matches!(err, SinkError::Closed(_)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unroutable_records_are_discarded() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = upsert_config(0);
    config.writer.auto_create = false;
    let mut manager = manager(config, &target);
    target
        .create_table(TableDescription::new(
            key("users"),
            vec![ColumnDef::new("id", ColumnType::BigInt, false)],
            vec!["id".to_string()],
        ))
        .await;

    let err = manager
        .process_cycle(vec![
            record("missing", json!({"id": 1})),
            record("users", json!({"id": 2})),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Routing(_)));
    assert!(!err.is_retriable());
    // The failing record is dropped, the rest is kept for the next cycle.
    assert_eq!(manager.backlog_len(), 1);

    manager.process_cycle(vec![]).await?;
    assert_eq!(manager.backlog_len(), 0);
    assert_eq!(ids(&target, "users").await, vec![2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_empty_destination_name_is_a_routing_error() {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(0), &target);
    let err = manager
        .process_cycle(vec![record("", json!({"id": 1}))])
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Routing(_)));
    assert_eq!(manager.backlog_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tombstones_delete_keyed_rows() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = upsert_config(0);
    config.writer.pk_mode = PrimaryKeyMode::RecordKey;
    config.writer.delete_enabled = true;
    let mut manager = manager(config, &target);

    manager
        .process_cycle(vec![
            SinkRecord::new("users", Some(json!({"id": 1})), Some(json!({"name": "ada"}))),
            SinkRecord::new("users", Some(json!({"id": 2})), Some(json!({"name": "bob"}))),
        ])
        .await?;
    assert_eq!(ids(&target, "users").await, vec![1, 2]);

    let report = manager
        .process_cycle(vec![SinkRecord::new("users", Some(json!({"id": 1})), None)])
        .await?;
    assert_eq!(report.routed, 1);
    assert_eq!(ids(&target, "users").await, vec![2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_tombstones_are_skipped_without_delete_support() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(0), &target);
    let report = manager
        .process_cycle(vec![SinkRecord::new("users", Some(json!({"id": 1})), None)])
        .await?;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.routed, 0);
    assert!(manager.live_buffers().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_first_row_only_collapses_repeated_keys() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = upsert_config(0);
    config.writer.insert_mode = InsertMode::Insert;
    config.writer.update_mode = UpdateMode::FirstRowOnly;
    let mut manager = manager(config, &target);

    // Without collapsing, the second insert would violate the primary key.
    manager
        .process_cycle(vec![
            record("users", json!({"id": 1, "name": "first"})),
            record("users", json!({"id": 1, "name": "second"})),
        ])
        .await?;
    assert_eq!(
        target.rows(&key("users")).await,
        vec![json!({"id": 1, "name": "first"})]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_new_fields_evolve_the_table() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut manager = manager(upsert_config(0), &target);

    manager
        .process_cycle(vec![record("users", json!({"id": 1}))])
        .await?;
    manager
        .process_cycle(vec![record("users", json!({"id": 2, "email": "a@b.c"}))])
        .await?;

    let table = target.table(&key("users")).await.unwrap();
    assert_eq!(table.column_names(), vec!["id", "email"]);
    assert_eq!(ids(&target, "users").await, vec![1, 2]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_connection_attempts_are_retried() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    target.fail_connects(2).await;
    let mut manager = manager(upsert_config(0), &target);
    manager
        .process_cycle(vec![record("users", json!({"id": 1}))])
        .await?;
    assert_eq!(target.connects().await, 1);

    let target = MemoryTarget::new();
    target.fail_connects(3).await;
    let mut manager = crate::manager(upsert_config(0), &target);
    let err = manager
        .process_cycle(vec![record("users", json!({"id": 1}))])
        .await
        .unwrap_err();
    assert!(matches!(err, SinkError::Database(_)));
    // Nothing was routed, so the records wait for the next cycle.
    assert_eq!(manager.backlog_len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_windowed_stream_is_pulled_into_the_table() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = SinkConfig::default();
    config.writer.load_mode = LoadMode::WindowedStream;
    config.writer.auto_create = true;
    config.writer.max_batch_wait_ms = 0;
    config.stream.listen_host = "127.0.0.1".to_string();
    config.stream.port_range = vec![0];
    config.stream.flush_time_secs = 0;
    config.stream.batch_timeout_secs = 1;
    let mut manager = manager(config, &target);

    let report = manager
        .process_cycle(vec![
            record("clicks", json!({"id": 1, "page": "/home"})),
            record("clicks", json!({"id": 2, "page": "/a,b"})),
            record("views", json!({"id": 3, "page": null})),
        ])
        .await?;
    assert_eq!(report.flushed_buffers, 2);
    assert_eq!(report.flushed_rows, 3);

    assert_eq!(
        target.rows(&key("clicks")).await,
        vec![
            json!({"id": 1, "page": "/home"}),
            json!({"id": 2, "page": "/a,b"})
        ]
    );
    assert_eq!(ids(&target, "views").await, vec![3]);
    assert_eq!(target.external_loads().await.len(), 2);

    manager.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_windowed_flush_larger_than_one_pull_loses_nothing() -> anyhow::Result<()> {
    let target = MemoryTarget::new();
    let mut config = SinkConfig::default();
    config.writer.load_mode = LoadMode::WindowedStream;
    config.writer.auto_create = true;
    config.writer.max_batch_wait_ms = 0;
    config.writer.batch_size = 2;
    config.connection.backoff_ms = 10;
    config.stream.listen_host = "127.0.0.1".to_string();
    config.stream.port_range = vec![0];
    config.stream.flush_count = 1;
    config.stream.batch_count = 2;
    config.stream.flush_time_secs = 0;
    config.stream.batch_timeout_secs = 1;
    let mut manager = manager(config, &target);
    target.fail_table(key("clicks"), "segment down").await;

    manager
        .process_cycle(vec![
            record("clicks", json!({"id": 1})),
            record("clicks", json!({"id": 2})),
        ])
        .await
        .unwrap_err();
    assert_eq!(manager.pending_rows(), 2);

    // Two replayed rows plus a new one make three chunks, more than a
    // single pull takes.
    target.clear_failure(&key("clicks")).await;
    let report = manager
        .process_cycle(vec![record("clicks", json!({"id": 3}))])
        .await?;
    assert_eq!(report.flushed_rows, 3);
    assert_eq!(manager.pending_rows(), 0);

    manager.close().await?;
    assert_eq!(ids(&target, "clicks").await, vec![1, 2, 3]);
    assert_eq!(target.rows(&key("clicks")).await.len(), 3);
    assert_eq!(target.external_loads().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_external_file_mode_writes_load_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = MemoryTarget::new();
    let mut config = SinkConfig::default();
    config.writer.load_mode = LoadMode::ExternalFile;
    config.writer.auto_create = true;
    config.writer.max_batch_wait_ms = 0;
    config.file.output_dir = dir.path().to_path_buf();
    config.file.csv_header = false;
    let mut manager = manager(config, &target);

    manager
        .process_cycle(vec![
            record("orders", json!({"id": 1, "total": 2.5})),
            record("orders", json!({"id": 2, "total": null})),
        ])
        .await?;

    let mut names: Vec<String> = std::fs::read_dir(dir.path())?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("orders-") && names[0].ends_with(".csv"));
    assert!(names[1].ends_with(".yml"));

    let data = std::fs::read_to_string(dir.path().join(&names[0]))?;
    assert_eq!(data, "1,2.5\n2,\n");
    // The loader, not the sink, moves the rows.
    assert!(target.rows(&key("orders")).await.is_empty());
    Ok(())
}
