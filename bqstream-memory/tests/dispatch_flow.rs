//! Dispatch tick tests: bounded drain, confirmed-delivery acknowledgement,
//! and failure behavior.

use std::sync::Arc;

use bqstream::config::{StreamConfig, WarehouseCredentials};
use bqstream::dispatch::Dispatcher;
use bqstream::queue::{QueueStore, QueuedChange};
use bqstream::registry::{CaptureMode, TableDescriptor, TableRegistry};
use bqstream::types::{AttributeName, TableName, Timestamp};
use bqstream::warehouse::WarehouseClient;
use bqstream_memory::{InMemoryCursorStore, InMemoryQueueStore, InMemorySource, InMemoryWarehouse};
use chrono::Duration;

fn table(name: &str) -> TableName {
    TableName::try_new(name).unwrap()
}

fn attr(name: &str) -> AttributeName {
    AttributeName::try_new(name).unwrap()
}

fn config(batch_size: usize) -> Arc<StreamConfig> {
    Arc::new(
        StreamConfig::builder(
            WarehouseCredentials::new("client", "svc@example.com", "key", "project"),
            "analytics",
        )
        .batch_size(batch_size)
        .unwrap()
        .build()
        .unwrap(),
    )
}

fn registry() -> Arc<TableRegistry> {
    let mut registry = TableRegistry::new();
    registry
        .enroll(
            TableDescriptor::new(table("orders"))
                .with_column(attr("id"))
                .with_column(attr("status"))
                .with_column(attr("created_at"))
                .with_column(attr("updated_at")),
            CaptureMode::All,
        )
        .unwrap();
    Arc::new(registry)
}

struct Harness {
    queue: Arc<InMemoryQueueStore>,
    warehouse: Arc<InMemoryWarehouse>,
    dispatcher: Dispatcher<InMemoryQueueStore, InMemoryCursorStore, InMemorySource, InMemoryWarehouse>,
}

fn harness(batch_size: usize) -> Harness {
    let queue = Arc::new(InMemoryQueueStore::new());
    let cursors = Arc::new(InMemoryCursorStore::new());
    let source = Arc::new(InMemorySource::new());
    source.register_table(table("orders"));
    let warehouse = Arc::new(InMemoryWarehouse::new());
    let dispatcher = Dispatcher::new(
        config(batch_size),
        registry(),
        Arc::clone(&queue),
        cursors,
        source,
        Arc::clone(&warehouse),
    );
    Harness {
        queue,
        warehouse,
        dispatcher,
    }
}

fn changes(count: i64) -> Vec<QueuedChange> {
    let base = Timestamp::now();
    (0..count)
        .map(|offset| {
            QueuedChange::attribute_change(
                table("orders"),
                offset,
                attr("status"),
                Some(b"new".to_vec()),
                Timestamp::new(*base.as_datetime() + Duration::milliseconds(offset)),
            )
        })
        .collect()
}

#[tokio::test]
async fn successful_tick_delivers_acknowledges_and_collects() {
    let h = harness(1000);
    h.queue.enqueue(changes(4)).await.unwrap();

    let outcome = h.dispatcher.dequeue_items().await.unwrap();

    assert_eq!(outcome.dispatched, 4);
    assert_eq!(outcome.deleted, 4);
    assert_eq!(h.warehouse.rows_in("bq_datastream").len(), 4);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert!(h.queue.all().is_empty());
}

#[tokio::test]
async fn failed_insert_leaves_every_record_unsent() {
    let h = harness(1000);
    h.queue.enqueue(changes(3)).await.unwrap();
    h.warehouse.fail_next_insert();

    let result = h.dispatcher.dequeue_items().await;
    assert!(result.is_err());

    // Nothing acknowledged, nothing delivered, nothing deleted
    assert!(h.warehouse.rows_in("bq_datastream").is_empty());
    assert_eq!(h.queue.pending_count().await.unwrap(), 3);
    assert!(h.queue.all().iter().all(|entry| !entry.sent));

    // The next tick retries the same records and succeeds
    let outcome = h.dispatcher.dequeue_items().await.unwrap();
    assert_eq!(outcome.dispatched, 3);
    assert_eq!(h.warehouse.rows_in("bq_datastream").len(), 3);
}

#[tokio::test]
async fn empty_queue_tick_makes_no_warehouse_call() {
    let h = harness(1000);

    let outcome = h.dispatcher.dequeue_items().await.unwrap();

    assert_eq!(outcome.dispatched, 0);
    assert_eq!(h.warehouse.insert_calls(), 0);
}

#[tokio::test]
async fn tick_drains_at_most_batch_size_records() {
    let h = harness(2);
    h.queue.enqueue(changes(5)).await.unwrap();

    let outcome = h.dispatcher.dequeue_items().await.unwrap();
    assert_eq!(outcome.dispatched, 2);
    assert_eq!(h.queue.pending_count().await.unwrap(), 3);

    // Oldest records went first
    let delivered = h.warehouse.rows_in("bq_datastream");
    let ids: Vec<i64> = delivered.iter().map(|row| row.record_id).collect();
    assert_eq!(ids, vec![0, 1]);

    let outcome = h.dispatcher.dequeue_items().await.unwrap();
    assert_eq!(outcome.dispatched, 2);
    let outcome = h.dispatcher.dequeue_items().await.unwrap();
    assert_eq!(outcome.dispatched, 1);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn destroy_sentinel_reaches_the_warehouse_with_null_attr() {
    let h = harness(1000);
    h.queue
        .enqueue(vec![QueuedChange::destroy_sentinel(
            table("orders"),
            42,
            Timestamp::now(),
        )])
        .await
        .unwrap();

    h.dispatcher.dequeue_items().await.unwrap();

    let rows = h.warehouse.rows_in("bq_datastream");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attr, None);
    assert_eq!(rows[0].new_value.as_deref(), Some("True"));
}

#[tokio::test]
async fn undecodable_payload_is_repaired_not_dropped() {
    let h = harness(1000);
    h.queue
        .enqueue(vec![QueuedChange::attribute_change(
            table("orders"),
            7,
            attr("status"),
            Some(b"bro\xffken".to_vec()),
            Timestamp::now(),
        )])
        .await
        .unwrap();

    let outcome = h.dispatcher.dequeue_items().await.unwrap();
    assert_eq!(outcome.dispatched, 1);

    let rows = h.warehouse.rows_in("bq_datastream");
    assert_eq!(rows[0].new_value.as_deref(), Some("bro_ken"));
}

#[tokio::test]
async fn initialize_sink_creates_dataset_and_table_once() {
    let h = harness(1000);

    h.dispatcher.initialize_sink().await.unwrap();
    assert_eq!(
        h.warehouse.list_datasets().await.unwrap(),
        vec!["analytics".to_string()]
    );
    assert_eq!(
        h.warehouse.list_tables().await.unwrap(),
        vec!["bq_datastream".to_string()]
    );

    // Idempotent on restart
    h.dispatcher.initialize_sink().await.unwrap();
    assert_eq!(h.warehouse.list_tables().await.unwrap().len(), 1);
}
