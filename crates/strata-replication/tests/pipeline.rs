//! End-to-end ingestion tests against an in-process HTTP replication feed.
//!
//! These tests drive the real HTTP source through full iterations and inspect
//! the per-diff files and cursors they produce.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use strata_core::clock::FixedClock;
use strata_core::element::{ElementType, TypedElementId};
use strata_core::replica::{Dataset, Feed, ReplicaPointer, Resolution};
use strata_core::retry::RetryPolicy;
use strata_replication::compactor::replica_paths;
use strata_replication::parquet_util::{StoredChange, read_changes};
use strata_replication::source::{DIFF_SUFFIX, STATE_SUFFIX, parse_state_text};
use strata_replication::{HttpSource, ReplicationConfig, ReplicationError, Replicator};
use strata_test_utils::{ElementXml, OsmChangeBuilder, ReplicationFeedServer, init_test_logging};

fn epoch_plus(delta: TimeDelta) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + delta
}

fn day_pointer(n: i64) -> ReplicaPointer {
    ReplicaPointer::new(u64::try_from(n).unwrap(), epoch_plus(TimeDelta::days(n)))
}

fn config(data_dir: &Path, server: &ReplicationFeedServer) -> ReplicationConfig {
    let mut config = ReplicationConfig::new(data_dir, server.base_url());
    config.iteration_retry = RetryPolicy::within(Duration::from_secs(10))
        .with_delays(Duration::from_millis(10), Duration::from_millis(100));
    config
}

fn replicator(config: ReplicationConfig, now: DateTime<Utc>) -> Replicator<HttpSource> {
    let source = HttpSource::new(&config).unwrap();
    Replicator::new(config, source).with_clock(Arc::new(FixedClock(now)))
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn all_rows(data_dir: &Path) -> Vec<StoredChange> {
    replica_paths(data_dir)
        .unwrap()
        .iter()
        .flat_map(|path| read_changes(path).unwrap())
        .collect()
}

const LIVE_DAY: Feed = Feed::new(Dataset::Replication, Resolution::Day);
const T0: &str = "1970-01-02T00:00:00Z";

#[test]
fn test_state_text_example_parses() {
    let pointer = parse_state_text("sequenceNumber=42\ntimestamp=2024-01-01T00:00:00Z\n").unwrap();
    assert_eq!(
        pointer,
        ReplicaPointer::new(42, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    );
}

/// Three creates, one modify and one delete across all element kinds.
#[tokio::test]
async fn test_five_action_diff_yields_five_rows() {
    init_test_logging();
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let diff = OsmChangeBuilder::new()
        .create(
            ElementXml::node(1, 1, T0)
                .coords(51.5, -0.12)
                .user(42, "mapper")
                .tag("amenity", "cafe"),
        )
        .create(ElementXml::way(10, 1, T0).nd(1).nd(2).tag("highway", "path"))
        .create(
            ElementXml::relation(100, 1, T0)
                .member("node", 1, "stop")
                .member("way", 10, ""),
        )
        .modify(ElementXml::node(2, 2, T0).coords(51.6, -0.13))
        .delete(ElementXml::node(3, 4, T0))
        .gzip();
    server.publish(LIVE_DAY, day_pointer(1), diff);

    let iteration = replicator(config(dir.path(), &server), far_future())
        .run_once()
        .await
        .unwrap();
    assert_eq!(iteration.rows, 5);
    assert_eq!(iteration.cursor.last_sequence_id, 5);

    let rows = read_changes(&day_pointer(1).replica_path(dir.path())).unwrap();
    let order: Vec<_> = rows
        .iter()
        .map(|r| (r.typed_id.to_string(), r.sequence_id))
        .collect();
    assert_eq!(
        order,
        vec![
            ("node/1".to_string(), 1),
            ("node/2".to_string(), 4),
            ("node/3".to_string(), 5),
            ("way/10".to_string(), 2),
            ("relation/100".to_string(), 3),
        ]
    );

    let node = &rows[0];
    assert!(node.visible);
    assert_eq!(node.point.as_ref().map(Vec::len), Some(21));
    assert_eq!(node.user_id, Some(42));
    assert_eq!(node.display_name.as_deref(), Some("mapper"));
    assert_eq!(node.tags.as_ref().unwrap()["amenity"], "cafe");

    let deleted = &rows[2];
    assert!(!deleted.visible);
    assert!(deleted.tags.is_none() && deleted.point.is_none() && deleted.members.is_none());

    let way = &rows[3];
    let refs: Vec<_> = way.members.as_ref().unwrap().iter().map(|m| m.typed_id).collect();
    assert_eq!(
        refs,
        vec![
            TypedElementId::new(ElementType::Node, 1).unwrap(),
            TypedElementId::new(ElementType::Node, 2).unwrap(),
        ]
    );

    let relation = &rows[4];
    let members = relation.members.as_ref().unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].typed_id, TypedElementId::new(ElementType::Node, 1).unwrap());
    assert_eq!(members[0].role.as_deref(), Some("stop"));
    assert_eq!(members[1].typed_id, TypedElementId::new(ElementType::Way, 10).unwrap());
}

#[tokio::test]
async fn test_sequence_ids_are_gap_free_across_iterations() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // Same timestamp on nodes 6 and 7: parse order breaks the tie.
    server.publish(
        LIVE_DAY,
        day_pointer(1),
        OsmChangeBuilder::new()
            .create(ElementXml::node(5, 1, "1970-01-01T12:00:10Z").coords(1.0, 1.0))
            .create(ElementXml::node(6, 1, "1970-01-01T12:00:00Z").coords(1.0, 1.0))
            .create(ElementXml::node(7, 1, "1970-01-01T12:00:00Z").coords(1.0, 1.0))
            .gzip(),
    );
    server.publish(LIVE_DAY, day_pointer(2), OsmChangeBuilder::new().gzip());
    server.publish(
        LIVE_DAY,
        day_pointer(3),
        OsmChangeBuilder::new()
            .modify(ElementXml::node(5, 2, "1970-01-03T12:00:00Z").coords(2.0, 2.0))
            .delete(ElementXml::node(6, 2, "1970-01-03T11:00:00Z"))
            .gzip(),
    );

    let replicator = replicator(config(dir.path(), &server), far_future());
    let mut totals = Vec::new();
    for _ in 0..3 {
        let iteration = replicator.run_once().await.unwrap();
        totals.push((iteration.rows, iteration.cursor.last_sequence_id));
    }
    assert_eq!(totals, vec![(3, 3), (0, 3), (2, 5)]);
    assert_eq!(replica_paths(dir.path()).unwrap().len(), 2);

    let mut rows = all_rows(dir.path());
    rows.sort_by_key(|r| r.sequence_id);
    let replay: Vec<_> = rows
        .iter()
        .map(|r| (r.sequence_id, r.typed_id.element_id(), r.version))
        .collect();
    assert_eq!(
        replay,
        vec![(1, 6, 1), (2, 7, 1), (3, 5, 1), (4, 6, 2), (5, 5, 2)]
    );
}

#[tokio::test]
async fn test_transient_server_errors_are_retried() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.publish(
        LIVE_DAY,
        day_pointer(1),
        OsmChangeBuilder::new()
            .create(ElementXml::node(1, 1, T0).coords(0.5, 0.5))
            .gzip(),
    );
    server.fail_next(2, 503);

    let iteration = replicator(config(dir.path(), &server), far_future())
        .run_once()
        .await
        .unwrap();

    assert_eq!(iteration.rows, 1);
    assert_eq!(server.request_count(STATE_SUFFIX), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.fail_next(1, 403);

    let err = replicator(config(dir.path(), &server), far_future())
        .run_once()
        .await
        .unwrap_err();

    assert!(err.to_string().contains("403"), "{err}");
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_missing_coarse_diff_body_is_not_published() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    server.publish_state(LIVE_DAY, day_pointer(1));

    let mut config = config(dir.path(), &server);
    config.iteration_retry = RetryPolicy::no_retry();
    let replicator = replicator(config, far_future());
    let err = replicator.run_once().await.unwrap_err();

    assert!(
        matches!(&err, ReplicationError::RetriesExhausted { source, .. }
            if matches!(**source, ReplicationError::NotPublished { sequence_number: 1, .. })),
        "{err:?}"
    );
    assert_eq!(server.request_count(DIFF_SUFFIX), 1);
    assert!(replica_paths(dir.path()).unwrap().is_empty());
    assert!(!replicator.store().path().exists());
}

#[tokio::test]
async fn test_historical_datasets_chain_into_live_feed() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let node = |id| {
        OsmChangeBuilder::new()
            .create(ElementXml::node(id, 1, T0).coords(0.0, 0.0))
            .gzip()
    };
    server.publish(Feed::new(Dataset::CcBySa, Resolution::Day), day_pointer(1), node(1));
    server.publish(Feed::new(Dataset::RedactionPeriod, Resolution::Day), day_pointer(1), node(2));
    server.publish(LIVE_DAY, day_pointer(1), node(3));

    let config = config(dir.path(), &server).with_archive(server.base_url());
    let replicator = replicator(config, far_future());

    let mut datasets = Vec::new();
    for _ in 0..3 {
        let iteration = replicator.run_once().await.unwrap();
        datasets.push((iteration.cursor.dataset, iteration.cursor.last_sequence_id));
    }
    assert_eq!(
        datasets,
        vec![
            (Dataset::CcBySa, 1),
            (Dataset::RedactionPeriod, 2),
            (Dataset::Replication, 3),
        ]
    );
    assert!(
        server
            .requests()
            .iter()
            .any(|path| path == "/cc-by-sa/day-replicate/000/000/002.state.txt")
    );
}

#[tokio::test]
async fn test_escalates_to_hourly_once_caught_up() {
    let server = ReplicationFeedServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let hourly = Feed::new(Dataset::Replication, Resolution::Hour);

    server.publish(
        LIVE_DAY,
        day_pointer(1),
        OsmChangeBuilder::new()
            .create(ElementXml::node(1, 1, "1970-01-01T06:00:00Z").coords(0.0, 0.0))
            .gzip(),
    );
    for n in 1..=48 {
        server.publish_state(
            hourly,
            ReplicaPointer::new(u64::try_from(n).unwrap(), epoch_plus(TimeDelta::hours(n))),
        );
    }
    server.publish(
        hourly,
        ReplicaPointer::new(25, epoch_plus(TimeDelta::hours(25))),
        OsmChangeBuilder::new()
            .create(ElementXml::node(2, 1, "1970-01-02T00:30:00Z").coords(0.0, 0.0))
            .gzip(),
    );

    let replicator = replicator(config(dir.path(), &server), epoch_plus(TimeDelta::hours(30)));
    let first = replicator.run_once().await.unwrap();
    assert_eq!(first.cursor.resolution, Resolution::Day);

    let second = replicator.run_once().await.unwrap();
    assert_eq!(second.cursor.resolution, Resolution::Hour);
    assert_eq!(second.cursor.last_replica.sequence_number, 25);
    assert_eq!(second.cursor.last_sequence_id, 2);
    assert_eq!(replicator.store().load().unwrap(), second.cursor);
}
