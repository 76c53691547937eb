//! End-to-end generation run against an on-disk store, with the compiler
//! stages faked by shell stubs.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use courier_graph::config::BuildConfig;
use courier_graph::model::BuildStatus;
use courier_graph::pipeline::{PipelineRunner, GENERATION_INSTANCE};
use courier_graph::profiles::{Variant, VehicleClass};
use courier_graph::registry::BuildRegistry;
use courier_graph::store::Store;

fn write_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

fn seed_network(db_path: &Path) {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.execute_batch(
        r#"
        INSERT INTO roads (id, name, road_type, one_way) VALUES
            (1, 'Oranienstraße', 'secondary', 0),
            (2, 'Mehringdamm', 'primary', 1);

        INSERT INTO road_nodes (id, lat, lon) VALUES
            (901, 52.5010, 13.4180);

        INSERT INTO road_segments (id, road_id, geometry, one_way, speed_limit) VALUES
            (1, 1, '[[52.5010,13.4180],[52.5020,13.4195]]', 0, 30),
            (2, 1, '[[52.5020,13.4195],[52.5031,13.4210]]', 0, NULL),
            (3, 2, '[[52.4930,13.3880],[52.4950,13.3885]]', 0, 50);

        INSERT INTO segment_feedback (segment_id, adjustment, severity, created_at) VALUES
            (1, NULL, 'MAJOR', '2026-08-01T08:00:00.000000Z'),
            (1, 0.5, NULL, '2026-08-01T09:00:00.000000Z');

        INSERT INTO traffic_conditions (segment_id, level, recorded_at, expires_at) VALUES
            (2, 'CONGESTED', '2026-08-07T07:55:00.000000Z', '2999-01-01T00:00:00.000000Z');
        "#,
    )
    .unwrap();
}

struct Harness {
    registry: Arc<BuildRegistry>,
    runner: PipelineRunner,
    work_dir: std::path::PathBuf,
}

fn harness(dir: &Path) -> Harness {
    let db_path = dir.join("courier.db");
    let store = Store::open(&db_path).unwrap();
    store.init_schema().unwrap();
    seed_network(&db_path);

    let mut config = BuildConfig::default();
    config.store_path = db_path;
    config.work_dir = dir.join("work");
    config.segment_batch_size = 2;
    config.compiler.extract_bin = write_tool(dir, "fake-extract", "exit 0");
    config.compiler.partition_bin = write_tool(dir, "fake-partition", "exit 0");
    config.compiler.customize_bin = write_tool(dir, "fake-customize", "exit 0");
    config.variants = vec![
        Variant { vehicle: VehicleClass::Car, rating_enabled: true, traffic_enabled: true },
        Variant { vehicle: VehicleClass::Bike, rating_enabled: false, traffic_enabled: true },
    ];

    let work_dir = config.work_dir.clone();
    let registry = Arc::new(BuildRegistry::new(Arc::new(Store::open(dir.join("courier.db")).unwrap())));
    let runner = PipelineRunner::new(registry.clone(), Arc::new(config));
    Harness { registry, runner, work_dir }
}

#[tokio::test]
async fn full_generation_run_compiles_every_variant() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());

    let report = h.runner.run_generation().await.unwrap();
    assert_eq!(report.parent.status, BuildStatus::Ready);
    assert_eq!(report.parent.segment_count, 3);
    assert_eq!(report.variants.len(), 2);
    for child in &report.variants {
        assert_eq!(child.status, BuildStatus::Ready);
    }

    // The shared graph carries the derived weights.
    let graph_path = h
        .work_dir
        .join("runs")
        .join(&report.parent.id)
        .join("graph.osm");
    let xml = std::fs::read_to_string(&graph_path).unwrap();

    // Segment 1: MAJOR (0.4) and adjustment 0.5 (0.25) average to 0.325.
    assert!(xml.contains("<tag k=\"user_rating\" v=\"0.325\"/>"));
    // Segment 2 has live congestion, segment 1 defaults to free flow.
    assert!(xml.contains("<tag k=\"traffic_value\" v=\"1.0\"/>"));
    assert!(xml.contains("<tag k=\"traffic_value\" v=\"5.0\"/>"));
    // Segment 3 inherits one-way from Mehringdamm.
    assert!(xml.contains("<tag k=\"oneway\" v=\"yes\"/>"));
    // The surveyed node keeps its platform id.
    assert!(xml.contains("<node id=\"901\""));

    // Each variant workspace got its own profile with the right blocks.
    let car_profile = std::fs::read_to_string(
        h.work_dir
            .join("runs")
            .join(&report.parent.id)
            .join("car-rating-traffic/profile.lua"),
    )
    .unwrap();
    assert!(car_profile.contains("user_rating"));
    assert!(car_profile.contains("traffic_value"));

    let bike_profile = std::fs::read_to_string(
        h.work_dir
            .join("runs")
            .join(&report.parent.id)
            .join("bike-traffic/profile.lua"),
    )
    .unwrap();
    assert!(!bike_profile.contains("user_rating"));
    assert!(bike_profile.contains("traffic_value"));

    // Registry bookkeeping: nothing left in flight, everything queryable.
    assert!(h.registry.current_build(GENERATION_INSTANCE).unwrap().is_none());
    let overview = h.registry.overview().unwrap();
    assert_eq!(overview.len(), 3); // parent + 2 variants
    assert!(h.registry.latest_ready("car-rating-traffic").unwrap().is_some());
}

#[tokio::test]
async fn repeated_runs_append_history_instead_of_mutating_it() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());

    let first = h.runner.run_generation().await.unwrap();
    let second = h.runner.run_generation().await.unwrap();
    assert_ne!(first.parent.id, second.parent.id);

    let history = h.registry.history(GENERATION_INSTANCE, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.parent.id);
    assert_eq!(history[1].id, first.parent.id);

    // Variant history accumulates too.
    assert_eq!(h.registry.history("bike-traffic", 10).unwrap().len(), 2);
}
