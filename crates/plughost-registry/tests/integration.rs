//! Integration tests for the plughost-registry crate.
//!
//! These exercise the registry through its public API against a catalog
//! file on disk (via tempfile), including concurrent writers.

use std::time::Duration;

use plughost_registry::{PluginManifest, Rarity, Registry};

fn manifest(id: &str, category: &str, capabilities: &[&str]) -> PluginManifest {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("{id} plugin"),
        "version": "0.3.1",
        "author": "integration",
        "description": "integration fixture",
        "category": category,
        "capabilities": capabilities,
        "entry_points": {"main": "main"},
        "dependencies": {},
        "procedures": [{"id": "echo", "name": "Echo"}]
    }))
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Catalog file
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn catalog_file_is_keyed_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let reg = Registry::open(&path).unwrap();
    reg.register(manifest("alpha", "text", &["echo"]), "local:/a", "/a")
        .unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["alpha"]["manifest"]["id"], "alpha");
    assert_eq!(raw["alpha"]["usage_count"], 0);
    assert_eq!(raw["alpha"]["is_active"], true);
}

#[test]
fn creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("registry.json");
    let reg = Registry::open(&path).unwrap();
    assert!(reg.is_empty());

    reg.register(manifest("p", "c", &[]), "local:/p", "/p").unwrap();
    assert!(path.exists());
}

#[test]
fn corrupt_entry_is_skipped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    {
        let reg = Registry::open(&path).unwrap();
        reg.register(manifest("good", "c", &[]), "local:/g", "/g")
            .unwrap();
    }

    let mut raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    raw["broken"] = serde_json::json!({"manifest": 42});
    std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

    let reg = Registry::open(&path).unwrap();
    assert_eq!(reg.len(), 1);
    assert!(reg.contains("good"));
}

#[test]
fn reload_picks_up_external_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let reader = Registry::open(&path).unwrap();
    let writer = Registry::open(&path).unwrap();

    writer
        .register(manifest("late", "c", &[]), "local:/l", "/l")
        .unwrap();
    assert!(!reader.contains("late"));

    reader.reload().unwrap();
    assert!(reader.contains("late"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Usage and metrics
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn record_execution_tracks_latency() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::open(dir.path().join("registry.json")).unwrap();
    reg.register(manifest("p", "c", &[]), "local:/p", "/p").unwrap();

    reg.record_execution("p", true, Duration::from_millis(100))
        .unwrap();
    let metrics = reg.get("p").unwrap().performance_metrics;
    assert!((metrics.avg_duration_ms - 100.0).abs() < 1e-6);
    assert!(metrics.last_used.is_some());

    reg.record_execution("p", false, Duration::from_millis(200))
        .unwrap();
    let entry = reg.get("p").unwrap();
    assert_eq!(entry.usage_count, 2);
    assert!((entry.performance_metrics.avg_duration_ms - 110.0).abs() < 1e-6);
    assert!((entry.performance_metrics.success_rate - 0.9).abs() < 1e-9);
}

#[test]
fn heavy_usage_promotes_rarity() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::open(dir.path().join("registry.json")).unwrap();
    reg.register(
        manifest("p", "c", &["a", "b", "c", "d"]),
        "https://example.com/p.git",
        "/p",
    )
    .unwrap();

    for _ in 0..11 {
        reg.update_usage("p", true).unwrap();
    }
    assert_eq!(reg.get("p").unwrap().rarity(), Rarity::Uncommon);
    assert!(!reg.get("p").unwrap().is_local());
}

#[test]
fn concurrent_usage_updates_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let reg = Registry::open(&path).unwrap();
    reg.register(manifest("shared", "c", &[]), "local:/s", "/s")
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    reg.update_usage("shared", true).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(reg.get("shared").unwrap().usage_count, 40);
    let reopened = Registry::open(&path).unwrap();
    assert_eq!(reopened.get("shared").unwrap().usage_count, 40);
}

// ═══════════════════════════════════════════════════════════════════════
//  Queries
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn search_matches_description_and_capability() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::open(dir.path().join("registry.json")).unwrap();
    reg.register(manifest("a", "c", &["Translate"]), "local:/a", "/a")
        .unwrap();
    reg.register(manifest("b", "c", &["summarize"]), "local:/b", "/b")
        .unwrap();

    assert_eq!(reg.search("translate").len(), 1);
    assert_eq!(reg.search("FIXTURE").len(), 2);
    assert_eq!(reg.search("").len(), 2);
}

#[test]
fn stats_serialize_rarity_keys_in_snake_case() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Registry::open(dir.path().join("registry.json")).unwrap();
    reg.register(manifest("a", "c", &[]), "local:/a", "/a").unwrap();

    let json = serde_json::to_value(reg.collection_stats()).unwrap();
    assert_eq!(json["by_rarity"]["common"], 1);
    assert_eq!(json["by_rarity"]["legendary"], 0);
}
