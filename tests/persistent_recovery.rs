//! Recovery tests for the persistent store.
//!
//! These tests verify that:
//! - Completed simulations survive a restart unchanged
//! - Records left `QUEUED` by a stopped service are executed on restart
//! - A torn WAL tail (simulated crash mid-write) is discarded
//! - A live store locks its directory

#![cfg(feature = "persistent")]

use std::fs;
use std::time::Duration;

use hazardsim::storage::persistent::{open_store, PersistentConfig, WAL_FILE_NAME};
use hazardsim::{
    EngineStamp, HazardSim, HazardSimConfig, HazardType, ListQuery, OwnerId, ResultView, Simulation,
    SimulationParameters, SimulationStatus, SimulationStore,
};
use tempfile::tempdir;

const DEADLINE: Duration = Duration::from_secs(10);

fn owner() -> OwnerId {
    OwnerId::new("ops-team").unwrap()
}

fn config(dir: &std::path::Path) -> HazardSimConfig {
    HazardSimConfig {
        workers: 2,
        data_dir: Some(dir.to_path_buf()),
        ..HazardSimConfig::default()
    }
}

#[test]
fn test_completed_simulation_survives_restart() {
    let dir = tempdir().unwrap();
    let id;
    let before;
    {
        let sim = HazardSim::open(config(dir.path())).unwrap();
        let record = sim
            .create(&owner(), SimulationParameters::new(HazardType::Landslide, "A1"))
            .unwrap();
        id = record.id;
        sim.wait_for_terminal(id, &owner(), DEADLINE).unwrap();
        before = sim.result(id, &owner()).unwrap();
        sim.shutdown();
    }

    let sim = HazardSim::open(config(dir.path())).unwrap();
    let status = sim.status(id, &owner()).unwrap();
    assert_eq!(status.status, SimulationStatus::Completed);
    assert!(status.completed_at.is_some());

    let after = sim.result(id, &owner()).unwrap();
    assert!(matches!(after, ResultView::Ready { .. }));
    assert_eq!(after, before);
}

#[test]
fn test_queued_records_run_after_restart() {
    let dir = tempdir().unwrap();
    let params = SimulationParameters::new(HazardType::Subsidence, "S4");
    let hash = params.parameter_hash();
    let orphan = Simulation::queued(owner(), params, hash, EngineStamp::new("stability", "1.2.0"));
    {
        let store = open_store(dir.path(), None).unwrap();
        store.insert(orphan.clone()).unwrap();
    }

    let sim = HazardSim::open(config(dir.path())).unwrap();
    let view = sim.wait_for_terminal(orphan.id, &owner(), DEADLINE).unwrap();
    assert_eq!(view.status, SimulationStatus::Completed);
}

#[test]
fn test_torn_wal_tail_is_discarded() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE_NAME);
    {
        let store = open_store(dir.path(), None).unwrap();
        for i in 0..5 {
            let params = SimulationParameters::new(HazardType::Landslide, format!("A{i}"));
            let hash = params.parameter_hash();
            let engine = EngineStamp::new("stability", "1.2.0");
            store.insert(Simulation::queued(owner(), params, hash, engine)).unwrap();
        }
    }

    // Chop a few bytes off the last entry.
    let size = fs::metadata(&wal_path).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&wal_path)
        .unwrap()
        .set_len(size - 7)
        .unwrap();

    {
        let store = open_store(dir.path(), None).unwrap();
        assert_eq!(store.list_by_status(SimulationStatus::Queued).unwrap().len(), 4);
    }

    // The truncated tail was cut on open; a second reopen sees the same data.
    let store = open_store(dir.path(), None).unwrap();
    assert_eq!(store.list_by_owner(&owner()).unwrap().len(), 4);
    assert!(fs::metadata(&wal_path).unwrap().len() < size);
}

#[test]
fn test_compaction_keeps_terminal_state() {
    let dir = tempdir().unwrap();
    let cfg = PersistentConfig {
        max_wal_size: PersistentConfig::MIN_WAL_SIZE,
        ..PersistentConfig::default()
    };
    {
        let store = open_store(dir.path(), Some(cfg)).unwrap();
        let sim = HazardSim::with_store(std::sync::Arc::new(store), config(dir.path())).unwrap();
        let ids: Vec<_> = (0..12)
            .map(|i| {
                let params = SimulationParameters::new(HazardType::Landslide, format!("C{i}"));
                sim.create(&owner(), params).unwrap().id
            })
            .collect();
        for id in ids {
            sim.wait_for_terminal(id, &owner(), DEADLINE).unwrap();
        }
        sim.shutdown();
    }

    let sim = HazardSim::open(config(dir.path())).unwrap();
    let page = sim
        .list(
            &owner(),
            &ListQuery {
                status: Some(SimulationStatus::Completed),
                limit: 100,
                ..ListQuery::default()
            },
        )
        .unwrap();
    assert_eq!(page.total, 12);
}

#[test]
fn test_second_open_fails_while_locked() {
    let dir = tempdir().unwrap();
    let _live = open_store(dir.path(), None).unwrap();

    let err = open_store(dir.path(), None).unwrap_err();
    assert!(!err.is_validation());

    assert!(HazardSim::open(config(dir.path())).is_err());
}

#[test]
fn test_open_requires_data_dir() {
    let err = HazardSim::open(HazardSimConfig::default()).unwrap_err();
    assert!(err.is_validation());
}
