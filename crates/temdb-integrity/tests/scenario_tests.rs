use std::sync::Arc;
use temdb_integrity::simulation::{run_allocation_simulation, run_scenario, SimulationConfig};
use temdb_integrity::{
    AcquisitionEvent, CascadeMode, ErrorKind, IntegrityConfig, IntegrityEngine, NewAcquisition,
    NewTask, TaskEvent,
};
use temdb_model::{AcquisitionStatus, Entity, EntityKind, Metadata, TaskStatus};
use temdb_store::MemoryStore;
use temdb_test_utils::{memory_engine, test_config, FlakyStore};

#[tokio::test]
async fn test_pipeline_end_to_end() {
    let engine = memory_engine();

    let specimen = engine.create_specimen(Metadata::new()).await.unwrap();
    assert_eq!(specimen.id().as_str(), "SPEC001");
    let block = engine.create_block(specimen.id(), Metadata::new()).await.unwrap();
    assert_eq!(block.id().as_str(), "SPEC001.BLK001");
    let session = engine
        .create_cutting_session(block.id(), Metadata::new())
        .await
        .unwrap();
    assert_eq!(session.id().as_str(), "SPEC001.BLK001.CUT001");
    let substrate = engine
        .create_substrate(None, Some("wafer".into()), Metadata::new())
        .await
        .unwrap();
    assert_eq!(substrate.id().as_str(), "SUB001");
    let section = engine
        .create_section(session.id(), substrate.id(), Metadata::new())
        .await
        .unwrap();
    assert_eq!(section.id().as_str(), "SUB001_S0001");

    let roi = engine
        .create_roi(section.id(), None, Metadata::new())
        .await
        .unwrap();
    assert_eq!(roi.id().as_str(), "SPEC001.BLK001.SEC001.SUB001.ROI001");
    assert_eq!(roi.entity.as_roi().unwrap().hierarchy_level, 1);

    let child = engine
        .create_roi(section.id(), Some(roi.id()), Metadata::new())
        .await
        .unwrap();
    assert_eq!(
        child.id().as_str(),
        "SPEC001.BLK001.SEC001.SUB001.ROI001.ROI001"
    );
    let child_record = child.entity.as_roi().unwrap();
    assert_eq!(child_record.hierarchy_level, 2);
    assert_eq!(child_record.parent_roi_id.as_ref(), Some(roi.id()));

    // A level-1 record under a parent ROI never makes it into the store
    let mut wrong_level = child_record.clone();
    wrong_level.roi_id = "SPEC001.BLK001.SEC001.SUB001.ROI001.ROI002".into();
    wrong_level.roi_number = 2;
    wrong_level.hierarchy_level = 1;
    let err = engine.import(Entity::Roi(wrong_level)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LevelMismatch);

    let task = engine
        .create_task(NewTask::new(
            specimen.id().clone(),
            block.id().clone(),
            child.id().clone(),
        ))
        .await
        .unwrap();
    engine.transition(task.id(), TaskEvent::Start).await.unwrap();

    let acquisition = engine
        .create_acquisition(NewAcquisition::new(task.id().clone()))
        .await
        .unwrap();
    engine
        .transition(acquisition.id(), AcquisitionEvent::Begin)
        .await
        .unwrap();

    let err = engine
        .create_acquisition(
            NewAcquisition::new(task.id().clone()).replacing(acquisition.id().clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplacementTargetActive);

    let tiles = engine
        .append_tiles(acquisition.id(), vec![Metadata::new(); 3])
        .await
        .unwrap();
    assert_eq!(
        tiles[2].id().to_string(),
        format!("{}_T000003", acquisition.id())
    );

    engine
        .transition(
            acquisition.id(),
            AcquisitionEvent::Finish {
                status: AcquisitionStatus::ToBeReimaged,
            },
        )
        .await
        .unwrap();
    let retake = engine
        .create_acquisition(
            NewAcquisition::new(task.id().clone()).replacing(acquisition.id().clone()),
        )
        .await
        .unwrap();
    assert_eq!(retake.entity.as_acquisition().unwrap().version, 2);

    let done = engine.transition(task.id(), TaskEvent::Complete).await.unwrap();
    let record = done.stored.entity.as_task().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.completed_at >= record.started_at);

    let err = engine
        .delete(EntityKind::Specimen, specimen.id(), CascadeMode::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HasDependents);

    let report = engine
        .delete(EntityKind::Block, block.id(), CascadeMode::Cascade)
        .await
        .unwrap();
    assert!(report.findings.is_empty());
    assert!(engine
        .get(EntityKind::Tile, tiles[0].id())
        .await
        .unwrap()
        .is_none());
    assert!(engine
        .get(EntityKind::Specimen, specimen.id())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_builtin_scenario_passes() {
    let engine = memory_engine();
    let report = run_scenario(&engine).await.unwrap();
    assert!(report.passed(), "{}", report.generate_text());
    assert!(report.generate_text().contains("PASS"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulation_with_lost_races_has_no_duplicates() {
    let store = Arc::new(FlakyStore::new(MemoryStore::new()).losing_swaps(4));
    let engine = IntegrityEngine::new(store.clone(), test_config()).unwrap();

    let report = run_allocation_simulation(
        &engine,
        SimulationConfig {
            writers: 6,
            allocations: 25,
        },
    )
    .await
    .unwrap();

    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.stats.attempted, 150);
    assert_eq!(report.stats.allocated + report.stats.conflicts, 150);
    assert!(store.lost() > 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["config"]["writers"], 6);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("integrity.toml");
    std::fs::write(
        &path,
        "[allocation]\nmax_attempts = 3\n\n[hierarchy]\nmax_roi_depth = 4\n",
    )
    .unwrap();

    let config = IntegrityConfig::load(&path).unwrap();
    assert_eq!(config.allocation.max_attempts, 3);
    assert_eq!(config.hierarchy.max_roi_depth, 4);
    assert_eq!(config.cache, IntegrityConfig::default().cache);

    let rendered = config.to_toml_string().unwrap();
    assert_eq!(IntegrityConfig::from_toml_str(&rendered).unwrap(), config);
}

#[test]
fn test_config_file_rejects_bad_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("integrity.toml");
    std::fs::write(&path, "[lifecycle]\nmax_update_attempts = 0\n").unwrap();
    assert!(IntegrityConfig::load(&path).is_err());

    assert!(IntegrityConfig::load(dir.path().join("missing.toml")).is_err());
}

#[tokio::test]
async fn test_shallow_depth_limit_rejects_deep_roi() {
    let engine = IntegrityEngine::new(
        Arc::new(MemoryStore::new()),
        test_config().with_max_roi_depth(1),
    )
    .unwrap();
    let seeded = temdb_test_utils::seed_pipeline(&engine).await;

    let level2 = engine
        .create_roi(&seeded.section, Some(&seeded.roi), Metadata::new())
        .await
        .unwrap();
    let level3 = engine
        .create_roi(&seeded.section, Some(level2.id()), Metadata::new())
        .await
        .unwrap();
    let err = engine
        .create_roi(&seeded.section, Some(level3.id()), Metadata::new())
        .await
        .unwrap_err();
    assert!(err.involves(ErrorKind::CycleDetected));
}
