use proptest::prelude::*;
use temdb_integrity::{ErrorKind, NewRoi, NewTask, ReferenceTarget};
use temdb_model::{Block, Entity, EntityId, EntityKind, Metadata, Roi};
use temdb_test_utils::{epoch, memory_engine, seed_pipeline};

const ROI1: &str = "SPEC001.BLK001.SEC001.SUB001.ROI001";

/// ROI on the seeded section
fn roi(id: &str, parent: Option<&str>, number: u64, level: u32) -> Entity {
    Roi {
        roi_id: id.into(),
        section_id: "SUB001_S0001".into(),
        parent_roi_id: parent.map(EntityId::from),
        specimen_id: "SPEC001".into(),
        block_id: "SPEC001.BLK001".into(),
        substrate_media_id: "SUB001".into(),
        section_number: 1,
        roi_number: number,
        hierarchy_level: level,
        metadata: Metadata::new(),
        created_at: epoch(),
        updated_at: epoch(),
    }
    .into()
}

fn block(id: &str, specimen: &str, number: u64) -> Entity {
    Block {
        block_id: id.into(),
        specimen_id: specimen.into(),
        block_number: number,
        metadata: Metadata::new(),
        created_at: epoch(),
        updated_at: epoch(),
    }
    .into()
}

#[tokio::test]
async fn test_child_roi_is_level_two() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let child = engine
        .create_roi(&seeded.section, Some(&seeded.roi), Metadata::new())
        .await
        .unwrap();
    let record = child.entity.as_roi().unwrap();
    assert_eq!(record.hierarchy_level, 2);
    assert_eq!(record.parent_roi_id.as_ref(), Some(&seeded.roi));
    assert_eq!(record.substrate_media_id, seeded.substrate);
    assert_eq!(record.block_id, seeded.block);
}

#[tokio::test]
async fn test_import_child_with_wrong_level_rejected() {
    let engine = memory_engine();
    seed_pipeline(&engine).await;

    let err = engine
        .import(roi(&format!("{ROI1}.ROI001"), Some(ROI1), 1, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LevelMismatch);
    assert!(engine
        .get(EntityKind::Roi, &EntityId::new(format!("{ROI1}.ROI001")))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_import_advances_counters() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;

    engine
        .import(roi(&format!("{ROI1}.ROI004"), Some(ROI1), 4, 2))
        .await
        .unwrap();
    let next = engine
        .create_roi(&seeded.section, Some(&seeded.roi), Metadata::new())
        .await
        .unwrap();
    assert_eq!(next.id().to_string(), format!("{ROI1}.ROI005"));

    engine
        .import(block("SPEC001.BLK007", "SPEC001", 7))
        .await
        .unwrap();
    let next = engine
        .create_block(&seeded.specimen, Metadata::new())
        .await
        .unwrap();
    assert_eq!(next.id().as_str(), "SPEC001.BLK008");
}

#[tokio::test]
async fn test_import_duplicate_sequence_rejected() {
    let engine = memory_engine();
    seed_pipeline(&engine).await;

    let err = engine
        .import(block("SPEC001.BLK0001", "SPEC001", 1))
        .await
        .unwrap_err();
    assert!(err.involves(ErrorKind::DuplicateSequenceNumber));
}

#[tokio::test]
async fn test_import_existing_id_is_identifier_taken() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let existing = engine
        .get(EntityKind::Block, &seeded.block)
        .await
        .unwrap()
        .unwrap();

    let err = engine.import(existing.entity.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdentifierTaken);
}

#[tokio::test]
async fn test_import_block_under_foreign_prefix_rejected() {
    let engine = memory_engine();
    seed_pipeline(&engine).await;
    engine.create_specimen(Metadata::new()).await.unwrap();

    let err = engine
        .import(block("SPEC001.BLK009", "SPEC002", 9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PrefixMismatch);
}

#[tokio::test]
async fn test_roi_parent_of_itself_rejected() {
    let engine = memory_engine();
    seed_pipeline(&engine).await;
    let id = format!("{ROI1}.ROI002");

    let err = engine.import(roi(&id, Some(&id), 2, 2)).await.unwrap_err();
    assert!(err.involves(ErrorKind::CycleDetected));
}

#[tokio::test]
async fn test_roi_under_cyclic_ancestry_rejected() {
    let engine = memory_engine();
    seed_pipeline(&engine).await;

    // Two ROIs pointing at each other, written around the engine
    let a = format!("{ROI1}.ROI007");
    let b = format!("{a}.ROI001");
    engine
        .store()
        .insert(roi(&a, Some(&b), 7, 2))
        .await
        .unwrap();
    engine
        .store()
        .insert(roi(&b, Some(&a), 1, 3))
        .await
        .unwrap();

    let err = engine
        .import(roi(&format!("{b}.ROI001"), Some(&b), 1, 4))
        .await
        .unwrap_err();
    assert!(err.involves(ErrorKind::CycleDetected));
}

#[tokio::test]
async fn test_task_lineage_must_match_roi() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let other_block = engine
        .create_block(&seeded.specimen, Metadata::new())
        .await
        .unwrap();

    let err = engine
        .create_task(NewTask::new(
            seeded.specimen.clone(),
            other_block.id().clone(),
            seeded.roi.clone(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PrefixMismatch);
}

#[tokio::test]
async fn test_section_on_unknown_medium_rejected() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let err = engine
        .create_section(
            &seeded.cutting_session,
            &EntityId::new("TAPE_404"),
            Metadata::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceNotFound);
}

#[tokio::test]
async fn test_section_numbers_count_per_session() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let session = engine
        .create_cutting_session(&seeded.block, Metadata::new())
        .await
        .unwrap();
    assert_eq!(session.id().as_str(), "SPEC001.BLK001.CUT002");

    // The medium prefix alone cannot tell the two sessions' first sections apart
    let err = engine
        .create_section(session.id(), &seeded.substrate, Metadata::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdentifierTaken);

    let tape = engine
        .create_substrate(None, Some("tape".into()), Metadata::new())
        .await
        .unwrap();
    let section = engine
        .create_section(session.id(), tape.id(), Metadata::new())
        .await
        .unwrap();
    // The failed attempt still consumed number 1 of the new session
    assert_eq!(section.id().as_str(), "SUB002_S0002");
}

#[tokio::test]
async fn test_materialize_annotates_missing_parent() {
    let engine = memory_engine();
    engine
        .store()
        .insert(block("SPEC009.BLK001", "SPEC009", 1))
        .await
        .unwrap();

    let materialized = engine
        .materialize(EntityKind::Block, &EntityId::new("SPEC009.BLK001"))
        .await
        .unwrap()
        .unwrap();
    assert!(materialized.has_missing());
    assert!(matches!(
        materialized.references[0].target,
        ReferenceTarget::Missing(_)
    ));

    let report = engine
        .check(&materialized.record.entity)
        .await
        .unwrap();
    assert!(report.has(ErrorKind::ReferenceNotFound));

    assert!(engine
        .materialize(EntityKind::Block, &EntityId::new("SPEC404.BLK001"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_metadata_update_revalidates_parents() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let block = engine
        .create_block(&seeded.specimen, Metadata::new())
        .await
        .unwrap();

    engine
        .store()
        .delete(EntityKind::Specimen, &seeded.specimen)
        .await
        .unwrap();
    engine.resolver().invalidate_all();

    let err = engine
        .update_metadata(EntityKind::Block, block.id(), Metadata::new())
        .await
        .unwrap_err();
    assert!(err.involves(ErrorKind::ReferenceNotFound));
}

#[tokio::test]
async fn test_list_children_follows_edges() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    engine
        .create_roi(&seeded.section, Some(&seeded.roi), Metadata::new())
        .await
        .unwrap();

    let rois = engine
        .list_children(EntityKind::Section, &seeded.section, EntityKind::Roi)
        .await
        .unwrap();
    assert_eq!(rois.len(), 2);

    let nested = engine
        .list_children(EntityKind::Roi, &seeded.roi, EntityKind::Roi)
        .await
        .unwrap();
    assert_eq!(nested.len(), 1);

    let unrelated = engine
        .list_children(EntityKind::Tile, &seeded.roi, EntityKind::Specimen)
        .await
        .unwrap();
    assert!(unrelated.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_roi_levels_track_depth(
        parents in prop::collection::vec(prop::option::of(any::<prop::sample::Index>()), 1..12)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let engine = memory_engine();
            let seeded = seed_pipeline(&engine).await;
            let mut created: Vec<(EntityId, u32)> = vec![(seeded.roi.clone(), 1)];

            for parent in parents {
                let parent = parent.map(|ix| created[ix.index(created.len())].clone());
                let stored = engine
                    .create_roi(&seeded.section, parent.as_ref().map(|(id, _)| id), Metadata::new())
                    .await
                    .unwrap();
                let roi = stored.entity.as_roi().unwrap();

                let expected = parent.as_ref().map_or(1, |(_, level)| level + 1);
                assert_eq!(roi.hierarchy_level, expected);
                assert_eq!(
                    roi.roi_id.as_str().matches(".ROI").count(),
                    expected as usize
                );
                if let Some((parent_id, _)) = &parent {
                    let prefix = format!("{parent_id}.");
                    assert!(roi.roi_id.as_str().starts_with(&prefix));
                }
                created.push((roi.roi_id.clone(), roi.hierarchy_level));
            }

            for (id, _) in &created {
                let stored = engine.get(EntityKind::Roi, id).await.unwrap().unwrap();
                let report = engine.check(&stored.entity).await.unwrap();
                assert!(report.is_ok(), "{id}: {:?}", report.violations());
            }
        });
    }
}

#[tokio::test]
async fn test_roi_batch_may_nest_under_its_own_members() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;
    let parent = "SPEC001.BLK001.SEC001.SUB001.ROI002";

    let created = engine
        .create_rois_batch(vec![
            NewRoi::new(seeded.section.clone()),
            NewRoi::new(seeded.section.clone()).under(parent.into()),
        ])
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].id().as_str(), parent);
    let child = created[1].entity.as_roi().unwrap();
    assert_eq!(child.parent_roi_id.as_ref().map(EntityId::as_str), Some(parent));
    assert_eq!(child.hierarchy_level, 2);

    assert!(engine.create_rois_batch(Vec::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_roi_batch_is_all_or_nothing() {
    let engine = memory_engine();
    let seeded = seed_pipeline(&engine).await;

    let err = engine
        .create_rois_batch(vec![
            NewRoi::new(seeded.section.clone()),
            NewRoi::new("SUB404_S0001".into()),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceNotFound);
    let rois = engine
        .list_children(EntityKind::Section, &seeded.section, EntityKind::Roi)
        .await
        .unwrap();
    assert_eq!(rois.len(), 1);

    // The rolled-back ROI's number is not handed out again
    let next = engine
        .create_roi(&seeded.section, None, Metadata::new())
        .await
        .unwrap();
    assert_eq!(next.id().as_str(), "SPEC001.BLK001.SEC001.SUB001.ROI003");
}
