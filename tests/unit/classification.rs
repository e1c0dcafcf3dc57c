//! Unit tests for PVC classification against the store

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use vrg_operator::controller::classification::{ReplicationClassCache, classify};
use vrg_operator::controller::Error;

use crate::common::*;

#[tokio::test]
async fn test_classify_routes_by_provisioner() {
    let harness = Harness::new().with_classes();
    harness.store.insert_claim(bound_claim("c", NAMESPACE, "nfs"));
    harness.store.insert_claim(bound_claim("a", NAMESPACE, "rbd"));
    harness.store.insert_claim(bound_claim("b", NAMESPACE, "rbd"));
    let group = VrgBuilder::new("vrg", NAMESPACE).primary().build();

    let sets = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap();

    assert_eq!(names(&sets.block), vec!["a", "b"]);
    assert_eq!(names(&sets.snapshot), vec!["c"]);
    assert_eq!(
        sets.block_classes,
        BTreeMap::from([
            ("a".to_string(), "rbd-replication".to_string()),
            ("b".to_string(), "rbd-replication".to_string()),
        ])
    );
}

#[tokio::test]
async fn test_classify_respects_selector_and_namespace() {
    let harness = Harness::new().with_classes();
    harness.store.insert_claim(bound_claim("a", NAMESPACE, "rbd"));
    harness.store.insert_claim(bound_claim("elsewhere", "other", "rbd"));
    let mut unlabelled = bound_claim("unlabelled", NAMESPACE, "rbd");
    unlabelled.metadata.labels = None;
    harness.store.insert_claim(unlabelled);
    let group = VrgBuilder::new("vrg", NAMESPACE).primary().build();

    let sets = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap();

    assert_eq!(names(&sets.block), vec!["a"]);
    assert!(sets.snapshot.is_empty());
}

#[tokio::test]
async fn test_without_replication_classes_storage_classes_are_not_resolved() {
    let harness = Harness::new();
    // No StorageClass objects exist, so any lookup would fail
    harness.store.insert_claim(bound_claim("a", NAMESPACE, "rbd"));
    let group = VrgBuilder::new("vrg", NAMESPACE).primary().build();

    let sets = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap();

    assert_eq!(names(&sets.snapshot), vec!["a"]);
}

#[tokio::test]
async fn test_missing_storage_class_aborts() {
    let harness = Harness::new().with_classes();
    harness.store.insert_claim(bound_claim("a", NAMESPACE, "rbd"));
    harness.store.insert_claim(bound_claim("b", NAMESPACE, "gone"));
    let group = VrgBuilder::new("vrg", NAMESPACE).primary().build();

    let err = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StorageClassLookup(_)));
}

#[tokio::test]
async fn test_invalid_selector_is_rejected() {
    let harness = Harness::new().with_classes();
    let group = VrgBuilder::new("vrg", NAMESPACE)
        .primary()
        .with_pvc_selector(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "Near".to_string(),
                values: Some(vec!["demo".to_string()]),
            }]),
            ..Default::default()
        })
        .build();

    let err = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidSelector(_)));
}

#[tokio::test]
async fn test_replication_classes_listed_once_per_cache() {
    let harness = Harness::new().with_classes();
    let group = VrgBuilder::new("vrg", NAMESPACE).primary().build();
    let mut cache = ReplicationClassCache::new();

    let first = cache.get(harness.store.as_ref(), &group).await.unwrap().len();
    let second = cache.get(harness.store.as_ref(), &group).await.unwrap().len();

    assert_eq!((first, second), (1, 1));
    assert_eq!(harness.store.with(|s| s.replication_class_lists), 1);
}

#[tokio::test]
async fn test_deleting_group_replays_protection_record() {
    let harness = Harness::new().with_classes();
    // The record wins over the current provisioners
    harness.store.insert_claim(bound_claim("a", NAMESPACE, "nfs"));
    harness.store.insert_claim(bound_claim("b", NAMESPACE, "rbd"));
    harness.store.insert_claim(bound_claim("c", NAMESPACE, "rbd"));
    let group = VrgBuilder::new("vrg", NAMESPACE)
        .primary()
        .with_protected(vec![
            protected("a", false, Some("rbd-replication")),
            protected("b", true, None),
        ])
        .deleting()
        .build();

    let sets = classify(harness.store.as_ref(), &group, &mut ReplicationClassCache::new())
        .await
        .unwrap();

    assert_eq!(names(&sets.block), vec!["a"]);
    assert_eq!(names(&sets.snapshot), vec!["b"]);
    assert_eq!(
        sets.block_classes.get("a").map(String::as_str),
        Some("rbd-replication")
    );
    assert_eq!(harness.store.with(|s| s.replication_class_lists), 0);
}
