//! Publishing values and answering remote consistency queries.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use memo_flow::{
    publication_requested, Consistency, ConsistencyReport, Fingerprint, PublicationError,
    PublicationHandle, Registry, ResponseMetadata, Version, CONSISTENCY_HEADER,
    PUBLISH_REQUEST_HEADER, REFERENCE_HEADER, VERSION_HEADER,
};

fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_published_reference_reports_invalidation() {
    let registry = Registry::new();
    let fp = Fingerprint::new("report", ());
    for _ in 0..2 {
        registry.get_or_compute(fp.clone(), |_| Ok(0u8)).unwrap();
        registry.invalidate(&fp);
    }
    let value = registry.get_or_compute(fp.clone(), |_| Ok(0u8)).unwrap();
    assert_eq!(value.version(), Version(3));

    let handle = registry.publish(&value);
    assert_eq!(handle.version, Version(3));
    assert_eq!(handle.consistency, Consistency::Consistent);
    assert_eq!(
        registry.query_consistency(&handle.reference_id),
        ConsistencyReport::Found {
            version: Version(3),
            consistency: Consistency::Consistent
        }
    );

    registry.invalidate(&fp);
    let report = registry.query_consistency(&handle.reference_id);
    assert_eq!(
        report,
        ConsistencyReport::Found {
            version: Version(3),
            consistency: Consistency::Invalidated
        }
    );
    assert!(report.is_stale());
}

#[test]
fn test_publishing_twice_returns_the_same_reference() {
    let registry = Registry::new();
    let value = registry
        .get_or_compute(Fingerprint::new("v", ()), |_| Ok(1))
        .unwrap();
    let first = registry.publish(&value);
    let second = registry.publish(&value);
    assert_eq!(first, second);
    assert_eq!(registry.publication_count(), 1);
}

#[test]
fn test_new_version_gets_a_new_reference() {
    let registry = Registry::new();
    let fp = Fingerprint::new("v", ());
    let old = registry.get_or_compute(fp.clone(), |_| Ok(1)).unwrap();
    let old_handle = registry.publish(&old);
    registry.invalidate(&fp);
    let new = registry.get_or_compute(fp, |_| Ok(2)).unwrap();
    let new_handle = registry.publish(&new);

    assert_ne!(old_handle.reference_id, new_handle.reference_id);
    assert!(registry.query_consistency(&old_handle.reference_id).is_stale());
    assert!(!registry.query_consistency(&new_handle.reference_id).is_stale());
}

#[test]
fn test_unknown_unpublished_and_evicted_references() {
    let registry = Registry::builder()
        .keep_alive(Duration::ZERO)
        .sweep_interval(None)
        .build();
    let fp = Fingerprint::new("v", ());

    let value = registry.get_or_compute(fp.clone(), |_| Ok(1)).unwrap();
    let handle = registry.publish(&value);
    assert!(registry.unpublish(&handle.reference_id));
    assert_eq!(
        registry.query_consistency(&handle.reference_id),
        ConsistencyReport::NotFound
    );
    assert!(!registry.unpublish(&handle.reference_id));

    let handle = registry.publish(&value);
    drop(value);
    registry.sweep();
    assert_eq!(
        registry.query_consistency(&handle.reference_id),
        ConsistencyReport::NotFound
    );
    assert_eq!(registry.publication_count(), 0);
}

#[test]
fn test_second_publication_on_one_response_conflicts() {
    let registry = Registry::new();
    let a = registry
        .get_or_compute(Fingerprint::new("a", ()), |_| Ok(1))
        .unwrap();
    let b = registry
        .get_or_compute(Fingerprint::new("b", ()), |_| Ok(2))
        .unwrap();

    let mut metadata = ResponseMetadata::new(HashMap::<String, String>::new());
    let handle = registry.publish_into(&a, &mut metadata).unwrap();
    let err = registry.publish_into(&b, &mut metadata).unwrap_err();
    assert_eq!(
        err,
        PublicationError::Conflict {
            existing: handle.reference_id
        }
    );
    // The rejected value was not published.
    assert_eq!(registry.publication_count(), 1);

    let sink = metadata.into_inner();
    assert_eq!(sink[REFERENCE_HEADER], handle.reference_id.to_string());
    assert_eq!(sink[VERSION_HEADER], "1");
    assert_eq!(sink[CONSISTENCY_HEADER], "consistent");
}

#[test]
fn test_remote_round_trip_through_headers() {
    let registry = Registry::new();
    let request = headers(&[(PUBLISH_REQUEST_HEADER, "true")]);
    assert!(publication_requested(|name| request.get(name).map(String::as_str)));

    let fp = Fingerprint::new("orders", 42u64);
    let value = registry.get_or_compute(fp.clone(), |_| Ok(vec![1, 2, 3])).unwrap();
    let mut metadata = ResponseMetadata::new(HashMap::<String, String>::new());
    registry.publish_into(&value, &mut metadata).unwrap();
    let response = metadata.into_inner();

    // Remote side.
    let received =
        PublicationHandle::from_headers(|name| response.get(name).map(String::as_str)).unwrap();
    assert_eq!(received.version, Version(1));
    assert!(!registry.query_consistency(&received.reference_id).is_stale());

    registry.invalidate(&fp);
    assert!(registry.query_consistency(&received.reference_id).is_stale());
}

#[test]
fn test_handle_serializes_with_text_reference() {
    let registry = Registry::new();
    let value = registry
        .get_or_compute(Fingerprint::new("v", ()), |_| Ok(()))
        .unwrap();
    let handle = registry.publish(&value);

    let json = serde_json::to_value(&handle).unwrap();
    assert_eq!(json["reference_id"], handle.reference_id.to_string());
    assert_eq!(json["version"], 1);
    assert_eq!(json["consistency"], "consistent");
    let back: PublicationHandle = serde_json::from_value(json).unwrap();
    assert_eq!(back, handle);
}

#[test]
fn test_publish_into_rejects_value_from_another_registry() {
    let registry = Registry::new();
    let other = Registry::new();
    let foreign = other
        .get_or_compute(Fingerprint::new("v", ()), |_| Ok(1))
        .unwrap();

    let mut metadata = ResponseMetadata::new(BTreeMap::<String, String>::new());
    let err = registry.publish_into(&foreign, &mut metadata).unwrap_err();
    assert!(matches!(err, PublicationError::ForeignValue { .. }));
    assert!(metadata.published().is_none());
    assert!(metadata.sink().is_empty());
    assert_eq!(registry.publication_count(), 0);

    // The owning registry accepts it, and a BTreeMap sink collects the headers.
    let handle = other.publish_into(&foreign, &mut metadata).unwrap();
    assert_eq!(metadata.sink()[VERSION_HEADER], "1");
    assert_eq!(
        metadata.sink()[REFERENCE_HEADER],
        handle.reference_id.to_string()
    );
}
