//! End-to-end behavior of reads, dependency capture and invalidation.

use std::sync::atomic::{AtomicU32, Ordering};

use memo_flow::{
    CacheError, ComputeContext, Consistency, Fingerprint, Reader, Registry, Tracked, Version,
};

// ============================================================================
// Tracked operations
// ============================================================================

struct Sum<'a> {
    a: i64,
    b: i64,
    calls: &'a AtomicU32,
}

impl Tracked for Sum<'_> {
    type Output = i64;

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new("sum", (self.a, self.b))
    }

    fn produce(self, _ctx: &ComputeContext<'_>) -> anyhow::Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.a + self.b)
    }
}

/// Reads `sum(1, 1)` and counts its own productions.
fn read_count(
    db: &impl Reader,
    sum_calls: &AtomicU32,
    own_calls: &AtomicU32,
) -> Result<memo_flow::ComputedValue<u32>, CacheError> {
    db.get_or_compute(Fingerprint::new("read_count", ()), |ctx| {
        let sum = ctx.compute(Sum {
            a: 1,
            b: 1,
            calls: sum_calls,
        })?;
        let _ = sum.output()?;
        Ok(own_calls.fetch_add(1, Ordering::SeqCst) + 1)
    })
}

// ============================================================================
// Basic reads
// ============================================================================

#[test]
fn test_sum_is_produced_once_then_reproduced_after_invalidation() {
    let registry = Registry::new();
    let calls = AtomicU32::new(0);
    let sum = |registry: &Registry| {
        registry
            .compute(Sum {
                a: 2,
                b: 3,
                calls: &calls,
            })
            .unwrap()
    };

    let first = sum(&registry);
    assert_eq!(*first.value().unwrap(), 5);
    assert_eq!(first.version(), Version(1));
    assert_eq!(first.consistency(), Consistency::Consistent);

    let second = sum(&registry);
    assert!(first.ptr_eq(&second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(registry.invalidate(&Fingerprint::new("sum", (2i64, 3i64))));
    assert_eq!(first.consistency(), Consistency::Invalidated);

    let third = sum(&registry);
    assert_eq!(*third.value().unwrap(), 5);
    assert_eq!(third.version(), Version(2));
    assert!(third.is_consistent());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalidating_dependency_invalidates_reader() {
    let registry = Registry::new();
    let sum_calls = AtomicU32::new(0);
    let own_calls = AtomicU32::new(0);

    let first = read_count(&registry, &sum_calls, &own_calls).unwrap();
    assert_eq!(*first.value().unwrap(), 1);
    assert_eq!(first.dependency_count(), 1);

    let report = registry.invalidate_with_report(&Fingerprint::new("sum", (1i64, 1i64)));
    assert!(report.root_invalidated);
    assert_eq!(report.invalidated, 1);
    assert_eq!(first.consistency(), Consistency::Invalidated);

    let second = read_count(&registry, &sum_calls, &own_calls).unwrap();
    assert_eq!(*second.value().unwrap(), 2);
    assert_eq!(second.version(), Version(2));
    assert_eq!(sum_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalidating_reader_leaves_dependency_alone() {
    let registry = Registry::new();
    let sum_calls = AtomicU32::new(0);
    let own_calls = AtomicU32::new(0);

    read_count(&registry, &sum_calls, &own_calls).unwrap();
    registry.invalidate(&Fingerprint::new("read_count", ()));

    assert_eq!(
        registry.peek(&Fingerprint::new("sum", (1i64, 1i64))),
        Some((Version(1), Consistency::Consistent))
    );
    read_count(&registry, &sum_calls, &own_calls).unwrap();
    assert_eq!(sum_calls.load(Ordering::SeqCst), 1);
    assert_eq!(own_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalidation_is_transitive() {
    let registry = Registry::new();
    let level = |name: &'static str, below: Option<&'static str>| {
        let registry = registry.clone();
        move || {
            registry
                .get_or_compute(Fingerprint::new(name, ()), |ctx| {
                    if let Some(below) = below {
                        ctx.get_or_compute(Fingerprint::new(below, ()), |_| Ok(0u8))?;
                    }
                    Ok(0u8)
                })
                .unwrap()
        }
    };
    // c <- b <- a, read bottom-up so every level is produced by its own call.
    let c = level("c", None)();
    let b = level("b", Some("c"))();
    let a = level("a", Some("b"))();

    let report = registry.invalidate_with_report(&Fingerprint::new("c", ()));
    assert_eq!(report.invalidated, 2);
    assert!(!c.is_consistent());
    assert!(!b.is_consistent());
    assert!(!a.is_consistent());
}

#[test]
fn test_diamond_invalidates_each_node_once() {
    let registry = Registry::new();
    let top = registry
        .get_or_compute(Fingerprint::new("top", ()), |ctx| {
            let left = ctx.get_or_compute(Fingerprint::new("left", ()), |ctx| {
                ctx.get_or_compute(Fingerprint::new("base", ()), |_| Ok(1u32))?;
                Ok(1u32)
            })?;
            let right = ctx.get_or_compute(Fingerprint::new("right", ()), |ctx| {
                ctx.get_or_compute(Fingerprint::new("base", ()), |_| Ok(1u32))?;
                Ok(1u32)
            })?;
            Ok(*left.output()? + *right.output()?)
        })
        .unwrap();

    let report = registry.invalidate_with_report(&Fingerprint::new("base", ()));
    assert_eq!(report.invalidated, 3);
    assert!(!top.is_consistent());

    let again = registry.invalidate_with_report(&Fingerprint::new("base", ()));
    assert!(!again.root_invalidated);
    assert_eq!(again.invalidated, 0);
}

// ============================================================================
// Failures, cycles and tags
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("user {0} not found")]
struct UserNotFound(u64);

#[test]
fn test_failure_is_cached_until_invalidated() {
    let registry = Registry::new();
    let calls = AtomicU32::new(0);
    let fp = Fingerprint::new("user", 7u64);
    let load = |registry: &Registry| {
        registry
            .get_or_compute(fp.clone(), |_| -> anyhow::Result<String> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UserNotFound(7).into())
            })
            .unwrap()
    };

    let first = load(&registry);
    let second = load(&registry);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(first.value().unwrap_err().is::<UserNotFound>());
    assert!(first.value().unwrap_err().ptr_eq(second.value().unwrap_err()));

    registry.invalidate(&fp);
    let third = load(&registry);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(third.version(), Version(2));
}

#[test]
fn test_failure_propagates_to_readers() {
    let registry = Registry::new();
    let outer = registry
        .get_or_compute(Fingerprint::new("profile", ()), |ctx| {
            let user = ctx.get_or_compute(Fingerprint::new("user", 9u64), |_| {
                Err::<String, _>(UserNotFound(9).into())
            })?;
            Ok(user.output()?.len())
        })
        .unwrap();

    let err = outer.value().unwrap_err();
    assert!(err.find::<UserNotFound>().is_some());
    assert_eq!(err.to_string(), "user 9 not found");
    // The failed read is still a dependency.
    assert_eq!(outer.dependency_count(), 1);
}

#[test]
fn test_cycle_is_reported_without_deadlock() {
    fn a(ctx: &ComputeContext<'_>) -> anyhow::Result<u32> {
        let b = ctx.get_or_compute(Fingerprint::new("b", ()), b)?;
        Ok(*b.output()? + 1)
    }
    fn b(ctx: &ComputeContext<'_>) -> anyhow::Result<u32> {
        let a = ctx.get_or_compute(Fingerprint::new("a", ()), a)?;
        Ok(*a.output()? + 1)
    }

    let registry = Registry::new();
    let value = registry.get_or_compute(Fingerprint::new("a", ()), a).unwrap();
    let err = value.value().unwrap_err();
    match err.find::<CacheError>() {
        Some(CacheError::Cycle { path }) => {
            assert_eq!(path, &vec!["a()".to_string(), "b()".to_string(), "a()".to_string()]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    // The slots are settled: reading again returns the cached failures.
    assert!(registry
        .get_or_compute(Fingerprint::new("b", ()), b)
        .unwrap()
        .is_failed());
}

#[test]
fn test_self_read_is_a_cycle() {
    let registry = Registry::new();
    let value = registry
        .get_or_compute(Fingerprint::new("me", ()), |ctx| {
            ctx.get_or_compute(Fingerprint::new("me", ()), |_| Ok(1u8))?;
            Ok(0u8)
        })
        .unwrap();
    assert!(matches!(
        value.value().unwrap_err().find::<CacheError>(),
        Some(CacheError::Cycle { .. })
    ));
}

#[test]
fn test_tag_invalidation() {
    let registry = Registry::new();
    let calls = AtomicU32::new(0);
    let users = |registry: &Registry| {
        registry
            .get_or_compute(Fingerprint::new("users", ()), |ctx| {
                ctx.depend_on_tag("users-table")?;
                Ok(calls.fetch_add(1, Ordering::SeqCst))
            })
            .unwrap()
    };

    let first = users(&registry);
    assert!(!registry.invalidate_tag("orders-table"));
    assert!(first.is_consistent());

    assert!(registry.invalidate_tag("users-table"));
    assert!(!first.is_consistent());
    let second = users(&registry);
    assert_eq!(*second.value().unwrap(), 1);
}

#[test]
fn test_invalidate_value_ignores_newer_instance() {
    let registry = Registry::new();
    let fp = Fingerprint::new("n", ());
    let old = registry.get_or_compute(fp.clone(), |_| Ok(1)).unwrap();
    registry.invalidate(&fp);
    let new = registry.get_or_compute(fp, |_| Ok(2)).unwrap();

    assert!(!registry.invalidate_value(&old));
    assert!(new.is_consistent());
    assert!(registry.invalidate_value(&new));
    assert!(!new.is_consistent());
}

#[test]
fn test_value_born_from_stale_dependency_is_invalidated() {
    let registry = Registry::new();
    let dep = Fingerprint::new("dep", ());
    let value = registry
        .get_or_compute(Fingerprint::new("reader", ()), |ctx| {
            let dep_value = ctx.get_or_compute(dep.clone(), |_| Ok(1))?;
            // The dependency changes while this production is still running.
            ctx.registry().invalidate(&dep);
            Ok(*dep_value.output()?)
        })
        .unwrap();
    assert_eq!(value.consistency(), Consistency::Invalidated);

    let next = registry
        .get_or_compute(Fingerprint::new("reader", ()), |ctx| {
            Ok(*ctx.get_or_compute(dep.clone(), |_| Ok(2))?.output()?)
        })
        .unwrap();
    assert!(next.is_consistent());
    assert_eq!(*next.value().unwrap(), 2);
}

#[test]
fn test_clear_drops_everything() {
    let registry = Registry::new();
    let value = registry
        .get_or_compute(Fingerprint::new("outer", ()), |ctx| {
            ctx.get_or_compute(Fingerprint::new("inner", ()), |_| Ok(()))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(registry.len(), 2);

    registry.clear();
    assert!(registry.is_empty());
    assert_eq!(registry.node_count(), 0);
    assert!(!value.is_consistent());
}

#[test]
fn test_values_from_another_registry_are_ignored() {
    let first = Registry::new();
    let leaf = first
        .get_or_compute(Fingerprint::new("leaf", ()), |_| Ok(1))
        .unwrap();
    let reader = first
        .get_or_compute(Fingerprint::new("reader", ()), |ctx| {
            let dep = ctx.get_or_compute(Fingerprint::new("leaf", ()), |_| Ok(1))?;
            Ok(*dep.output()?)
        })
        .unwrap();

    // Same shape in a second registry: its nodes sit at the same arena slots.
    let second = Registry::new();
    let a = second
        .get_or_compute(Fingerprint::new("unrelated_a", ()), |_| Ok(1))
        .unwrap();
    let b = second
        .get_or_compute(Fingerprint::new("unrelated_b", ()), |ctx| {
            let dep = ctx.get_or_compute(Fingerprint::new("unrelated_a", ()), |_| Ok(1))?;
            Ok(*dep.output()?)
        })
        .unwrap();
    assert_ne!(leaf.node_id(), a.node_id());
    assert_ne!(reader.node_id(), b.node_id());

    assert!(!second.invalidate_value(&leaf));
    assert!(a.is_consistent());
    assert!(b.is_consistent());
    assert!(leaf.is_consistent());
    assert!(reader.is_consistent());

    let handle = second.publish(&leaf);
    assert_eq!(second.publication_count(), 0);
    assert_eq!(
        second.query_consistency(&handle.reference_id),
        memo_flow::ConsistencyReport::NotFound
    );

    assert!(first.invalidate_value(&leaf));
    assert!(!reader.is_consistent());
    assert!(a.is_consistent() && b.is_consistent());
}
