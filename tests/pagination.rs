use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use concierge::application::pagination::{
    PageRequest, PageResult, PageSlice, PaginationConfig, PaginationEngine, PaginationError,
    RawPageParams, ResourceDescriptor,
};
use concierge::cache::{CacheConfig, RequestCoalescer, TieredCache};
use concierge::monitor::{MonitorConfig, OperationMonitor};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("listing query failed")]
struct QueryFailed;

fn engine() -> PaginationEngine {
    let cache = Arc::new(TieredCache::local_only(CacheConfig::default()));
    let monitor = Arc::new(OperationMonitor::new(MonitorConfig::default()));
    PaginationEngine::new(
        PaginationConfig {
            default_limit: 10,
            max_limit: 50,
        },
        Arc::new(RequestCoalescer::new(cache, monitor)),
    )
}

fn transfers() -> ResourceDescriptor {
    ResourceDescriptor::new("transfers", "pickup_at")
        .tenant("agency-42")
        .searchable(["driver", "destination"])
        .sortable(["pickup_at", "price"])
}

fn collection(size: u32) -> Arc<Vec<Value>> {
    Arc::new(
        (1..=size)
            .map(|n| {
                json!({
                    "id": n,
                    "pickup_at": format!("2026-10-{:02}", n % 28 + 1),
                    "price": n * 10,
                    "driver": if n % 2 == 0 { "Marta" } else { "Joao" },
                    "destination": "Airport",
                    "status": if n % 3 == 0 { "cancelled" } else { "booked" },
                })
            })
            .collect(),
    )
}

async fn fetch_page(
    engine: &PaginationEngine,
    items: &Arc<Vec<Value>>,
    raw: &RawPageParams,
    calls: &Arc<AtomicU32>,
) -> Result<PageResult<Value>, PaginationError> {
    let items = Arc::clone(items);
    let calls = Arc::clone(calls);
    engine
        .paginate(&transfers(), raw, move |request: PageRequest| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(request.apply(&items))
        })
        .await
}

#[tokio::test]
async fn empty_collection_returns_empty_envelope() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let page = fetch_page(
        &engine,
        &collection(0),
        &RawPageParams::default().page(1).limit(10),
        &calls,
    )
    .await
    .expect("page");

    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
    assert_eq!(page.page_count, 0);
    assert!(!page.has_next);
    assert!(!page.has_prev);
}

#[tokio::test]
async fn page_beyond_the_end_is_empty_with_accurate_totals() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let page = fetch_page(
        &engine,
        &collection(23),
        &RawPageParams::default().page(9).limit(5),
        &calls,
    )
    .await
    .expect("page");

    assert!(page.items.is_empty());
    assert_eq!(page.total, 23);
    assert_eq!(page.page_count, 5);
    assert!(!page.has_next);
    assert!(page.has_prev);
}

#[tokio::test]
async fn oversized_limit_is_clamped_not_rejected() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let page = fetch_page(
        &engine,
        &collection(80),
        &RawPageParams::default().limit(10_000),
        &calls,
    )
    .await
    .expect("page");

    assert_eq!(page.limit, 50);
    assert_eq!(page.items.len(), 50);
    assert_eq!(page.page_count, 2);
    assert_eq!(engine.stats().limit_clamped, 1);
}

#[tokio::test]
async fn reordered_parameters_share_one_cache_entry() {
    let engine = engine();
    let items = collection(30);
    let calls = Arc::new(AtomicU32::new(0));

    let first: RawPageParams = serde_json::from_value(json!({
        "page": 2,
        "limit": 4,
        "sort_by": "price",
        "sort_order": "asc",
        "search": "marta",
        "filters": { "status": "booked", "destination": "Airport" }
    }))
    .expect("params");
    let second: RawPageParams = serde_json::from_value(json!({
        "filters": { "destination": "Airport", "status": "booked" },
        "search": "marta",
        "sort_order": "asc",
        "sort_by": "price",
        "limit": 4,
        "page": 2
    }))
    .expect("params");

    let a = fetch_page(&engine, &items, &first, &calls).await.expect("first");
    let b = fetch_page(&engine, &items, &second, &calls).await.expect("second");

    assert_eq!(a, b);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.items.len(), 4);
    assert!(a.items.iter().all(|item| item["driver"] == "Marta"));
    assert!(a.items.iter().all(|item| item["status"] == "booked"));
}

#[tokio::test]
async fn concurrent_identical_requests_fetch_once() {
    let engine = Arc::new(engine());
    let items = collection(12);
    let calls = Arc::new(AtomicU32::new(0));

    let tasks = (0..6).map(|_| {
        let engine = Arc::clone(&engine);
        let items = Arc::clone(&items);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            engine
                .paginate(&transfers(), &RawPageParams::default(), move |request| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, Infallible>(request.apply(&items))
                })
                .await
        })
    });

    for task in futures::future::join_all(tasks).await {
        let page: PageResult<Value> = task.expect("task").expect("page");
        assert_eq!(page.total, 12);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidation_refetches_resource_pages() {
    let engine = engine();
    let items = collection(5);
    let calls = Arc::new(AtomicU32::new(0));
    let raw = RawPageParams::default();

    fetch_page(&engine, &items, &raw, &calls).await.expect("first");
    fetch_page(&engine, &items, &raw, &calls).await.expect("cached");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(engine.invalidate_tenant(&transfers()).await, 1);
    fetch_page(&engine, &items, &raw, &calls).await.expect("refetched");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(engine.invalidate_resource(&transfers()).await, 1);
}

#[tokio::test]
async fn tenants_are_cached_separately() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));

    for tenant in ["agency-1", "agency-2"] {
        let calls = Arc::clone(&calls);
        let resource = ResourceDescriptor::new("transfers", "pickup_at").tenant(tenant);
        let page: PageResult<u32> = engine
            .paginate(&resource, &RawPageParams::default(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(PageSlice::new(vec![1, 2], 2))
            })
            .await
            .expect("page");
        assert_eq!(page.items, vec![1, 2]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_failures_propagate_and_are_not_cached() {
    let engine = engine();
    let raw = RawPageParams::default();

    let err = engine
        .paginate(&transfers(), &raw, |_| async {
            Err::<PageSlice<u32>, _>(QueryFailed)
        })
        .await
        .expect_err("fetch fails");
    assert!(matches!(err, PaginationError::Resolve(ref resolve) if resolve.is_loader()));

    let page: PageResult<u32> = engine
        .paginate(&transfers(), &raw, |_| async {
            Ok::<_, QueryFailed>(PageSlice::new(vec![7], 1))
        })
        .await
        .expect("retry");
    assert_eq!(page.items, vec![7]);
}

#[tokio::test]
async fn malformed_filters_never_reach_the_fetcher() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let raw = RawPageParams::default().filter("status", json!({"in": ["booked"]}));

    let err = fetch_page(&engine, &collection(3), &raw, &calls)
        .await
        .expect_err("malformed");
    assert!(matches!(err, PaginationError::MalformedKey { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
