//! Literal end-to-end scenarios from spec.md §8 (S1–S6), exercised against
//! the public `QueryClient`/`MutationObserver` facade.

use std::rc::Rc;
use std::time::Duration;

use requery::client::{QueryClient, QueryFetchOptions, QueryFn, SetOptions};
use requery::config::ClientConfig;
use requery::error::{QueryError, QueryErrorKind};
use requery::executor::{Retry, RetryDelay};
use requery::mutation::{MutationFn, MutationObserver, MutationObserverOptions, OptimisticUpdate};
use requery::observer::{QueryObserver, QueryObserverOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn client() -> QueryClient {
    QueryClient::new(ClientConfig::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

/// S1: after resolution, `get` returns the payload, `is_stale` is false, and
/// past `stale_time` it flips true.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn s1_staleness_flips_after_stale_time_elapses() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();
            let key = ("users", 1);
            let fetcher: QueryFn<User> = Rc::new(|_token| {
                Box::pin(async {
                    Ok(User {
                        id: 1,
                        name: "A".to_string(),
                    })
                })
            });

            let hash = requery::key::hashed_key(&key).unwrap();
            let options = QueryFetchOptions {
                fetch_direction: Default::default(),
                cancellation: CancellationToken::new(),
                retry: None,
                retry_delay: None,
                tags: Default::default(),
                schema: None,
                stale_time: Some(Duration::from_millis(1000)),
                cache_time: None,
            };
            client.fetch(&key, fetcher, options).await.unwrap();

            let data: Option<User> = client.get(&key).unwrap();
            assert_eq!(
                data,
                Some(User {
                    id: 1,
                    name: "A".to_string()
                })
            );
            assert!(!client.is_stale::<User>(&hash));

            tokio::time::advance(Duration::from_millis(1500)).await;
            assert!(client.is_stale::<User>(&hash));
        })
        .await;
}

/// S2: two simultaneous fetches for the same key dedupe to one underlying
/// call and both resolve to the same value.
#[tokio::test(flavor = "current_thread")]
async fn s2_concurrent_fetches_dedupe_to_one_call() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();
            let calls = Rc::new(std::cell::Cell::new(0));
            let calls_clone = calls.clone();
            let fetcher: QueryFn<i32> = Rc::new(move |_token| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.set(calls.get() + 1);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(42)
                })
            });

            let key = ("x",);
            let f1 = client.fetch(&key, fetcher.clone(), QueryFetchOptions::default());
            let f2 = client.fetch(&key, fetcher, QueryFetchOptions::default());

            let (r1, r2) = tokio::join!(f1, f2);
            assert_eq!(r1.unwrap(), 42);
            assert_eq!(r2.unwrap(), 42);
            assert_eq!(calls.get(), 1, "the underlying fn must run exactly once");
        })
        .await;
}

/// S3: a ServerError on the first attempt, success on the second. The
/// observer never surfaces an error, transitioning straight to success.
#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn s3_retry_recovers_without_surfacing_an_error() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();
            let attempt = Rc::new(std::cell::Cell::new(0));
            let attempt_clone = attempt.clone();
            let fetcher: QueryFn<String> = Rc::new(move |_token| {
                let attempt = attempt_clone.clone();
                Box::pin(async move {
                    let n = attempt.get() + 1;
                    attempt.set(n);
                    if n == 1 {
                        Err(QueryError::new(QueryErrorKind::ServerError))
                    } else {
                        Ok("ok".to_string())
                    }
                })
            });

            let mut options = QueryObserverOptions::new(("flaky",), fetcher);
            options.retry = Some(Retry::Count(2));
            options.retry_delay = Some(RetryDelay::Fixed(Duration::from_millis(10)));
            let observer = QueryObserver::new(client, options);

            let _listener = observer.subscribe(|_| {});
            tokio::time::advance(Duration::from_millis(50)).await;
            requery::signal::settle().await;

            let result = observer.get();
            assert!(result.is_success);
            assert_eq!(result.data, Some("ok".to_string()));
            assert!(!result.is_error, "the observer must never surface the transient error");
        })
        .await;
}

/// S4: invalidating `["user"]` marks only that entry, never the sibling
/// `["users"]` entry that merely shares a string prefix.
#[tokio::test(flavor = "current_thread")]
async fn s4_prefix_invalidation_spares_unrelated_sibling() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();
            client.set(&json!(["user"]), "U".to_string(), SetOptions::default()).unwrap();
            client.set(&json!(["users"]), "U2".to_string(), SetOptions::default()).unwrap();

            client.invalidate(&json!(["user"]));

            let user_hash = requery::key::hash(&json!(["user"])).unwrap();
            let users_hash = requery::key::hash(&json!(["users"])).unwrap();
            assert!(client.is_stale::<String>(&user_hash));
            assert!(!client.is_stale::<String>(&users_hash));
        })
        .await;
}

/// S5: an optimistic append rolled back after the mutation rejects restores
/// the pre-mutation snapshot exactly.
#[tokio::test(flavor = "current_thread")]
async fn s5_optimistic_mutation_rolls_back_on_rejection() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();
            client.set(&("t",), vec!["a".to_string()], SetOptions::default()).unwrap();

            let mutation_fn: MutationFn<String, ()> =
                Rc::new(|_v, _token| Box::pin(async { Err(QueryError::new(QueryErrorKind::ServerError)) }));
            let options = MutationObserverOptions::new(mutation_fn).with_optimistic(OptimisticUpdate {
                query_key: ("t",),
                update: Rc::new(|v: &String, current: Option<&Vec<String>>| {
                    let mut next = current.cloned().unwrap_or_default();
                    next.push(v.clone());
                    next
                }),
            });
            let observer = MutationObserver::new(client.clone(), options);

            let _ = observer.mutate("b".to_string()).await;

            let after: Vec<String> = client.get(&("t",)).unwrap().unwrap();
            assert_eq!(after, vec!["a".to_string()]);
        })
        .await;
}

/// S6: hydrating a fully-specified entry makes it available via `get`
/// without ever calling a fetcher.
#[tokio::test(flavor = "current_thread")]
async fn s6_restore_makes_hydrated_data_available() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let client = client();

            let dehydrated = requery::persist::DehydratedEntry {
                key: json!(["p", 1]),
                data: json!({"id": 1, "title": "Hi"}),
                timestamp_millis: Some(1_000),
                stale_time_millis: 5_000,
                cache_time_millis: 10_000,
                tags: Vec::new(),
            };

            #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
            struct Post {
                id: u32,
                title: String,
            }

            let entry: requery::storage::entry::CacheEntry<Post> = requery::persist::hydrate(&dehydrated).unwrap();
            let hash = requery::key::hash(&json!(["p", 1])).unwrap();
            client.restore(&hash, entry);

            let data: Option<Post> = client.get(&("p", 1)).unwrap();
            assert_eq!(
                data,
                Some(Post {
                    id: 1,
                    title: "Hi".to_string()
                })
            );
        })
        .await;
}
