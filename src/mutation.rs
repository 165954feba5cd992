//! Mutation Cache + Mutation Observer: per-execution state tracking for
//! writes, with optimistic apply/rollback and tag-based invalidation,
//! per spec.md §4.8.
//!
//! Unlike a query, a mutation has no shared cache entry of its own — each
//! call to [`MutationObserver::mutate`] owns an independent execution record
//! (spec.md §3 "no execution shares state with another, even when they share
//! a mutation key"). The Mutation Cache only aggregates *counts* across
//! executions sharing a key; per-hook result state lives on the observer.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};
use tokio_util::sync::CancellationToken;

use crate::client::{QueryClient, SetOptions};
use crate::error::QueryError;
use crate::instant::Instant;
use crate::key::{self, QueryKey};
use crate::signal::{ListenerKey, Signal};

new_key_type! {
    /// Identifies a single `mutate()` call. Every execution gets its own id,
    /// even when two calls share a `mutation_key` — spec.md §3.
    pub struct MutationExecutionId;
}

/// Lifecycle state of a single mutation execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

/// The state of one mutation execution, per spec.md §3 "Mutation State".
#[derive(Debug, Clone)]
pub struct MutationState<D, V, C> {
    pub status: MutationStatus,
    pub data: Option<D>,
    pub error: Option<QueryError>,
    pub variables: Option<V>,
    pub context: Option<C>,
    pub submitted_at: Option<Instant>,
}

impl<D, V, C> Default for MutationState<D, V, C> {
    fn default() -> Self {
        MutationState {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            context: None,
            submitted_at: None,
        }
    }
}

impl<D, V, C> MutationState<D, V, C> {
    pub fn is_idle(&self) -> bool {
        matches!(self.status, MutationStatus::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, MutationStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, MutationStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, MutationStatus::Error)
    }
}

/// Object-safe view over a registered execution's signal — just enough for
/// `isMutating` to count pending executions without knowing `D`/`V`/`C`.
trait AnyMutation {
    fn is_pending(&self) -> bool;
}

impl<D: 'static, V: 'static, C: 'static> AnyMutation for Signal<MutationState<D, V, C>> {
    fn is_pending(&self) -> bool {
        self.with(|s| s.is_pending())
    }
}

struct MutationCacheInner {
    executions: RefCell<SlotMap<MutationExecutionId, Rc<dyn AnyMutation>>>,
    by_key: RefCell<HashMap<String, HashSet<MutationExecutionId>>>,
}

/// Map from execution id to its signal, plus the secondary mutation-key
/// index, per spec.md §4.8. Cheap to clone (shares one `Rc`-backed map).
#[derive(Clone)]
pub struct MutationCache(Rc<MutationCacheInner>);

impl MutationCache {
    pub fn new() -> Self {
        MutationCache(Rc::new(MutationCacheInner {
            executions: RefCell::new(SlotMap::with_key()),
            by_key: RefCell::new(HashMap::new()),
        }))
    }

    /// Registers a freshly-started execution, indexing it under
    /// `mutation_key` when given.
    pub fn register<D, V, C>(
        &self,
        mutation_key: Option<&str>,
        signal: Signal<MutationState<D, V, C>>,
    ) -> MutationExecutionId
    where
        D: 'static,
        V: 'static,
        C: 'static,
    {
        let id = self.0.executions.borrow_mut().insert(Rc::new(signal));
        if let Some(key) = mutation_key {
            self.0.by_key.borrow_mut().entry(key.to_string()).or_default().insert(id);
        }
        id
    }

    /// Count of executions currently `pending`, globally or scoped to one
    /// mutation key — spec.md §3 `isMutating({mutationKey?})`.
    pub fn is_mutating(&self, mutation_key: Option<&str>) -> usize {
        let executions = self.0.executions.borrow();
        match mutation_key {
            Some(key) => {
                let by_key = self.0.by_key.borrow();
                let Some(ids) = by_key.get(key) else {
                    return 0;
                };
                ids.iter().filter_map(|id| executions.get(*id)).filter(|e| e.is_pending()).count()
            }
            None => executions.values().filter(|e| e.is_pending()).count(),
        }
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A caller-supplied mutation transport: given the variables and a
/// cancellation token, resolves to the mutation's typed result.
pub type MutationFn<V, D> = Rc<dyn Fn(V, CancellationToken) -> Pin<Box<dyn Future<Output = Result<D, QueryError>>>>>;

/// An optimistic update applied synchronously before `mutationFn` resolves,
/// against the query cached under `query_key` (spec.md §4.8 step 2).
///
/// `Q` is that query's cached data type, which need not relate to the
/// mutation's own variables (`V`) or result (`D`) types.
#[derive(Clone)]
pub struct OptimisticUpdate<K, Q, V> {
    pub query_key: K,
    pub update: Rc<dyn Fn(&V, Option<&Q>) -> Q>,
}

/// The pre-mutation value at `optimistic.query_key`, kept so a failed
/// mutation can roll back to it verbatim (spec.md §4.8 step 7, §8.11).
struct OptimisticSnapshot<K, Q> {
    query_key: K,
    previous: Option<Q>,
}

impl<K, Q> OptimisticSnapshot<K, Q>
where
    K: QueryKey + 'static,
    Q: Clone + serde::Serialize + 'static,
{
    fn rollback(&self, client: &QueryClient) {
        match &self.previous {
            Some(value) => {
                let _ = client.set(&self.query_key, value.clone(), SetOptions::default());
            }
            None => {
                if let Ok(hash) = key::hashed_key(&self.query_key) {
                    client.remove(&hash);
                }
            }
        }
    }

    fn invalidate(&self, client: &QueryClient) {
        client.invalidate(&self.query_key);
    }
}

/// Declarative options bound to one [`MutationObserver`].
///
/// `K`/`Q` only matter when `optimistic` is set — both default to `()` for
/// mutations that don't do an optimistic update.
pub struct MutationObserverOptions<V, D, K = (), Q = (), C = ()> {
    pub mutation_fn: MutationFn<V, D>,
    pub mutation_key: Option<String>,
    pub on_mutate: Option<Rc<dyn Fn(&V) -> Option<C>>>,
    pub on_success: Option<Rc<dyn Fn(&D, &V, Option<&C>)>>,
    pub on_error: Option<Rc<dyn Fn(&QueryError, &V, Option<&C>)>>,
    pub on_settled: Option<Rc<dyn Fn(Option<&D>, Option<&QueryError>, &V, Option<&C>)>>,
    pub invalidates_tags: HashSet<String>,
    pub optimistic: Option<OptimisticUpdate<K, Q, V>>,
}

impl<V, D, K, Q, C> Clone for MutationObserverOptions<V, D, K, Q, C>
where
    K: Clone,
    Q: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        MutationObserverOptions {
            mutation_fn: self.mutation_fn.clone(),
            mutation_key: self.mutation_key.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            invalidates_tags: self.invalidates_tags.clone(),
            optimistic: self.optimistic.clone(),
        }
    }
}

impl<V, D> MutationObserverOptions<V, D, (), (), ()> {
    pub fn new(mutation_fn: MutationFn<V, D>) -> Self {
        MutationObserverOptions {
            mutation_fn,
            mutation_key: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            invalidates_tags: HashSet::new(),
            optimistic: None,
        }
    }
}

impl<V, D, K, Q, C> MutationObserverOptions<V, D, K, Q, C> {
    /// Attaches an optimistic update, swapping in `K`/`Q` to match the
    /// target query. Also attaches a `C` (context) type, since `on_mutate`'s
    /// return type is usually only meaningful alongside an optimistic write.
    pub fn with_optimistic<K2, Q2>(
        self,
        optimistic: OptimisticUpdate<K2, Q2, V>,
    ) -> MutationObserverOptions<V, D, K2, Q2, C> {
        MutationObserverOptions {
            mutation_fn: self.mutation_fn,
            mutation_key: self.mutation_key,
            on_mutate: self.on_mutate,
            on_success: self.on_success,
            on_error: self.on_error,
            on_settled: self.on_settled,
            invalidates_tags: self.invalidates_tags,
            optimistic: Some(optimistic),
        }
    }
}

/// Per-hook mutation object. Each `MutationObserver` holds its own result
/// signal — two observers sharing a `mutation_key` never share state beyond
/// the aggregate [`MutationCache::is_mutating`] count (spec.md §4.8, §8.10).
pub struct MutationObserver<V, D, K = (), Q = (), C = ()> {
    client: QueryClient,
    mutation_cache: MutationCache,
    options: RefCell<MutationObserverOptions<V, D, K, Q, C>>,
    pub state: Signal<MutationState<D, V, C>>,
    current_execution: Cell<Option<MutationExecutionId>>,
}

impl<V, D, K, Q, C> MutationObserver<V, D, K, Q, C>
where
    V: Clone + 'static,
    D: Clone + 'static,
    K: QueryKey + 'static,
    Q: Clone + serde::Serialize + 'static,
    C: Clone + 'static,
{
    pub fn new(client: QueryClient, options: MutationObserverOptions<V, D, K, Q, C>) -> Rc<Self> {
        let mutation_cache = client.mutation_cache().clone();
        Rc::new(MutationObserver {
            client,
            mutation_cache,
            options: RefCell::new(options),
            state: Signal::new(MutationState::default()),
            current_execution: Cell::new(None),
        })
    }

    pub fn set_options(&self, options: MutationObserverOptions<V, D, K, Q, C>) {
        *self.options.borrow_mut() = options;
    }

    pub fn get(&self) -> MutationState<D, V, C> {
        self.state.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&MutationState<D, V, C>) + 'static) -> ListenerKey {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.state.unsubscribe(key)
    }

    /// Count of executions sharing this observer's `mutation_key` (or every
    /// execution, if none is set) that are currently pending.
    pub fn is_mutating(&self) -> usize {
        self.mutation_cache.is_mutating(self.options.borrow().mutation_key.as_deref())
    }

    /// Runs the full mutation pipeline of spec.md §4.8: register, optimistic
    /// apply, pending commit, `onMutate`, `mutationFn`, then success or
    /// failure handling (invalidate/rollback, `onSuccess`/`onError`,
    /// `onSettled`).
    pub async fn mutate(self: &Rc<Self>, variables: V) -> Result<D, QueryError> {
        let options = self.options.borrow().clone();

        let execution_signal: Signal<MutationState<D, V, C>> = Signal::new(MutationState::default());
        let execution_id = self.mutation_cache.register(options.mutation_key.as_deref(), execution_signal.clone());
        self.current_execution.set(Some(execution_id));

        let snapshot = options.optimistic.as_ref().map(|opt| {
            let current = self.client.get::<K, Q>(&opt.query_key).ok().flatten();
            let next = (opt.update)(&variables, current.as_ref());
            let _ = self.client.set(&opt.query_key, next, SetOptions::default());
            OptimisticSnapshot {
                query_key: opt.query_key.clone(),
                previous: current,
            }
        });

        let submitted_at = Instant::now();
        self.state.update(|s| {
            s.status = MutationStatus::Pending;
            s.data = None;
            s.error = None;
            s.variables = Some(variables.clone());
            s.submitted_at = Some(submitted_at);
        });
        execution_signal.update(|s| {
            s.status = MutationStatus::Pending;
            s.variables = Some(variables.clone());
            s.submitted_at = Some(submitted_at);
        });

        let context = options.on_mutate.as_ref().and_then(|f| f(&variables));
        if let Some(ctx) = &context {
            let ctx = ctx.clone();
            self.state.update(|s| s.context = Some(ctx.clone()));
            execution_signal.update(|s| s.context = Some(ctx));
        }

        let result = (options.mutation_fn)(variables.clone(), CancellationToken::new()).await;

        match &result {
            Ok(data) => {
                self.state.update(|s| {
                    s.status = MutationStatus::Success;
                    s.data = Some(data.clone());
                    s.error = None;
                });
                execution_signal.update(|s| {
                    s.status = MutationStatus::Success;
                    s.data = Some(data.clone());
                });

                if let Some(f) = &options.on_success {
                    f(data, &variables, context.as_ref());
                }
                if !options.invalidates_tags.is_empty() {
                    self.client.invalidate_tags(options.invalidates_tags.iter().cloned());
                }
                if let Some(snapshot) = &snapshot {
                    snapshot.invalidate(&self.client);
                }
                if let Some(f) = &options.on_settled {
                    f(Some(data), None, &variables, context.as_ref());
                }
            }
            Err(error) => {
                if let Some(snapshot) = &snapshot {
                    snapshot.rollback(&self.client);
                }
                self.state.update(|s| {
                    s.status = MutationStatus::Error;
                    s.error = Some(error.clone());
                });
                execution_signal.update(|s| {
                    s.status = MutationStatus::Error;
                    s.error = Some(error.clone());
                });

                if let Some(f) = &options.on_error {
                    f(error, &variables, context.as_ref());
                }
                if let Some(f) = &options.on_settled {
                    f(None, Some(error), &variables, context.as_ref());
                }
            }
        }

        result
    }

    /// Resets this observer's result view to `Idle`, without touching the
    /// cache or any other observer's state.
    pub fn reset(&self) {
        self.state.update(|s| *s = MutationState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::QueryErrorKind;
    use std::cell::Cell as StdCell;

    fn client() -> QueryClient {
        QueryClient::new(ClientConfig::default())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn successful_mutation_commits_data_and_calls_on_success() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let on_success_calls = Rc::new(StdCell::new(0));
                let calls = on_success_calls.clone();

                let mutation_fn: MutationFn<i32, String> =
                    Rc::new(|v, _token| Box::pin(async move { Ok(format!("item-{v}")) }));
                let mut options = MutationObserverOptions::new(mutation_fn);
                options.on_success = Some(Rc::new(move |_data: &String, _v: &i32, _ctx: Option<&()>| {
                    calls.set(calls.get() + 1);
                }));

                let observer = MutationObserver::new(client(), options);
                let result = observer.mutate(7).await.unwrap();

                assert_eq!(result, "item-7");
                assert_eq!(on_success_calls.get(), 1);
                let state = observer.get();
                assert!(state.is_success());
                assert_eq!(state.data, Some("item-7".to_string()));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_mutation_surfaces_error_and_calls_on_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mutation_fn: MutationFn<i32, String> = Rc::new(|_v, _token| {
                    Box::pin(async { Err(QueryError::new(QueryErrorKind::ServerError)) })
                });
                let options = MutationObserverOptions::new(mutation_fn);
                let observer = MutationObserver::new(client(), options);

                let result = observer.mutate(1).await;
                assert!(result.is_err());

                let state = observer.get();
                assert!(state.is_error());
                assert_eq!(state.data, None);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn optimistic_update_rolls_back_on_failure() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                client.set(&("todos",), vec!["a".to_string()], SetOptions::default()).unwrap();

                let mutation_fn: MutationFn<String, String> =
                    Rc::new(|_v, _token| Box::pin(async { Err(QueryError::new(QueryErrorKind::ServerError)) }));
                let options = MutationObserverOptions::new(mutation_fn).with_optimistic(OptimisticUpdate {
                    query_key: ("todos",),
                    update: Rc::new(|v: &String, current: Option<&Vec<String>>| {
                        let mut next = current.cloned().unwrap_or_default();
                        next.push(v.clone());
                        next
                    }),
                });
                let observer = MutationObserver::new(client.clone(), options);

                let before_mutate: Vec<String> = client.get(&("todos",)).unwrap().unwrap();
                assert_eq!(before_mutate, vec!["a".to_string()]);

                let _ = observer.mutate("b".to_string()).await;

                let after_settle: Vec<String> = client.get(&("todos",)).unwrap().unwrap();
                assert_eq!(after_settle, vec!["a".to_string()], "rollback must restore the pre-mutation snapshot");
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn is_mutating_counts_pending_executions_sharing_a_key() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = client();
                let mutation_fn: MutationFn<i32, i32> = Rc::new(|v, _token| {
                    Box::pin(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(v)
                    })
                });
                let mut options_a = MutationObserverOptions::new(mutation_fn.clone());
                options_a.mutation_key = Some("bump".to_string());
                let observer_a = MutationObserver::new(client.clone(), options_a);

                let mut options_b = MutationObserverOptions::new(mutation_fn);
                options_b.mutation_key = Some("bump".to_string());
                let observer_b = MutationObserver::new(client.clone(), options_b);

                let client_for_a = client.clone();
                let observer_a2 = observer_a.clone();
                let handle_a = tokio::task::spawn_local(async move {
                    let _ = observer_a2.mutate(1).await;
                    let _ = client_for_a;
                });
                let observer_b2 = observer_b.clone();
                let handle_b = tokio::task::spawn_local(async move {
                    let _ = observer_b2.mutate(2).await;
                });

                tokio::task::yield_now().await;
                assert_eq!(client.mutation_cache().is_mutating(Some("bump")), 2);

                tokio::time::advance(std::time::Duration::from_millis(25)).await;
                handle_a.await.unwrap();
                handle_b.await.unwrap();

                assert_eq!(client.mutation_cache().is_mutating(Some("bump")), 0);
            })
            .await;
    }
}
