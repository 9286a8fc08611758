use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::coordinator::Coordinator;
use crate::error::{FetchError, FetchResult};
use crate::key::CacheKey;

/// Scheduling knobs for a subscription.
///
/// These mirror the configuration surface of a reactive-fetch layer: the
/// de-duplication window itself is not configurable here because it always
/// equals the enforced TTL, which keeps the scheduler and the
/// [`Coordinator`] in agreement about the fetch cadence.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Periodic revalidation cadence. `None` (the default) disables
    /// periodic refresh; revalidation then only happens on
    /// [`refresh`](Subscription::refresh).
    pub revalidate_interval: Option<Duration>,
    /// How often a failed fetch is retried before the error is published.
    pub error_retry_count: u32,
    /// Delay between error retries.
    pub error_retry_interval: Duration,
    /// Whether to fetch immediately when the subscription is created.
    pub revalidate_on_subscribe: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            revalidate_interval: None,
            error_retry_count: 3,
            error_retry_interval: Duration::from_secs(5),
            revalidate_on_subscribe: true,
        }
    }
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// The key this subscriber watches. `None` disables fetching entirely.
    pub cache_key: Option<CacheKey>,
    /// TTL for this subscriber. The configured default applies when `None`,
    /// and the floor is always enforced.
    pub ttl: Option<Duration>,
    /// Setting this to `false` suppresses fetching, same as an absent key.
    pub enabled: bool,
    /// Scheduling behavior.
    pub refresh: RefreshConfig,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            cache_key: None,
            ttl: None,
            enabled: true,
            refresh: RefreshConfig::default(),
        }
    }
}

impl SubscriptionOptions {
    /// Options watching `key` with everything else at its default.
    pub fn for_key(key: impl Into<CacheKey>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Self::default()
        }
    }
}

/// The caller-visible state of one subscription.
#[derive(Debug)]
pub struct FetchState<T> {
    /// The most recently resolved value, if any.
    pub data: Option<Arc<T>>,
    /// The last published error. Cleared by the next successful fetch.
    pub error: Option<FetchError>,
    /// True only during a genuine first load, when there is neither data
    /// nor an error yet. Background revalidation never sets this.
    pub is_loading: bool,
    /// True whenever a fetch for this subscription is in flight.
    pub is_validating: bool,
}

// https://github.com/rust-lang/rust/issues/26925
impl<T> Clone for FetchState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            is_validating: self.is_validating,
        }
    }
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_validating: false,
        }
    }
}

type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

enum Command {
    Refresh(oneshot::Sender<()>),
}

/// A live, reactive view of one cache key.
///
/// The subscription owns a background task that resolves the key through the
/// [`Coordinator`] and publishes every state change on a watch channel. The
/// coordinator decides how often a revalidation actually reaches the
/// producer; the subscription only decides when to ask.
///
/// Dropping the subscription stops its task. The coordinator and any other
/// subscribers of the same key are unaffected.
pub struct Subscription<T> {
    state: watch::Receiver<FetchState<T>>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Spawns the subscription's background task on the current runtime.
    pub fn subscribe<F, Fut>(
        coordinator: Coordinator<T>,
        options: SubscriptionOptions,
        fetcher: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let fetcher: Fetcher<T> = Arc::new(move || fetcher().boxed());
        let (state_tx, state_rx) = watch::channel(FetchState::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run(coordinator, options, fetcher, state_tx, cmd_rx));

        Self {
            state: state_rx,
            commands: cmd_tx,
            task,
        }
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> FetchState<T> {
        self.state.borrow().clone()
    }

    /// Waits for the next state change and returns the new snapshot.
    pub async fn changed(&mut self) -> FetchState<T> {
        let _ = self.state.changed().await;
        self.state.borrow_and_update().clone()
    }

    /// Invalidates both cache layers for the key and revalidates.
    ///
    /// Completion means the refreshed state has been published. On a
    /// disabled subscription this is a no-op.
    pub async fn refresh(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Refresh(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T>(
    coordinator: Coordinator<T>,
    options: SubscriptionOptions,
    fetcher: Fetcher<T>,
    state: watch::Sender<FetchState<T>>,
    mut commands: mpsc::Receiver<Command>,
) where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let key = match options.cache_key {
        Some(key) if options.enabled => key,
        // Fetching is suppressed. Keep acknowledging commands so `refresh`
        // callers are not left hanging; the state stays idle.
        _ => {
            while let Some(Command::Refresh(ack)) = commands.recv().await {
                let _ = ack.send(());
            }
            return;
        }
    };

    let ttl = coordinator.effective_ttl(options.ttl);
    let refresh = options.refresh;
    let mut prev_error = None;

    if refresh.revalidate_on_subscribe {
        revalidate(&coordinator, &key, ttl, &fetcher, &state, &refresh, &mut prev_error).await;
    }

    loop {
        let next_tick = async {
            match refresh.revalidate_interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Refresh(ack)) => {
                    coordinator.invalidate(&key).await;
                    revalidate(&coordinator, &key, ttl, &fetcher, &state, &refresh, &mut prev_error)
                        .await;
                    let _ = ack.send(());
                }
                None => return,
            },
            _ = next_tick => {
                revalidate(&coordinator, &key, ttl, &fetcher, &state, &refresh, &mut prev_error)
                    .await;
            }
        }
    }
}

async fn revalidate<T>(
    coordinator: &Coordinator<T>,
    key: &CacheKey,
    ttl: Duration,
    fetcher: &Fetcher<T>,
    state: &watch::Sender<FetchState<T>>,
    refresh: &RefreshConfig,
    prev_error: &mut Option<FetchError>,
) where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    state.send_modify(|s| {
        s.is_validating = true;
        s.is_loading = s.data.is_none() && s.error.is_none();
    });

    let mut attempt = 0;
    loop {
        match coordinator.resolve(key, ttl, || fetcher()).await {
            Ok(value) => {
                *prev_error = None;
                state.send_modify(|s| {
                    s.data = Some(value);
                    s.error = None;
                    s.is_loading = false;
                    s.is_validating = false;
                });
                return;
            }
            Err(err) => {
                // Log each newly observed error once. Repeated settlements
                // with the same error stay quiet.
                if prev_error.as_ref() != Some(&err) {
                    tracing::warn!(key = %key, error = %err, "fetch failed");
                    *prev_error = Some(err.clone());
                }
                if attempt >= refresh.error_retry_count {
                    state.send_modify(|s| {
                        s.error = Some(err);
                        s.is_loading = false;
                        s.is_validating = false;
                    });
                    return;
                }
                attempt += 1;
                tokio::time::sleep(refresh.error_retry_interval).await;
            }
        }
    }
}
