//! Cart synchronization engine.
//!
//! # Architecture
//!
//! The engine owns the canonical in-memory [`Cart`] and publishes it on a
//! `watch` channel. Every intent follows the same path:
//!
//! ```text
//! intent ─► seq ─► CartApi call ─┬─► server snapshot ─┐
//!                                └─► local fallback  ─┴─► commit ─► watch + cache
//! ```
//!
//! - Reads publish the cached cart first, then retry unauthorized failures
//!   with exponential backoff before settling on the cache.
//! - Mutations never retry. Any failure (no credential, unauthorized,
//!   transport, malformed or rejected) falls through to an optimistic local
//!   mutation flagged as unconfirmed.
//!
//! # Arbitration
//!
//! Each intent takes a monotonic sequence number when it starts. Commits
//! happen one at a time against a single slot that remembers the last
//! published sequence and, per line or product, the newest sequence that
//! touched it:
//!
//! - A server snapshot newer than everything published replaces the cart.
//! - An older fetch result is dropped.
//! - An older mutation result is dropped if a newer intent touched the same
//!   target; otherwise its effect is replayed onto the current cart so that
//!   unrelated concurrent mutations all land.
//! - A local fallback is applied to the current cart unless a newer intent
//!   touched the same target.
//!
//! # Reconciliation
//!
//! The server is authoritative: the next server snapshot that wins
//! arbitration replaces local state, including unconfirmed changes.

mod retry;
mod state;

pub use retry::RetryPolicy;
pub use state::{SyncPhase, SyncState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cartsync_core::{BearerToken, Cart, LineId, ProductId, ProductSnapshot, Quantity};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{Span, debug, info, instrument, warn};

use crate::cache::CartCache;
use crate::config::SyncConfig;
use crate::credential::CredentialCoordinator;
use crate::error::{Result, SyncError};
use crate::gateway::{CartApi, GatewayError, GatewayResult, PayloadShape};

/// Timing knobs for the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Backoff for unauthorized fetches.
    pub retry: RetryPolicy,
    /// Quiet period before a debounced quantity change is sent.
    pub debounce: Duration,
    /// Pause after login before the first fetch.
    pub settle_delay: Duration,
    /// Bounded wait for the checkout credential gate.
    pub credential_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            debounce: Duration::from_millis(300),
            settle_delay: Duration::from_millis(150),
            credential_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            retry: config.retry,
            debounce: config.debounce,
            settle_delay: config.settle_delay,
            credential_timeout: config.credential_timeout,
        }
    }
}

// =============================================================================
// Intents
// =============================================================================

/// What a mutation is about, for arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Line(LineId),
    Product(ProductId),
    Cart,
}

#[derive(Debug, Clone)]
enum Intent {
    Fetch,
    Add {
        product: ProductSnapshot,
        quantity: Quantity,
    },
    SetQuantity {
        line: LineId,
        quantity: Quantity,
    },
    Remove {
        line: LineId,
    },
    Clear {
        lines: Vec<LineId>,
    },
}

impl Intent {
    fn target(&self) -> Option<Target> {
        match self {
            Self::Fetch => None,
            Self::Add { product, .. } => Some(Target::Product(product.product_id.clone())),
            Self::SetQuantity { line, .. } | Self::Remove { line } => {
                Some(Target::Line(line.clone()))
            }
            Self::Clear { .. } => Some(Target::Cart),
        }
    }

    /// The remote call for this intent, or `None` if it can only be applied
    /// locally (the service has never seen locally synthesized lines).
    fn remote<'a>(&'a self, api: &'a dyn CartApi) -> Option<BoxFuture<'a, GatewayResult>> {
        match self {
            Self::Fetch => Some(api.fetch()),
            Self::Add { product, quantity } => Some(api.add(&product.product_id, *quantity)),
            Self::SetQuantity { line, quantity } if !line.is_local() => {
                Some(api.set_quantity(line, *quantity))
            }
            Self::Remove { line } if !line.is_local() => Some(api.remove(line)),
            Self::SetQuantity { .. } | Self::Remove { .. } | Self::Clear { .. } => None,
        }
    }

    /// Apply this intent's effect to `cart`, adjusting totals by delta.
    ///
    /// An effect whose amounts are out of range leaves `cart` unchanged.
    fn apply(&self, cart: &mut Cart) {
        match self {
            Self::Fetch => {}
            Self::Add { product, quantity } => {
                if let Err(e) = cart.add_product(product, *quantity) {
                    warn!(error = %e, product_id = %product.product_id, "Add not applied");
                }
            }
            Self::SetQuantity { line, quantity } => match cart.set_quantity(line, *quantity) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(line_id = %line, "Quantity change for a line no longer in the cart");
                }
                Err(e) => warn!(error = %e, line_id = %line, "Quantity change not applied"),
            },
            Self::Remove { line } => {
                cart.remove_line(line);
            }
            Self::Clear { lines } => {
                for line in lines {
                    cart.remove_line(line);
                }
                if cart.is_empty() {
                    *cart = Cart::empty();
                }
            }
        }
    }

    /// Replay a confirmed effect that lost arbitration onto `cart`.
    ///
    /// The server's copy of the touched line is preferred over re-deriving
    /// it, so a confirmed add keeps its server-assigned line ID.
    fn replay(&self, cart: &mut Cart, server: &Cart) {
        let confirmed = match self {
            Self::Add { product, .. } => server.line_for_product(&product.product_id),
            Self::SetQuantity { line, .. } => server.line(line),
            Self::Fetch | Self::Remove { .. } | Self::Clear { .. } => None,
        };
        let Some(confirmed) = confirmed else {
            self.apply(cart);
            return;
        };

        let mut replayed = cart.clone();
        match replayed
            .items
            .iter_mut()
            .find(|line| line.id == confirmed.id || line.product_id == confirmed.product_id)
        {
            Some(existing) => *existing = confirmed.clone(),
            None => replayed.items.push(confirmed.clone()),
        }
        match replayed.recompute_totals() {
            Ok(()) => *cart = replayed,
            Err(e) => warn!(error = %e, line_id = %confirmed.id, "Confirmed line not replayed"),
        }
    }
}

/// How a commit produces the next cart.
enum Publish {
    /// Replace the cart with a full snapshot.
    Snapshot(Cart),
    /// Apply the intent to the current cart.
    Apply,
}

/// Where a commit came from, for the `unconfirmed` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Confirmed by the service.
    Server,
    /// Optimistic local fallback.
    Local,
    /// Derived from earlier commits or the cache; leaves the flag alone.
    Derived,
}

#[derive(Default)]
struct Slot {
    last_seq: u64,
    marks: HashMap<Target, u64>,
}

// =============================================================================
// CartSyncEngine
// =============================================================================

/// Owner of the canonical cart.
///
/// Cheaply cloneable; clones share the same cart, state and arbitration slot.
#[derive(Clone)]
pub struct CartSyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    api: Arc<dyn CartApi>,
    credentials: CredentialCoordinator,
    cache: CartCache,
    settings: EngineSettings,
    cart: watch::Sender<Cart>,
    state: watch::Sender<SyncState>,
    slot: Mutex<Slot>,
    seq: AtomicU64,
    in_flight: AtomicUsize,
    /// Latest debounce generation per line
    debounce: Mutex<HashMap<LineId, u64>>,
    generation: AtomicU64,
}

impl CartSyncEngine {
    /// Create an engine, seeding the cart from the cache.
    #[must_use]
    pub fn new(
        api: Arc<dyn CartApi>,
        credentials: CredentialCoordinator,
        cache: CartCache,
        settings: EngineSettings,
    ) -> Self {
        let (cart, _) = watch::channel(cache.load_or_empty());
        let (state, _) = watch::channel(SyncState::default());
        Self {
            inner: Arc::new(EngineInner {
                api,
                credentials,
                cache,
                settings,
                cart,
                state,
                slot: Mutex::new(Slot::default()),
                seq: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                debounce: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to cart changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Cart> {
        self.inner.cart.subscribe()
    }

    /// Subscribe to synchronization state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// The currently published cart.
    #[must_use]
    pub fn snapshot(&self) -> Cart {
        self.inner.cart.borrow().clone()
    }

    /// The current synchronization state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        self.inner.state.borrow().phase()
    }

    /// The credential coordinator this engine authenticates with.
    #[must_use]
    pub fn credentials(&self) -> &CredentialCoordinator {
        &self.inner.credentials
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Load the cart from the service.
    ///
    /// Publishes the cached cart first, then retries unauthorized failures
    /// with backoff. Always resolves to a cart; failures settle on the cache.
    #[instrument(skip(self), fields(seq = tracing::field::Empty))]
    pub async fn fetch(&self) -> Cart {
        let _busy = self.begin();
        let seq = self.next_seq();
        Span::current().record("seq", seq);

        if let Some(cached) = self.inner.cache.load() {
            self.commit(seq, &Intent::Fetch, Publish::Snapshot(cached), Origin::Derived);
        }

        let policy = self.inner.settings.retry;
        let mut attempt = 0;
        loop {
            match self.inner.api.fetch().await {
                Ok(remote) => {
                    self.record_success();
                    return self.commit(
                        seq,
                        &Intent::Fetch,
                        Publish::Snapshot(remote.cart),
                        Origin::Server,
                    );
                }
                Err(e) if e.is_retryable() => {
                    self.inner.credentials.invalidate();
                    if !policy.allows(attempt) {
                        warn!(attempt, "Unauthorized after retries, using cached cart");
                        self.record_failure(&e);
                        break;
                    }
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    self.inner.state.send_modify(|state| {
                        state.retry_attempt = attempt;
                        state.last_error = Some(e.kind());
                    });
                    info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Unauthorized, retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, "Fetch failed, using cached cart");
                    self.record_failure(&e);
                    break;
                }
            }
        }

        self.snapshot()
    }

    // =========================================================================
    // Mutation path
    // =========================================================================

    /// Add units of a product. Quantities are clamped to `[1, 99]`.
    #[instrument(skip(self, product), fields(product_id = %product.product_id, seq = tracing::field::Empty))]
    pub async fn add(&self, product: ProductSnapshot, requested: i64) -> Cart {
        let quantity = Quantity::clamped(requested);
        self.mutate(Intent::Add { product, quantity }).await
    }

    /// Set a line's quantity. Quantities are clamped to `[1, 99]`.
    #[instrument(skip(self), fields(line_id = %line, seq = tracing::field::Empty))]
    pub async fn set_quantity(&self, line: LineId, requested: i64) -> Cart {
        let quantity = Quantity::clamped(requested);
        self.mutate(Intent::SetQuantity { line, quantity }).await
    }

    /// Remove a line.
    #[instrument(skip(self), fields(line_id = %line, seq = tracing::field::Empty))]
    pub async fn remove(&self, line: LineId) -> Cart {
        self.mutate(Intent::Remove { line }).await
    }

    /// Remove every line, one request at a time.
    ///
    /// Each removal falls back locally on its own; the result is the
    /// canonical empty cart even if every removal fails.
    #[instrument(skip(self), fields(seq = tracing::field::Empty))]
    pub async fn clear_cart(&self) -> Cart {
        let _busy = self.begin();
        let seq = self.next_seq();
        Span::current().record("seq", seq);

        let lines = self.snapshot().line_ids();
        debug!(lines = lines.len(), "Clearing cart");
        for line in &lines {
            self.remove(line.clone()).await;
        }

        self.commit(seq, &Intent::Clear { lines }, Publish::Apply, Origin::Derived)
    }

    /// Set a line's quantity after the debounce window.
    ///
    /// Rapid calls for the same line collapse to the last one: earlier calls
    /// resolve to `None` without touching the service.
    pub async fn set_quantity_debounced(&self, line: LineId, requested: i64) -> Option<Cart> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.debounce_map().insert(line.clone(), generation);

        tokio::time::sleep(self.inner.settings.debounce).await;

        {
            let mut latest = self.debounce_map();
            if latest.get(&line) != Some(&generation) {
                debug!(line_id = %line, requested, "Superseded quantity change dropped");
                return None;
            }
            latest.remove(&line);
        }

        Some(self.set_quantity(line, requested).await)
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Store a credential from an explicit login, then reload the cart.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidCredential` if the credential is malformed.
    #[instrument(skip(self, raw))]
    pub async fn login(&self, raw: &str) -> Result<Cart> {
        self.inner.credentials.login(raw)?;
        self.inner.state.send_modify(|state| state.auth_issue_detected = false);
        tokio::time::sleep(self.inner.settings.settle_delay).await;
        Ok(self.fetch().await)
    }

    /// Clear the credential and opt out of automatic acquisition.
    ///
    /// The cart stays usable from the cache.
    pub fn logout(&self) {
        self.inner.credentials.clear(true);
        info!("Logged out");
    }

    /// Gate for operations that cannot proceed without a credential.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AuthenticationRequired` if no credential is
    /// obtainable within the credential timeout.
    pub async fn require_credential(&self) -> Result<BearerToken> {
        self.inner
            .credentials
            .ensure_within(self.inner.settings.credential_timeout)
            .await
            .ok_or(SyncError::AuthenticationRequired)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn mutate(&self, intent: Intent) -> Cart {
        let _busy = self.begin();
        let seq = self.next_seq();
        Span::current().record("seq", seq);

        let outcome = match intent.remote(&*self.inner.api) {
            Some(call) => Some(call.await),
            None => None,
        };

        match outcome {
            Some(Ok(remote)) if remote.shape != PayloadShape::Unrecognized => {
                self.record_success();
                return self.commit(seq, &intent, Publish::Snapshot(remote.cart), Origin::Server);
            }
            Some(Ok(_)) => {
                warn!("Unrecognized mutation response, applying locally");
                self.record_failure(&GatewayError::Malformed("unrecognized cart shape".into()));
            }
            Some(Err(e)) => {
                warn!(error = %e, "Mutation failed, applying locally");
                if e == GatewayError::Unauthorized {
                    self.inner.credentials.invalidate();
                }
                self.record_failure(&e);
            }
            None => debug!("Line exists only locally, applying locally"),
        }

        self.commit(seq, &intent, Publish::Apply, Origin::Local)
    }

    /// Arbitrate and publish. Returns the cart visible afterwards.
    fn commit(&self, seq: u64, intent: &Intent, publish: Publish, origin: Origin) -> Cart {
        let mut slot = self.slot();
        let target = intent.target();
        let superseded = target
            .as_ref()
            .and_then(|t| slot.marks.get(t))
            .is_some_and(|&mark| mark > seq);

        let current = self.snapshot();
        let (next, replaced) = match publish {
            Publish::Snapshot(cart) if seq >= slot.last_seq => (cart, true),
            Publish::Snapshot(_) if target.is_none() || superseded => {
                debug!(seq, last_seq = slot.last_seq, "Discarding stale snapshot");
                return current;
            }
            Publish::Apply if superseded => {
                debug!(seq, "Discarding superseded local change");
                return current;
            }
            Publish::Snapshot(server) => {
                let mut cart = current.clone();
                intent.replay(&mut cart, &server);
                (cart, false)
            }
            Publish::Apply => {
                let mut cart = current.clone();
                intent.apply(&mut cart);
                (cart, false)
            }
        };

        slot.last_seq = slot.last_seq.max(seq);
        if let Some(target) = target {
            let mark = slot.marks.entry(target).or_default();
            *mark = (*mark).max(seq);
        }

        let was_unconfirmed = self.inner.state.borrow().unconfirmed;
        match (origin, replaced) {
            (Origin::Server, true) => {
                if was_unconfirmed && next != current {
                    warn!("Server cart replaces unconfirmed local changes");
                }
                self.inner.state.send_modify(|state| state.unconfirmed = false);
            }
            (Origin::Local, _) => {
                self.inner.state.send_modify(|state| state.unconfirmed = true);
            }
            _ => {}
        }

        if let Err(e) = self.inner.cache.save(&next) {
            warn!(error = %e, "Failed to persist cart");
        }
        self.inner.cart.send_replace(next.clone());
        next
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn begin(&self) -> Busy<'_> {
        if self.inner.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.state.send_modify(|state| {
                state.loading = true;
                state.retry_attempt = 0;
            });
        }
        Busy { engine: self }
    }

    fn record_success(&self) {
        self.inner.state.send_modify(|state| {
            state.last_error = None;
            state.auth_issue_detected = false;
        });
    }

    fn record_failure(&self, error: &GatewayError) {
        let kind = error.kind();
        self.inner.state.send_modify(|state| {
            state.last_error = Some(kind);
            if matches!(error, GatewayError::Unauthorized | GatewayError::NoCredential) {
                state.auth_issue_detected = true;
            }
        });
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn debounce_map(&self) -> MutexGuard<'_, HashMap<LineId, u64>> {
        self.inner
            .debounce
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the engine busy for the lifetime of an intent.
struct Busy<'a> {
    engine: &'a CartSyncEngine,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let inner = &self.engine.inner;
        if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Nothing older can still be in flight
            self.engine.slot().marks.clear();
            inner.state.send_modify(|state| {
                state.loading = false;
                state.settled = true;
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;

    use cartsync_core::CartLine;
    use rust_decimal::Decimal;
    use tokio::time::Instant;

    use super::*;
    use crate::credential::tests::jwt;
    use crate::credential::{CoordinatorSettings, CredentialStore, NoTokenSource};
    use crate::error::ErrorKind;
    use crate::gateway::RemoteCart;
    use crate::storage::{MemoryStore, SharedStore};

    struct Scripted {
        delay: Duration,
        result: GatewayResult,
    }

    /// Cart service double answering from a script, then with `fallback`.
    struct FakeApi {
        script: Mutex<VecDeque<Scripted>>,
        fallback: GatewayError,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl FakeApi {
        fn failing(fallback: GatewayError) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn then(self, delay_ms: u64, result: GatewayResult) -> Self {
            self.script.lock().unwrap().push_back(Scripted {
                delay: Duration::from_millis(delay_ms),
                result,
            });
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(call, _)| call.clone())
                .collect()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }

        fn respond(&self, call: String) -> BoxFuture<'_, GatewayResult> {
            self.calls.lock().unwrap().push((call, Instant::now()));
            let scripted = self.script.lock().unwrap().pop_front();
            Box::pin(async move {
                match scripted {
                    Some(Scripted { delay, result }) => {
                        tokio::time::sleep(delay).await;
                        result
                    }
                    None => Err(self.fallback.clone()),
                }
            })
        }
    }

    impl CartApi for FakeApi {
        fn fetch(&self) -> BoxFuture<'_, GatewayResult> {
            self.respond("fetch".to_string())
        }

        fn add<'a>(
            &'a self,
            product_id: &'a ProductId,
            quantity: Quantity,
        ) -> BoxFuture<'a, GatewayResult> {
            self.respond(format!("add {product_id} {quantity}"))
        }

        fn set_quantity<'a>(
            &'a self,
            line_id: &'a LineId,
            quantity: Quantity,
        ) -> BoxFuture<'a, GatewayResult> {
            self.respond(format!("set {line_id} {quantity}"))
        }

        fn remove<'a>(&'a self, line_id: &'a LineId) -> BoxFuture<'a, GatewayResult> {
            self.respond(format!("remove {line_id}"))
        }
    }

    fn line(id: i64, product: i64, price: i64, quantity: i64) -> CartLine {
        CartLine {
            id: LineId::from(id),
            product_id: ProductId::from(product),
            name: format!("Product {product}"),
            unit_price: Decimal::from(price),
            image: None,
            quantity: Quantity::clamped(quantity),
            line_total: None,
        }
    }

    fn server(lines: Vec<CartLine>) -> GatewayResult {
        Ok(RemoteCart {
            cart: Cart::from_lines(lines).unwrap(),
            shape: PayloadShape::Explicit,
        })
    }

    struct Harness {
        engine: CartSyncEngine,
        api: Arc<FakeApi>,
        storage: SharedStore,
    }

    fn harness(api: FakeApi, cached: Option<Cart>) -> Harness {
        let storage = MemoryStore::shared();
        if let Some(cart) = cached {
            CartCache::new(storage.clone()).save(&cart).unwrap();
        }
        let credentials = CredentialCoordinator::new(
            CredentialStore::new(storage.clone()),
            Arc::new(NoTokenSource),
            CoordinatorSettings::default(),
        );
        let api = Arc::new(api);
        let engine = CartSyncEngine::new(
            api.clone(),
            credentials,
            CartCache::new(storage.clone()),
            EngineSettings {
                credential_timeout: Duration::from_millis(100),
                ..EngineSettings::default()
            },
        );
        Harness {
            engine,
            api,
            storage,
        }
    }

    fn cached(h: &Harness) -> Option<Cart> {
        CartCache::new(h.storage.clone()).load()
    }

    fn one_line_cart() -> Cart {
        Cart::from_lines(vec![line(1, 9, 10, 2)]).unwrap()
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_engine_starts_from_cache() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        assert_eq!(h.engine.snapshot(), one_line_cart());
        assert_eq!(h.engine.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_fetch_publishes_and_persists_server_cart() {
        let fresh = vec![line(1, 9, 10, 3), line(2, 4, 5, 1)];
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())).then(0, server(fresh.clone())),
            Some(one_line_cart()),
        );
        let mut updates = h.engine.subscribe();

        let cart = h.engine.fetch().await;
        assert_eq!(cart, Cart::from_lines(fresh).unwrap());
        assert_eq!(cart.total_items, 4);
        assert_eq!(cached(&h).unwrap(), cart);
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), cart);
        assert_eq!(h.engine.phase(), SyncPhase::Ready);
    }

    #[tokio::test]
    async fn test_fetch_transport_failure_falls_back_without_retry() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        let cart = h.engine.fetch().await;
        assert_eq!(cart, one_line_cart());
        assert_eq!(h.api.calls(), vec!["fetch"]);

        let state = h.engine.state();
        assert_eq!(state.last_error, Some(ErrorKind::Transport));
        assert!(!state.loading);
        assert_eq!(h.engine.phase(), SyncPhase::Ready);
    }

    #[tokio::test]
    async fn test_fetch_without_cache_falls_back_to_empty() {
        let h = harness(FakeApi::failing(GatewayError::Malformed("html".into())), None);
        assert_eq!(h.engine.fetch().await, Cart::empty());
        assert_eq!(
            h.engine.state().last_error,
            Some(ErrorKind::MalformedResponse)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_fetch_retries_with_backoff() {
        let h = harness(
            FakeApi::failing(GatewayError::Unauthorized),
            Some(one_line_cart()),
        );
        let started = Instant::now();
        let cart = h.engine.fetch().await;

        // Initial attempt plus three retries
        assert_eq!(h.api.calls().len(), 4);
        let times = h.api.call_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(1000));
        assert!(gaps[1] >= Duration::from_millis(2000));
        assert!(gaps[2] >= Duration::from_millis(4000));
        assert!(started.elapsed() >= Duration::from_millis(7000));

        assert_eq!(cart, one_line_cart());
        let state = h.engine.state();
        assert!(state.auth_issue_detected);
        assert_eq!(state.retry_attempt, 3);
        assert_eq!(state.last_error, Some(ErrorKind::Unauthorized));
        assert_eq!(h.engine.phase(), SyncPhase::AuthIssue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_fetch_recovers_on_retry() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(0, Err(GatewayError::Unauthorized))
                .then(0, server(vec![line(5, 5, 1, 1)])),
            None,
        );
        let cart = h.engine.fetch().await;
        assert_eq!(cart.items[0].id, LineId::from(5));
        assert_eq!(h.api.calls().len(), 2);
        assert_eq!(h.engine.phase(), SyncPhase::Ready);
        assert_eq!(h.engine.state().last_error, None);
    }

    #[tokio::test]
    async fn test_unauthorized_without_retries_flags_auth_issue_at_once() {
        let api = FakeApi::failing(GatewayError::Unauthorized);
        let mut h = harness(api, None);
        let engine = CartSyncEngine::new(
            h.api.clone(),
            h.engine.credentials().clone(),
            CartCache::new(h.storage.clone()),
            EngineSettings {
                retry: RetryPolicy::none(),
                ..EngineSettings::default()
            },
        );
        h.engine = engine;

        h.engine.fetch().await;
        assert_eq!(h.api.calls().len(), 1);
        assert_eq!(h.engine.phase(), SyncPhase::AuthIssue);
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_stored_credential() {
        let h = harness(FakeApi::failing(GatewayError::Unauthorized), None);
        h.engine.credentials().store(&jwt("shopper", 3600)).unwrap();

        h.engine.set_quantity(LineId::from(1), 2).await;
        assert!(h.engine.credentials().peek().is_none());
        // Invalidation is not a logout
        assert!(!h.engine.credentials().opted_out());
    }

    // -------------------------------------------------------------------------
    // Mutation path
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_set_quantity_falls_back_to_local_mutation() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        let cart = h.engine.set_quantity(LineId::from(1), 5).await;

        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity.get(), 5);
        assert_eq!(cart.total_items, 5);
        assert_eq!(cart.subtotal, Decimal::from(50));
        assert!(cart.is_consistent());
        assert_eq!(cached(&h).unwrap(), cart);
        assert!(h.engine.state().unconfirmed);
    }

    #[tokio::test]
    async fn test_quantities_are_clamped_before_sending() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        let cart = h.engine.set_quantity(LineId::from(1), 0).await;
        assert_eq!(cart.items[0].quantity.get(), 1);
        let cart = h.engine.set_quantity(LineId::from(1), 250).await;
        assert_eq!(cart.items[0].quantity.get(), 99);
        assert_eq!(cart.total_items, 99);
        assert_eq!(cart.subtotal, Decimal::from(990));

        assert_eq!(h.api.calls(), vec!["set 1 1", "set 1 99"]);
    }

    #[tokio::test]
    async fn test_server_confirmed_mutation_replaces_cart() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(0, server(vec![line(1, 9, 10, 4)])),
            Some(one_line_cart()),
        );
        let cart = h.engine.set_quantity(LineId::from(1), 4).await;
        assert_eq!(cart.total_items, 4);
        assert_eq!(cart.subtotal, Decimal::from(40));
        assert!(!h.engine.state().unconfirmed);
    }

    #[tokio::test]
    async fn test_unrecognized_mutation_response_applies_locally() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())).then(
                0,
                Ok(RemoteCart {
                    cart: Cart::empty(),
                    shape: PayloadShape::Unrecognized,
                }),
            ),
            Some(one_line_cart()),
        );
        let cart = h.engine.remove(LineId::from(1)).await;
        assert_eq!(cart, Cart::empty());
        assert_eq!(
            h.engine.state().last_error,
            Some(ErrorKind::MalformedResponse)
        );

        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())).then(
                0,
                Ok(RemoteCart {
                    cart: Cart::empty(),
                    shape: PayloadShape::Unrecognized,
                }),
            ),
            Some(one_line_cart()),
        );
        // The local quantity change survives a garbage response
        let cart = h.engine.set_quantity(LineId::from(1), 3).await;
        assert_eq!(cart.total_items, 3);
    }

    #[tokio::test]
    async fn test_rejected_mutation_applies_locally() {
        let h = harness(
            FakeApi::failing(GatewayError::Rejected("Out of stock".into())),
            None,
        );
        let product = ProductSnapshot {
            product_id: ProductId::from("p-7"),
            name: "Pineapple Jam".to_string(),
            unit_price: Decimal::new(650, 2),
            image: None,
        };
        let cart = h.engine.add(product, 2).await;
        assert_eq!(cart.items.len(), 1);
        assert!(cart.items[0].id.is_local());
        assert_eq!(cart.subtotal, Decimal::from(13));
        assert_eq!(
            h.engine.state().last_error,
            Some(ErrorKind::ValidationRejected)
        );
        assert!(!h.engine.state().auth_issue_detected);
    }

    #[tokio::test]
    async fn test_local_add_out_of_range_leaves_cart_unchanged() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        let product = ProductSnapshot {
            product_id: ProductId::from("bullion"),
            name: "Gold Bar".to_string(),
            unit_price: Decimal::MAX,
            image: None,
        };
        let cart = h.engine.add(product, 2).await;
        assert_eq!(cart, one_line_cart());
        assert!(cart.is_consistent());
        assert_eq!(cached(&h).unwrap(), one_line_cart());
    }

    #[tokio::test]
    async fn test_local_lines_never_reach_the_service() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            None,
        );
        let cart = h
            .engine
            .add(ProductSnapshot::bare(ProductId::from(3)), 1)
            .await;
        let local = cart.items[0].id.clone();

        h.engine.set_quantity(local.clone(), 4).await;
        let cart = h.engine.remove(local).await;
        assert_eq!(cart, Cart::empty());
        assert_eq!(h.api.calls(), vec!["add 3 1"]);
    }

    #[tokio::test]
    async fn test_unauthorized_mutation_does_not_retry() {
        let h = harness(
            FakeApi::failing(GatewayError::Unauthorized),
            Some(one_line_cart()),
        );
        let cart = h.engine.remove(LineId::from(1)).await;
        assert!(cart.is_empty());
        assert_eq!(h.api.calls().len(), 1);
        assert_eq!(h.engine.phase(), SyncPhase::AuthIssue);
    }

    #[tokio::test]
    async fn test_clear_cart_with_failing_removals_yields_empty_cart() {
        let cart = Cart::from_lines(vec![line(1, 1, 3, 1), line(2, 2, 4, 2), line(3, 3, 5, 3)])
            .unwrap();
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(cart),
        );

        let cleared = h.engine.clear_cart().await;
        assert_eq!(cleared, Cart::empty());
        assert_eq!(cleared.total_items, 0);
        assert_eq!(cleared.subtotal, Decimal::ZERO);
        assert_eq!(h.api.calls(), vec!["remove 1", "remove 2", "remove 3"]);
        assert_eq!(cached(&h).unwrap(), Cart::empty());
    }

    #[tokio::test]
    async fn test_clear_cart_on_empty_cart() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            None,
        );
        assert_eq!(h.engine.clear_cart().await, Cart::empty());
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_successful_mutation_clears_auth_issue() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(0, Err(GatewayError::Unauthorized))
                .then(0, server(vec![line(1, 9, 10, 1)])),
            Some(one_line_cart()),
        );
        h.engine.set_quantity(LineId::from(1), 3).await;
        assert_eq!(h.engine.phase(), SyncPhase::AuthIssue);

        h.engine.set_quantity(LineId::from(1), 1).await;
        assert_eq!(h.engine.phase(), SyncPhase::Ready);
        assert!(!h.engine.state().unconfirmed);
    }

    // -------------------------------------------------------------------------
    // Arbitration
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_later_set_quantity_wins_when_completions_reverse() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(200, server(vec![line(1, 9, 10, 3)]))
                .then(50, server(vec![line(1, 9, 10, 7)])),
            Some(one_line_cart()),
        );

        let (first, second) = tokio::join!(
            h.engine.set_quantity(LineId::from(1), 3),
            h.engine.set_quantity(LineId::from(1), 7),
        );

        assert_eq!(second.items[0].quantity.get(), 7);
        // The stale confirmation is dropped
        assert_eq!(first.items[0].quantity.get(), 7);
        assert_eq!(h.engine.snapshot().items[0].quantity.get(), 7);
        assert_eq!(h.engine.snapshot().total_items, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_local_fallback_does_not_overwrite_confirmation() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(200, Err(GatewayError::Transport("timeout".into())))
                .then(50, server(vec![line(1, 9, 10, 6)])),
            Some(one_line_cart()),
        );

        tokio::join!(
            h.engine.set_quantity(LineId::from(1), 2),
            h.engine.set_quantity(LineId::from(1), 6),
        );
        assert_eq!(h.engine.snapshot().items[0].quantity.get(), 6);
        assert!(!h.engine.state().unconfirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_removes_of_different_lines_both_land() {
        let cart = Cart::from_lines(vec![line(1, 1, 3, 1), line(2, 2, 4, 2)]).unwrap();
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                // remove 1 answers late, before it saw remove 2
                .then(200, server(vec![line(2, 2, 4, 2)]))
                // remove 2 answers first, before it saw remove 1
                .then(50, server(vec![line(1, 1, 3, 1)])),
            Some(cart),
        );

        tokio::join!(
            h.engine.remove(LineId::from(1)),
            h.engine.remove(LineId::from(2)),
        );
        let cart = h.engine.snapshot();
        assert!(cart.is_empty());
        assert_eq!(cart.total_items, 0);
        assert_eq!(cart.subtotal, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fetch_does_not_overwrite_mutation() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(300, server(vec![line(1, 9, 10, 2)]))
                .then(0, Err(GatewayError::Transport("offline".into()))),
            Some(one_line_cart()),
        );

        tokio::join!(h.engine.fetch(), h.engine.set_quantity(LineId::from(1), 8));
        assert_eq!(h.engine.snapshot().items[0].quantity.get(), 8);
        assert!(h.engine.state().unconfirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_add_confirmation_keeps_server_line() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                // add p5, answers late with the server's line for it
                .then(200, server(vec![line(1, 9, 10, 1), line(5, 5, 2, 1)]))
                // set line 1, answers first without the new line
                .then(50, server(vec![line(1, 9, 10, 4)])),
            Some(one_line_cart()),
        );

        tokio::join!(
            h.engine.add(ProductSnapshot::bare(ProductId::from(5)), 1),
            h.engine.set_quantity(LineId::from(1), 4),
        );
        let cart = h.engine.snapshot();
        assert_eq!(cart.line_ids(), vec![LineId::from(1), LineId::from(5)]);
        assert_eq!(cart.items[0].quantity.get(), 4);
        assert!(!cart.has_local_lines());
        assert_eq!(cart.subtotal, Decimal::from(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_add_survives_clear() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                // remove 1
                .then(100, Err(GatewayError::Transport("offline".into())))
                // add p-new
                .then(0, Err(GatewayError::Transport("offline".into()))),
            Some(one_line_cart()),
        );

        let (_, _) = tokio::join!(
            h.engine.clear_cart(),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                h.engine
                    .add(ProductSnapshot::bare(ProductId::from("p-new")), 1)
                    .await
            }
        );
        let cart = h.engine.snapshot();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].product_id, ProductId::from("p-new"));
    }

    // -------------------------------------------------------------------------
    // Debounce and session
    // -------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_debounced_quantity_collapses_to_last_value() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        let engine = &h.engine;

        let (a, b, c) = tokio::join!(
            engine.set_quantity_debounced(LineId::from(1), 3),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                engine.set_quantity_debounced(LineId::from(1), 4).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                engine.set_quantity_debounced(LineId::from(1), 5).await
            },
        );

        assert!(a.is_none());
        assert!(b.is_none());
        assert_eq!(c.unwrap().items[0].quantity.get(), 5);
        assert_eq!(h.api.calls(), vec!["set 1 5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_is_per_line() {
        let cart = Cart::from_lines(vec![line(1, 1, 1, 1), line(2, 2, 1, 1)]).unwrap();
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(cart),
        );
        let (a, b) = tokio::join!(
            h.engine.set_quantity_debounced(LineId::from(1), 2),
            h.engine.set_quantity_debounced(LineId::from(2), 3),
        );
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(h.engine.snapshot().total_items, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_stores_credential_and_fetches() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into()))
                .then(0, server(vec![line(8, 8, 2, 2)])),
            None,
        );
        h.engine.logout();
        assert!(h.engine.credentials().opted_out());

        let started = Instant::now();
        let cart = h.engine.login(&jwt("shopper", 3600)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(cart.total_items, 2);
        assert!(!h.engine.credentials().opted_out());
        assert!(h.engine.credentials().peek().is_some());
    }

    #[tokio::test]
    async fn test_login_rejects_malformed_credential() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            None,
        );
        assert!(matches!(
            h.engine.login("not-a-token").await,
            Err(SyncError::InvalidCredential(_))
        ));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_logout_keeps_cart() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            Some(one_line_cart()),
        );
        h.engine.credentials().store(&jwt("shopper", 3600)).unwrap();
        h.engine.logout();
        assert!(h.engine.credentials().peek().is_none());
        assert_eq!(h.engine.snapshot(), one_line_cart());
    }

    #[tokio::test(start_paused = true)]
    async fn test_require_credential() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            None,
        );
        assert!(matches!(
            h.engine.require_credential().await,
            Err(SyncError::AuthenticationRequired)
        ));

        h.engine.credentials().store(&jwt("shopper", 3600)).unwrap();
        assert_eq!(
            h.engine.require_credential().await.unwrap().subject(),
            Some("shopper")
        );
    }

    #[tokio::test]
    async fn test_state_stream_reports_loading() {
        let h = harness(
            FakeApi::failing(GatewayError::Transport("offline".into())),
            None,
        );
        let mut states = h.engine.subscribe_state();
        h.engine.fetch().await;
        assert!(states.has_changed().unwrap());
        let state = states.borrow_and_update().clone();
        assert!(!state.loading);
        assert!(state.settled);
    }
}
