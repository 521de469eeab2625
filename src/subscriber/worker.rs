//! Event subscriber workers.
//!
//! Two named threads cooperate:
//!
//! - `devconfirm-feed` owns the connection: connect, subscribe, liveness
//!   probing, reconnect with backoff. It forwards raw events and connection
//!   lifecycle changes on an unbounded channel.
//! - `devconfirm-fanout` is the single delivery path. It owns the listener
//!   registry, checks sequence numbers, runs resyncs and updates the state
//!   cache. Because registration is processed on the same thread, a new
//!   listener's initial cached states and its first event can never race.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::SubscriberConfig;
use crate::control::{ControlPlane, EventFeed, FeedConnection, FeedMessage, RawEvent};
use crate::entity::{EntityId, EntityState};
use crate::error::{ConfirmError, ConfirmResult, ControlPlaneError, ExecutionError};
use crate::tracker::duration_ms;

use super::backoff::Backoff;
use super::cache::StateCache;
use super::envelope::{EntityFilter, EnvelopeOrigin, EventEnvelope, FeedHealth, FeedSignal, SubscriptionId};
use super::stream::Subscription;

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Register {
        subscription_id: SubscriptionId,
        filter: EntityFilter,
        tx: Sender<FeedSignal>,
        reply: Sender<ConfirmResult<Vec<(EntityId, EntityState)>>>,
    },
    Unregister {
        subscription_id: SubscriptionId,
    },
}

#[derive(Debug)]
enum FeedInput {
    Connected { epoch: u64 },
    Message { epoch: u64, event: RawEvent },
    Degraded { attempts: u32, last_error: String },
    Fatal(ControlPlaneError),
}

#[derive(Debug)]
struct Shared {
    health: RwLock<FeedHealth>,
    fatal: RwLock<Option<ControlPlaneError>>,
    dropped_diagnostics: AtomicU64,
    cache: Arc<StateCache>,
}

impl Shared {
    fn set_health(&self, health: FeedHealth) {
        *self.health.write().unwrap_or_else(PoisonError::into_inner) = health;
    }
}

/// Reconnecting, ordered, gap-aware fan-out of the control plane's event feed.
#[derive(Debug)]
pub struct EventSubscriber {
    control_tx: Sender<ControlMsg>,
    shared: Arc<Shared>,
    diagnostics_rx: Receiver<EventEnvelope>,
    stop_tx: Mutex<Option<Sender<()>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl EventSubscriber {
    /// Starts the feed and fan-out threads.
    ///
    /// `control` is used for one-shot state reads during resync.
    pub fn start(feed: Arc<dyn EventFeed>, control: Arc<dyn ControlPlane>, cfg: SubscriberConfig) -> Self {
        let (control_tx, control_rx) = bounded::<ControlMsg>(cfg.control_queue_capacity.max(1));
        let (input_tx, input_rx) = unbounded::<FeedInput>();
        let (diagnostics_tx, diagnostics_rx) = bounded::<EventEnvelope>(cfg.diagnostics_capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let shared = Arc::new(Shared {
            health: RwLock::new(FeedHealth::Connecting),
            fatal: RwLock::new(None),
            dropped_diagnostics: AtomicU64::new(0),
            cache: Arc::new(StateCache::new()),
        });

        let feed_shared = Arc::clone(&shared);
        let feed_join = thread::Builder::new()
            .name("devconfirm-feed".to_string())
            .spawn(move || feed_loop(&*feed, &cfg, &feed_shared, &input_tx, &stop_rx))
            .expect("failed to spawn devconfirm feed worker");

        let fanout = Fanout {
            control,
            shared: Arc::clone(&shared),
            diagnostics_tx,
            listeners: HashMap::new(),
            epoch: 0,
            last_seq: 0,
            fatal: None,
        };
        let fanout_join = thread::Builder::new()
            .name("devconfirm-fanout".to_string())
            .spawn(move || fanout.run(&control_rx, &input_rx))
            .expect("failed to spawn devconfirm fan-out worker");

        Self {
            control_tx,
            shared,
            diagnostics_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            joins: Mutex::new(vec![feed_join, fanout_join]),
        }
    }

    /// Registers a listener.
    ///
    /// The returned subscription carries the cached state of every entity the
    /// filter names, captured atomically with respect to event delivery.
    ///
    /// # Errors
    /// - `ControlPlane(Authentication)` once the feed has failed fatally
    /// - `Execution(Disconnected)` after shutdown
    pub fn subscribe(&self, filter: EntityFilter) -> ConfirmResult<Subscription> {
        let subscription_id = SubscriptionId::new();
        let (tx, rx) = unbounded::<FeedSignal>();
        let (reply_tx, reply_rx) = bounded(1);

        self.control_tx
            .send(ControlMsg::Register {
                subscription_id,
                filter: filter.clone(),
                tx,
                reply: reply_tx,
            })
            .map_err(|_| control_disconnected())?;

        let initial = reply_rx.recv().map_err(|_| control_disconnected())??;

        Ok(Subscription::new(subscription_id, filter, rx, initial, self.control_tx.clone()))
    }

    /// Runs `callback` for every signal matching `filter` on a dedicated thread.
    ///
    /// A slow callback only delays its own queue. Dropping the handle stops it.
    pub fn on_event<F>(&self, filter: EntityFilter, mut callback: F) -> ConfirmResult<CallbackHandle>
    where
        F: FnMut(FeedSignal) + Send + 'static,
    {
        let subscription = self.subscribe(filter)?;
        let id = subscription.id();
        let join = thread::Builder::new()
            .name("devconfirm-callback".to_string())
            .spawn(move || {
                while let Ok(signal) = subscription.recv() {
                    callback(signal);
                }
            })
            .map_err(|e| ConfirmError::internal(format!("failed to spawn callback worker: {e}")))?;

        Ok(CallbackHandle {
            id,
            control_tx: self.control_tx.clone(),
            join: Some(join),
        })
    }

    /// Lossy diagnostic copy of every delivered envelope.
    ///
    /// The queue is bounded; envelopes that do not fit are counted in
    /// [`Self::dropped_diagnostics`] and discarded. Listener queues are unaffected.
    #[must_use]
    pub fn diagnostics_tap(&self) -> Receiver<EventEnvelope> {
        self.diagnostics_rx.clone()
    }

    /// Envelopes discarded by the diagnostics tap.
    #[must_use]
    pub fn dropped_diagnostics(&self) -> u64 {
        self.shared.dropped_diagnostics.load(Ordering::Relaxed)
    }

    /// Last-known state of an entity.
    #[must_use]
    pub fn cached_state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.shared.cache.get(entity_id)
    }

    /// Shared handle to the state cache.
    #[must_use]
    pub fn state_cache(&self) -> Arc<StateCache> {
        Arc::clone(&self.shared.cache)
    }

    /// Current connection health.
    #[must_use]
    pub fn health(&self) -> FeedHealth {
        *self.shared.health.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The error that stopped the feed, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<ControlPlaneError> {
        self.shared.fatal.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stops both threads and waits for them. Idempotent.
    ///
    /// Open subscriptions observe a disconnected stream afterwards.
    pub fn shutdown(&self) {
        let stop = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(stop);

        let joins = std::mem::take(&mut *self.joins.lock().unwrap_or_else(PoisonError::into_inner));
        for join in joins {
            if join.join().is_err() {
                error!("subscriber worker panicked");
            }
        }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn control_disconnected() -> ConfirmError {
    ConfirmError::Execution(ExecutionError::Disconnected {
        path: "subscriber_control".to_string(),
    })
}

/// Handle for a callback registered with [`EventSubscriber::on_event`].
#[derive(Debug)]
pub struct CallbackHandle {
    id: SubscriptionId,
    control_tx: Sender<ControlMsg>,
    join: Option<JoinHandle<()>>,
}

impl CallbackHandle {
    /// The subscription backing the callback.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        // Blocks while the control queue is full; errors only once the fan-out has exited.
        let _ = self.control_tx.send(ControlMsg::Unregister { subscription_id: self.id });
        // Detached: the worker exits once its queue is disconnected.
        drop(self.join.take());
    }
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

enum PumpExit {
    Stopped,
    Lost(ControlPlaneError),
}

fn feed_loop(
    feed: &dyn EventFeed,
    cfg: &SubscriberConfig,
    shared: &Shared,
    input_tx: &Sender<FeedInput>,
    stop_rx: &Receiver<()>,
) {
    let backoff = Backoff::from_config(cfg);
    let mut rng = rand::thread_rng();
    let mut epoch = 0_u64;
    let mut attempt = 0_u32;
    let mut degraded_sent = false;

    loop {
        if stop_requested(stop_rx) {
            return;
        }

        let connected = feed.connect().and_then(|mut conn| {
            conn.subscribe(&EntityFilter::All)?;
            Ok(conn)
        });

        let failure = match connected {
            Ok(conn) => {
                epoch += 1;
                attempt = 0;
                degraded_sent = false;
                shared.set_health(FeedHealth::Live { epoch });
                info!(epoch, "event feed connected");
                if input_tx.send(FeedInput::Connected { epoch }).is_err() {
                    return;
                }
                match pump(conn, epoch, cfg, input_tx, stop_rx) {
                    PumpExit::Stopped => return,
                    PumpExit::Lost(err) => err,
                }
            }
            Err(err) => err,
        };

        if failure.is_fatal() {
            error!(error = %failure, "event feed rejected credentials; giving up");
            shared.set_health(FeedHealth::Failed);
            *shared.fatal.write().unwrap_or_else(PoisonError::into_inner) = Some(failure.clone());
            let _ = input_tx.send(FeedInput::Fatal(failure));
            // Park until shutdown.
            let _ = stop_rx.recv();
            return;
        }

        attempt = attempt.saturating_add(1);
        if attempt >= cfg.max_attempts.max(1) {
            shared.set_health(FeedHealth::Degraded { attempt });
            if !degraded_sent {
                degraded_sent = true;
                warn!(attempts = attempt, error = %failure, "event feed degraded; still retrying");
                let _ = input_tx.send(FeedInput::Degraded {
                    attempts: attempt,
                    last_error: failure.to_string(),
                });
            }
        } else {
            shared.set_health(FeedHealth::Reconnecting { attempt });
        }

        let delay = backoff.delay(attempt, &mut rng);
        warn!(attempt, delay_ms = duration_ms(delay), error = %failure, "event feed connection lost; reconnecting");
        match stop_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn pump(
    mut conn: Box<dyn FeedConnection>,
    epoch: u64,
    cfg: &SubscriberConfig,
    input_tx: &Sender<FeedInput>,
    stop_rx: &Receiver<()>,
) -> PumpExit {
    let mut last_activity = Instant::now();
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        if stop_requested(stop_rx) {
            return PumpExit::Stopped;
        }

        match conn.next_message(cfg.poll_interval()) {
            Ok(Some(msg)) => {
                last_activity = Instant::now();
                ping_sent_at = None;
                if let FeedMessage::StateChanged(event) = msg {
                    if input_tx.send(FeedInput::Message { epoch, event }).is_err() {
                        return PumpExit::Stopped;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => return PumpExit::Lost(err),
        }

        let now = Instant::now();
        match ping_sent_at {
            Some(sent) if now.duration_since(sent) >= cfg.pong_timeout() => {
                return PumpExit::Lost(ControlPlaneError::connection("liveness ping unanswered"));
            }
            Some(_) => {}
            None if now.duration_since(last_activity) >= cfg.ping_interval() => {
                if let Err(err) = conn.ping() {
                    return PumpExit::Lost(err);
                }
                ping_sent_at = Some(now);
            }
            None => {}
        }
    }
}

#[derive(Debug)]
struct Listener {
    filter: EntityFilter,
    tx: Sender<FeedSignal>,
}

struct Fanout {
    control: Arc<dyn ControlPlane>,
    shared: Arc<Shared>,
    diagnostics_tx: Sender<EventEnvelope>,
    listeners: HashMap<SubscriptionId, Listener>,
    epoch: u64,
    last_seq: u64,
    fatal: Option<ControlPlaneError>,
}

impl Fanout {
    fn run(mut self, control_rx: &Receiver<ControlMsg>, input_rx: &Receiver<FeedInput>) {
        let mut control_closed = false;
        let mut input_closed = false;

        loop {
            select! {
                recv(control_rx) -> msg => match msg {
                    Ok(msg) => self.on_control(msg),
                    Err(_) => control_closed = true,
                },
                recv(input_rx) -> msg => match msg {
                    Ok(input) => self.on_input(input),
                    Err(_) => input_closed = true,
                },
            }

            // The feed thread is gone only at shutdown.
            if input_closed || control_closed {
                break;
            }
        }

        debug!(listeners = self.listeners.len(), "fan-out worker stopped");
    }

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Register {
                subscription_id,
                filter,
                tx,
                reply,
            } => {
                if let Some(err) = &self.fatal {
                    let _ = reply.send(Err(err.clone().into()));
                    return;
                }
                self.prime(&filter);
                let initial = self.shared.cache.snapshot(filter.named());
                self.listeners.insert(subscription_id, Listener { filter, tx });
                let _ = reply.send(Ok(initial));
            }
            ControlMsg::Unregister { subscription_id } => {
                self.listeners.remove(&subscription_id);
            }
        }
    }

    fn on_input(&mut self, input: FeedInput) {
        match input {
            FeedInput::Connected { epoch } => {
                let reconnect = self.epoch > 0;
                self.epoch = epoch;
                self.last_seq = 0;
                if reconnect {
                    self.broadcast(&FeedSignal::Recovered { connection_epoch: epoch });
                }
                self.resync();
            }
            FeedInput::Message { epoch, event } => {
                if epoch != self.epoch {
                    return;
                }
                if event.sequence <= self.last_seq {
                    debug!(
                        epoch,
                        sequence = event.sequence,
                        last = self.last_seq,
                        "discarding stale or duplicate event"
                    );
                    return;
                }

                let expected = self.last_seq + 1;
                let gap = event.sequence > expected;
                self.last_seq = event.sequence;

                if gap {
                    warn!(epoch, expected, received = event.sequence, "event sequence gap");
                    self.broadcast(&FeedSignal::SequenceGap {
                        connection_epoch: epoch,
                        expected,
                        received: event.sequence,
                    });
                }

                self.deliver(EventEnvelope {
                    entity_id: event.entity_id,
                    state: event.new_state,
                    observed_at: event.fired_at,
                    connection_epoch: epoch,
                    sequence: event.sequence,
                    origin: EnvelopeOrigin::Live,
                });

                if gap {
                    self.resync();
                }
            }
            FeedInput::Degraded { attempts, last_error } => {
                self.broadcast(&FeedSignal::Degraded { attempts, last_error });
            }
            FeedInput::Fatal(error) => {
                self.fatal = Some(error.clone());
                self.broadcast(&FeedSignal::Fatal { error });
            }
        }
    }

    /// Reads named entities the cache has never seen, so a device already in
    /// the requested state (which emits no event) still has an initial state.
    fn prime(&mut self, filter: &EntityFilter) {
        let missing: Vec<EntityId> = filter
            .named()
            .filter(|id| self.shared.cache.get(id).is_none())
            .cloned()
            .collect();
        for entity_id in missing {
            match self.control.get_state(&entity_id) {
                Ok(Some(state)) => self.shared.cache.put(&entity_id, &state),
                Ok(None) => {}
                Err(err) => debug!(entity = %entity_id, error = %err, "priming read failed"),
            }
        }
    }

    /// One-shot reads for every entity an open listener names, delivered as
    /// resync envelopes through the normal path.
    fn resync(&mut self) {
        let targets: BTreeSet<EntityId> = self
            .listeners
            .values()
            .flat_map(|l| l.filter.named().cloned())
            .collect();
        if targets.is_empty() {
            return;
        }
        debug!(epoch = self.epoch, entities = targets.len(), "resyncing listened entities");

        for entity_id in targets {
            match self.control.get_state(&entity_id) {
                Ok(Some(state)) => self.deliver(EventEnvelope {
                    entity_id,
                    state,
                    observed_at: Utc::now(),
                    connection_epoch: self.epoch,
                    sequence: self.last_seq,
                    origin: EnvelopeOrigin::Resync,
                }),
                Ok(None) => debug!(entity = %entity_id, "resync: entity does not exist"),
                Err(err) => warn!(entity = %entity_id, error = %err, "resync read failed"),
            }
        }
    }

    fn deliver(&mut self, envelope: EventEnvelope) {
        self.shared.cache.put(&envelope.entity_id, &envelope.state);

        match self.diagnostics_tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped_diagnostics.fetch_add(1, Ordering::Relaxed);
            }
        }

        let signal = FeedSignal::Event(envelope);
        self.broadcast(&signal);
    }

    fn broadcast(&mut self, signal: &FeedSignal) {
        self.listeners
            .retain(|_, l| !signal.is_for(&l.filter) || l.tx.send(signal.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::memory::SimulatedHome;
    use std::time::Duration;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    fn fast_cfg() -> SubscriberConfig {
        SubscriberConfig {
            backoff_base_ms: 5,
            max_backoff_ms: 20,
            poll_interval_ms: 5,
            ..SubscriberConfig::default()
        }
    }

    fn start(home: &SimulatedHome) -> EventSubscriber {
        let sub = EventSubscriber::start(Arc::new(home.clone()), Arc::new(home.clone()), fast_cfg());
        let deadline = Instant::now() + Duration::from_secs(2);
        while !sub.health().is_live() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        sub
    }

    fn next_live(s: &Subscription) -> EventEnvelope {
        loop {
            if let FeedSignal::Event(env) = s.recv_timeout(Duration::from_secs(2)).unwrap() {
                if env.origin == EnvelopeOrigin::Live {
                    return env;
                }
            }
        }
    }

    #[test]
    fn delivers_live_events_in_order() {
        let home = SimulatedHome::new().with_entity(&id("light.a"), EntityState::new("off"));
        let sub = start(&home);
        let s = sub.subscribe(EntityFilter::entities([id("light.a")])).unwrap();
        home.set_state(&id("light.a"), EntityState::new("on"));
        home.set_state(&id("light.a"), EntityState::new("off"));

        let first = next_live(&s);
        let second = next_live(&s);
        assert_eq!(first.state.state, "on");
        assert_eq!(second.state.state, "off");
        assert!(first.sequence < second.sequence);
        assert_eq!(first.origin, EnvelopeOrigin::Live);
        assert_eq!(sub.cached_state(&id("light.a")).unwrap().state, "off");
    }

    #[test]
    fn registration_returns_cached_state() {
        let home = SimulatedHome::new().with_entity(&id("switch.b"), EntityState::new("off"));
        let sub = start(&home);
        let watcher = sub.subscribe(EntityFilter::All).unwrap();
        home.set_state(&id("switch.b"), EntityState::new("on"));
        next_live(&watcher);

        let s = sub.subscribe(EntityFilter::entities([id("switch.b")])).unwrap();
        assert_eq!(s.initial_states().len(), 1);
        assert_eq!(s.initial_states()[0].1.state, "on");
    }

    #[test]
    fn unsubscribed_listener_stops_receiving() {
        let home = SimulatedHome::new().with_entity(&id("light.a"), EntityState::new("off"));
        let sub = start(&home);
        let s = sub.subscribe(EntityFilter::All).unwrap();
        s.unsubscribe();
        // Let the fan-out process the unregistration.
        let marker = sub.subscribe(EntityFilter::All).unwrap();
        home.set_state(&id("light.a"), EntityState::new("on"));
        next_live(&marker);
        assert!(s.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn shutdown_disconnects_streams() {
        let home = SimulatedHome::new();
        let sub = start(&home);
        let s = sub.subscribe(EntityFilter::All).unwrap();
        sub.shutdown();
        assert!(s.recv_timeout(Duration::from_secs(1)).is_err());
        assert!(sub.subscribe(EntityFilter::All).is_err());
    }

    #[test]
    fn dropped_callback_unregisters_through_a_full_queue() {
        let (control_tx, control_rx) = bounded(1);
        control_tx
            .send(ControlMsg::Unregister {
                subscription_id: SubscriptionId::new(),
            })
            .unwrap();
        let handle = CallbackHandle {
            id: SubscriptionId::new(),
            control_tx,
            join: None,
        };
        let expected = handle.subscription_id();

        let dropper = thread::spawn(move || drop(handle));
        let unregistered: Vec<SubscriptionId> = (0..2)
            .map(|_| match control_rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                ControlMsg::Unregister { subscription_id } => subscription_id,
                other => panic!("unexpected control message: {other:?}"),
            })
            .collect();
        dropper.join().unwrap();

        assert_eq!(unregistered[1], expected);
    }
}
