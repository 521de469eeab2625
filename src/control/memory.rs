use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{Map, Value};

use crate::entity::{EntityId, EntityState};
use crate::error::ControlPlaneError;
use crate::subscriber::EntityFilter;

use super::{CallAck, ControlPlane, EventFeed, FeedConnection, FeedMessage, RawEvent, ServiceCall};

#[derive(Debug)]
struct ConnectionSlot {
    id: u64,
    tx: Sender<FeedMessage>,
    seq: u64,
    filter: Option<EntityFilter>,
}

#[derive(Debug)]
struct HomeState {
    entities: BTreeMap<EntityId, EntityState>,
    connections: Vec<ConnectionSlot>,
    next_connection_id: u64,
    auto_apply: bool,
    emit_events: bool,
    apply_delay: Option<Duration>,
    auth_rejected: bool,
    network_down: bool,
    answer_pings: bool,
    rejected: BTreeSet<EntityId>,
    pending_skip: u64,
    calls: Vec<ServiceCall>,
    connects: u64,
    pings: u64,
}

impl Default for HomeState {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            connections: Vec::new(),
            next_connection_id: 0,
            auto_apply: true,
            emit_events: true,
            apply_delay: None,
            auth_rejected: false,
            network_down: false,
            answer_pings: true,
            rejected: BTreeSet::new(),
            pending_skip: 0,
            calls: Vec::new(),
            connects: 0,
            pings: 0,
        }
    }
}

impl HomeState {
    fn store(&mut self, entity_id: EntityId, mut state: EntityState) {
        state.last_changed = Utc::now();
        if self.emit_events {
            let skip = std::mem::take(&mut self.pending_skip);
            for slot in &mut self.connections {
                if slot.filter.as_ref().is_some_and(|f| f.matches(&entity_id)) {
                    slot.seq += 1 + skip;
                    let _ = slot.tx.send(FeedMessage::StateChanged(RawEvent {
                        entity_id: entity_id.clone(),
                        new_state: state.clone(),
                        sequence: slot.seq,
                        fired_at: state.last_changed,
                    }));
                }
            }
        }
        self.entities.insert(entity_id, state);
    }
}

/// An in-process smart home.
///
/// Implements both [`ControlPlane`] and [`EventFeed`]. Service calls mutate
/// entity state the way a real hub would (when auto-apply is on) and every
/// change is pushed to subscribed feed connections with per-connection sequence
/// numbers. Failure modes (network loss, auth rejection, lost events, refused
/// calls, unanswered pings) can be switched on at runtime.
///
/// Clones share the same home.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHome {
    inner: Arc<Mutex<HomeState>>,
}

impl SimulatedHome {
    /// Creates an empty home.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HomeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builder-style entity insertion. Does not emit an event.
    #[must_use]
    pub fn with_entity(self, entity_id: &EntityId, state: EntityState) -> Self {
        self.insert(entity_id, state);
        self
    }

    /// Inserts or replaces an entity without emitting an event.
    pub fn insert(&self, entity_id: &EntityId, state: EntityState) {
        self.lock().entities.insert(entity_id.clone(), state);
    }

    /// Changes an entity's state as if the device reported it.
    pub fn set_state(&self, entity_id: &EntityId, state: EntityState) {
        self.lock().store(entity_id.clone(), state);
    }

    /// Current state of an entity.
    #[must_use]
    pub fn state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.lock().entities.get(entity_id).cloned()
    }

    /// When off, calls are acknowledged but devices do not change.
    pub fn set_auto_apply(&self, enabled: bool) {
        self.lock().auto_apply = enabled;
    }

    /// When off, state changes are not pushed to the feed.
    pub fn set_emit_events(&self, enabled: bool) {
        self.lock().emit_events = enabled;
    }

    /// Applies accepted calls after `delay` on a background thread.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        self.lock().apply_delay = delay;
    }

    /// Refuses new connections with a transient error while set.
    pub fn set_network_down(&self, down: bool) {
        let mut home = self.lock();
        home.network_down = down;
        if down {
            home.connections.clear();
        }
    }

    /// Closes every open feed connection.
    pub fn drop_connections(&self) {
        self.lock().connections.clear();
    }

    /// Rejects credentials on connect and on service calls while set.
    pub fn set_auth_rejected(&self, rejected: bool) {
        self.lock().auth_rejected = rejected;
    }

    /// When off, pings go unanswered.
    pub fn set_answer_pings(&self, answer: bool) {
        self.lock().answer_pings = answer;
    }

    /// Refuses every call that targets `entity_id`.
    pub fn reject_entity(&self, entity_id: &EntityId) {
        self.lock().rejected.insert(entity_id.clone());
    }

    /// The next emitted event on each connection skips `count` sequence numbers.
    pub fn skip_sequence(&self, count: u64) {
        self.lock().pending_skip += count;
    }

    /// Calls received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.lock().calls.clone()
    }

    /// Open feed connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    /// Pings received so far.
    #[must_use]
    pub fn ping_count(&self) -> u64 {
        self.lock().pings
    }

    fn apply_later(&self, updates: Vec<(EntityId, EntityState)>, delay: Duration) {
        let home = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let mut state = home.lock();
            for (id, s) in updates {
                state.store(id, s);
            }
        });
    }
}

impl ControlPlane for SimulatedHome {
    fn call_service(&self, call: &ServiceCall) -> Result<CallAck, ControlPlaneError> {
        let mut home = self.lock();
        if home.network_down {
            return Err(ControlPlaneError::connection("control plane unreachable"));
        }
        if home.auth_rejected {
            return Err(ControlPlaneError::Authentication {
                message: "access token rejected".to_string(),
            });
        }
        home.calls.push(call.clone());

        let mut updates = Vec::with_capacity(call.targets.len());
        for target in &call.targets {
            if home.rejected.contains(target) {
                return Err(ControlPlaneError::Rejected {
                    code: "device_unavailable".to_string(),
                    message: format!("{} refused {}", target, call.label()),
                });
            }
            let Some(current) = home.entities.get(target) else {
                return Err(ControlPlaneError::InvalidTarget {
                    entity_id: target.clone(),
                });
            };
            let next = apply_service(current, &call.domain, &call.service, &call.data).ok_or_else(|| {
                ControlPlaneError::Rejected {
                    code: "service_not_found".to_string(),
                    message: format!("Service {} not found", call.label()),
                }
            })?;
            updates.push((target.clone(), next));
        }

        if home.auto_apply {
            let delay = home.apply_delay;
            match delay {
                Some(delay) => {
                    drop(home);
                    self.apply_later(updates, delay);
                }
                None => {
                    for (id, state) in updates {
                        home.store(id, state);
                    }
                }
            }
        }

        Ok(CallAck::now(Some(uuid::Uuid::new_v4().simple().to_string())))
    }

    fn get_state(&self, entity_id: &EntityId) -> Result<Option<EntityState>, ControlPlaneError> {
        let home = self.lock();
        if home.network_down {
            return Err(ControlPlaneError::connection("control plane unreachable"));
        }
        Ok(home.entities.get(entity_id).cloned())
    }
}

impl EventFeed for SimulatedHome {
    fn connect(&self) -> Result<Box<dyn FeedConnection>, ControlPlaneError> {
        let mut home = self.lock();
        if home.network_down {
            return Err(ControlPlaneError::connection("connection refused"));
        }
        if home.auth_rejected {
            return Err(ControlPlaneError::Authentication {
                message: "access token rejected".to_string(),
            });
        }
        let (tx, rx) = unbounded();
        let id = home.next_connection_id;
        home.next_connection_id += 1;
        home.connects += 1;
        home.connections.push(ConnectionSlot {
            id,
            tx,
            seq: 0,
            filter: None,
        });
        Ok(Box::new(SimConnection {
            id,
            rx,
            home: self.clone(),
        }))
    }
}

struct SimConnection {
    id: u64,
    rx: Receiver<FeedMessage>,
    home: SimulatedHome,
}

impl SimConnection {
    fn with_slot<T>(&self, f: impl FnOnce(&mut HomeState, usize) -> T) -> Result<T, ControlPlaneError> {
        let mut home = self.home.lock();
        let idx = home
            .connections
            .iter()
            .position(|s| s.id == self.id)
            .ok_or_else(|| ControlPlaneError::connection("connection closed"))?;
        Ok(f(&mut home, idx))
    }
}

impl FeedConnection for SimConnection {
    fn subscribe(&mut self, filter: &EntityFilter) -> Result<(), ControlPlaneError> {
        self.with_slot(|home, idx| home.connections[idx].filter = Some(filter.clone()))
    }

    fn ping(&mut self) -> Result<(), ControlPlaneError> {
        self.with_slot(|home, idx| {
            home.pings += 1;
            if home.answer_pings {
                let _ = home.connections[idx].tx.send(FeedMessage::Pong);
            }
        })
    }

    fn next_message(&mut self, timeout: Duration) -> Result<Option<FeedMessage>, ControlPlaneError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ControlPlaneError::connection("connection closed by peer")),
        }
    }
}

/// Computes the state a device would report after a service call, or `None`
/// for services the device does not offer.
fn apply_service(current: &EntityState, domain: &str, service: &str, data: &Map<String, Value>) -> Option<EntityState> {
    let mut next = current.clone();
    let number = |key: &str| data.get(key).and_then(Value::as_f64);

    match (domain, service) {
        ("cover", "open_cover") | ("valve", "open_valve") => {
            next.state = "open".to_string();
            next.attributes.insert("current_position".to_string(), Value::from(100));
        }
        ("cover", "close_cover") | ("valve", "close_valve") => {
            next.state = "closed".to_string();
            next.attributes.insert("current_position".to_string(), Value::from(0));
        }
        ("cover", "set_cover_position") => {
            let pos = number("position")?;
            next.state = if pos > 0.0 { "open" } else { "closed" }.to_string();
            next.attributes.insert("current_position".to_string(), Value::from(pos));
        }
        ("cover", "set_cover_tilt_position") => {
            next.attributes
                .insert("current_tilt_position".to_string(), Value::from(number("tilt_position")?));
        }
        ("lock", "lock") => next.state = "locked".to_string(),
        ("lock", "unlock") => next.state = "unlocked".to_string(),
        ("climate", "set_temperature") => {
            next.attributes
                .insert("temperature".to_string(), Value::from(number("temperature")?));
            if let Some(mode) = data.get("hvac_mode").and_then(Value::as_str) {
                next.state = mode.to_string();
            }
        }
        ("climate", "set_hvac_mode") => next.state = data.get("hvac_mode")?.as_str()?.to_string(),
        ("fan", "set_percentage") => {
            let pct = number("percentage")?;
            next.state = if pct > 0.0 { "on" } else { "off" }.to_string();
            next.attributes.insert("percentage".to_string(), Value::from(pct));
        }
        ("media_player", "volume_set") => {
            next.attributes
                .insert("volume_level".to_string(), Value::from(number("volume_level")?));
        }
        ("input_number" | "number", "set_value") => next.state = number("value")?.to_string(),
        ("input_select" | "select", "select_option") => next.state = data.get("option")?.as_str()?.to_string(),
        ("light", "turn_on")
            if number("brightness_pct")
                .or_else(|| number("brightness"))
                .is_some_and(|v| v.abs() < f64::EPSILON) =>
        {
            next.state = "off".to_string();
            next.attributes.remove("brightness");
        }
        (_, "turn_on") => {
            next.state = "on".to_string();
            if let Some(pct) = number("brightness_pct") {
                next.attributes
                    .insert("brightness".to_string(), Value::from((pct * 255.0 / 100.0).round()));
            } else if let Some(raw) = number("brightness") {
                next.attributes.insert("brightness".to_string(), Value::from(raw));
            }
            if let Some(kelvin) = number("color_temp_kelvin") {
                next.attributes.insert("color_temp_kelvin".to_string(), Value::from(kelvin));
            }
            if let Some(pct) = number("percentage") {
                next.attributes.insert("percentage".to_string(), Value::from(pct));
            }
        }
        (_, "turn_off") => next.state = "off".to_string(),
        (_, "toggle") => {
            next.state = match next.state.as_str() {
                "on" => "off",
                "off" => "on",
                "open" => "closed",
                "closed" => "open",
                other => other,
            }
            .to_string();
        }
        _ => return None,
    }
    Some(next)
}
