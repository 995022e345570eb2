//! Shared state handling for lights and groups.
//!
//! A light's `state` object and a group's `action` object take the same
//! parameters, so both keep their last known info in a [`TargetCore`] and get
//! their setters and getters from the [`Lightset`] trait. Setters update the
//! local copy immediately and remember which parameters changed; the change
//! set is sent to the bridge by the bridge's [`Coalescer`].

use std::collections::BTreeSet;
use std::mem;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use log::{trace, warn};
use serde_json::{Map, Value, json};

use crate::callbacks::lock;
use crate::coalescer::{Coalescer, Completion};
use crate::errors::Error;
use crate::status::LightState;
use crate::types::{Alert, Brightness, ColorMode, Effect, Hue, Mireds, Saturation, Xy};

type Result<T> = std::result::Result<T, Error>;

/// Identifies a write target within one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKey {
    Light(u32),
    Group(u32),
    Scene(String),
}

/// One PUT prepared by a [`Flushable`].
///
/// `path` is relative to the bridge's `/api/<username>` prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetWrite {
    pub path: String,
    pub body: Value,
    pub category: &'static str,
}

/// Something the [`Coalescer`] can write to a bridge.
pub trait Flushable: Send + Sync {
    fn key(&self) -> TargetKey;

    /// Take everything pending and build the request that sends it.
    fn take_write(&self) -> TargetWrite;

    /// Receive the bridge's answer to the last write taken.
    fn complete(&self, outcome: &Result<Value>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Light,
    Group,
}

impl TargetKind {
    pub(crate) fn category(self) -> &'static str {
        match self {
            TargetKind::Light => "lights",
            TargetKind::Group => "groups",
        }
    }

    fn state_key(self) -> &'static str {
        match self {
            TargetKind::Light => "state",
            TargetKind::Group => "action",
        }
    }
}

struct CoreState {
    info: Map<String, Value>,
    changes: BTreeSet<&'static str>,
    // Parameters on the wire right now; restored if the write fails.
    sent: BTreeSet<&'static str>,
    defer: bool,
    transitiontime: Option<u16>,
}

/// Local copy of a light or group plus its unsent changes.
pub struct TargetCore {
    kind: TargetKind,
    id: u32,
    coalescer: Coalescer,
    me: Weak<dyn Flushable>,
    state: Mutex<CoreState>,
}

impl TargetCore {
    pub(crate) fn new(
        kind: TargetKind,
        id: u32,
        info: Value,
        coalescer: Coalescer,
        me: Weak<dyn Flushable>,
    ) -> Self {
        let core = TargetCore {
            kind,
            id,
            coalescer,
            me,
            state: Mutex::new(CoreState {
                info: Map::new(),
                changes: BTreeSet::new(),
                sent: BTreeSet::new(),
                defer: false,
                transitiontime: None,
            }),
        };
        if let Err(e) = core.handle_json(info) {
            warn!("{} {}: {e}", kind.category(), id);
            core.handle_json(json!({})).ok();
        }
        core
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn key(&self) -> TargetKey {
        match self.kind {
            TargetKind::Light => TargetKey::Light(self.id),
            TargetKind::Group => TargetKey::Group(self.id),
        }
    }

    /// Replace the stored info with a fresh copy from the bridge.
    ///
    /// Parameters changed locally but not yet accepted by the bridge keep
    /// their local values.
    pub(crate) fn handle_json(&self, info: Value) -> Result<()> {
        let Value::Object(mut info) = info else {
            return Err(Error::MalformedResponse(format!(
                "{} info must be an object",
                self.kind.category()
            )));
        };
        let state_key = self.kind.state_key();

        if !info.get(state_key).is_some_and(Value::is_object) {
            info.insert(state_key.to_string(), json!({}));
        }
        info.insert("id".to_string(), json!(self.id));

        let mut st = lock(&self.state);
        if let Some(Value::Object(fresh)) = info.get_mut(state_key) {
            // A group has no xy for a short time after creation, white
            // bulbs never do.
            if !fresh.contains_key("xy") {
                fresh.insert("xy".to_string(), json!(Xy::default()));
            }
            let old = st.info.get(state_key);
            for key in st.changes.iter().chain(st.sent.iter()) {
                if let Some(value) = old.and_then(|o| o.get(*key)) {
                    fresh.insert((*key).to_string(), value.clone());
                }
            }
        }
        st.info = info;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Map<String, Value>, &Map<String, Value>) -> T) -> T {
        let st = lock(&self.state);
        let empty = Map::new();
        let state = st
            .info
            .get(self.kind.state_key())
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        f(&st.info, state)
    }

    fn set(&self, params: Vec<(&'static str, Value)>) {
        let defer = {
            let mut st = lock(&self.state);
            let state_key = self.kind.state_key();
            let st = &mut *st;
            if let Some(Value::Object(state)) = st.info.get_mut(state_key) {
                for (key, value) in params {
                    state.insert(key.to_string(), value);
                    st.changes.insert(key);
                }
            }
            st.defer
        };

        if !defer {
            self.schedule(None);
        }
    }

    fn schedule(&self, on_complete: Option<Completion>) {
        match self.me.upgrade() {
            Some(me) => self.coalescer.add_target(me, on_complete),
            None => trace!("{} {} dropped before submit", self.kind.category(), self.id),
        }
    }

    pub(crate) fn take_write(&self) -> TargetWrite {
        let mut st = lock(&self.state);
        let st = &mut *st;
        let empty = Map::new();
        let state = st
            .info
            .get(self.kind.state_key())
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut msg = Map::new();
        let mut copy = |key: &str| {
            if let Some(value) = state.get(key) {
                msg.insert(key.to_string(), value.clone());
            }
        };
        for key in &st.changes {
            match *key {
                "colormode" => match state.get("colormode").and_then(Value::as_str) {
                    Some("hs") => {
                        if st.changes.contains("hue") {
                            copy("hue");
                        }
                        if st.changes.contains("sat") {
                            copy("sat");
                        }
                    }
                    Some("xy") => copy("xy"),
                    Some("ct") => copy("ct"),
                    _ => {}
                },
                "bri" | "on" | "alert" | "effect" => copy(*key),
                _ => {}
            }
        }
        if let Some(time) = st.transitiontime.take() {
            msg.insert("transitiontime".to_string(), json!(time));
        }

        let changes = mem::take(&mut st.changes);
        st.sent.extend(changes);

        TargetWrite {
            path: format!(
                "/{}/{}/{}",
                self.kind.category(),
                self.id,
                self.kind.state_key()
            ),
            body: Value::Object(msg),
            category: self.kind.category(),
        }
    }

    pub(crate) fn complete(&self, outcome: &Result<Value>) {
        let mut st = lock(&self.state);
        let sent = mem::take(&mut st.sent);
        let Err(e) = outcome else {
            return;
        };

        let text = e.to_string();
        if text.contains("invalid value") || text.contains("not available") {
            // The bridge will never take these values; retrying is pointless.
            return;
        }
        let device_off = text.contains("Device is set to off");
        for key in sent {
            if !(device_off && key == "alert") {
                st.changes.insert(key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn coalescer(&self) -> &Coalescer {
        &self.coalescer
    }

    fn has_changes(&self) -> bool {
        let st = lock(&self.state);
        !st.changes.is_empty()
    }
}

fn as_u16(value: Option<&Value>) -> Option<u16> {
    value.and_then(Value::as_u64).and_then(|v| u16::try_from(v).ok())
}

fn as_u8(value: Option<&Value>) -> Option<u8> {
    value.and_then(Value::as_u64).and_then(|v| u8::try_from(v).ok())
}

/// State control shared by [`crate::Light`] and [`crate::Group`].
///
/// Setters change the local copy right away. Unless [`Lightset::defer`] was
/// called they also queue the target with the bridge's coalescer, so several
/// setters called back to back reach the bridge as one request.
///
/// On a multi-threaded runtime the flush may start on another thread while
/// the caller is between setters. Code that blocks or awaits in the middle
/// of a batch should bracket it with [`Lightset::defer`] and
/// [`Lightset::submit`].
///
/// # Example
///
/// ```ignore
/// use hue_bridge_rs::Lightset;
///
/// let light = bridge.light(1).unwrap();
/// light.defer();
/// light.turn_on();
/// light.set_bri(200);
/// light.set_ct(366);
/// light.submit().await?;
/// ```
pub trait Lightset: Flushable {
    fn core(&self) -> &TargetCore;

    fn id(&self) -> u32 {
        self.core().id()
    }

    /// Name reported by the bridge, or `Lightset <id>` if it has none.
    fn name(&self) -> String {
        let id = self.id();
        self.core().read(|info, _| {
            info.get("name")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("Lightset {id}"))
        })
    }

    /// The bridge's `type` string, e.g. "Extended color light".
    fn kind(&self) -> Option<String> {
        self.core()
            .read(|info, _| info.get("type").and_then(Value::as_str).map(String::from))
    }

    /// A copy of the info last received from the bridge, with local changes
    /// applied.
    fn to_value(&self) -> Value {
        self.core().read(|info, _| Value::Object(info.clone()))
    }

    fn is_on(&self) -> bool {
        self.core()
            .read(|_, state| state.get("on").and_then(Value::as_bool).unwrap_or(false))
    }

    fn bri(&self) -> Option<Brightness> {
        self.core()
            .read(|_, state| as_u8(state.get("bri")).map(|value| Brightness { value }))
    }

    fn ct(&self) -> Option<Mireds> {
        self.core()
            .read(|_, state| as_u16(state.get("ct")).map(|value| Mireds { value }))
    }

    fn xy(&self) -> Xy {
        self.core().read(|_, state| {
            state
                .get("xy")
                .and_then(|v| serde_json::from_value::<Xy>(v.clone()).ok())
                .unwrap_or_default()
        })
    }

    fn hue(&self) -> Option<Hue> {
        self.core()
            .read(|_, state| as_u16(state.get("hue")).map(Hue::from_raw))
    }

    fn sat(&self) -> Option<Saturation> {
        self.core()
            .read(|_, state| as_u8(state.get("sat")).map(|value| Saturation { value }))
    }

    fn alert(&self) -> Option<Alert> {
        self.core().read(|_, state| {
            state
                .get("alert")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })
    }

    fn effect(&self) -> Option<Effect> {
        self.core().read(|_, state| {
            state
                .get("effect")
                .and_then(Value::as_str)
                .map(Effect::from_name)
        })
    }

    fn colormode(&self) -> Option<ColorMode> {
        self.core().read(|_, state| {
            state
                .get("colormode")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
        })
    }

    /// Typed snapshot of the current state.
    fn state(&self) -> LightState {
        LightState {
            id: self.id(),
            name: self.name(),
            kind: self.kind(),
            on: self.is_on(),
            bri: self.bri(),
            ct: self.ct(),
            xy: self.xy(),
            hue: self.hue().map(|h| h.degrees()),
            sat: self.sat(),
            colormode: self.colormode(),
            alert: self.alert(),
            effect: self.effect(),
            reachable: self
                .core()
                .read(|_, state| state.get("reachable").and_then(Value::as_bool)),
        }
    }

    fn set_on(&self, on: bool) {
        self.core().set(vec![("on", json!(on))]);
    }

    fn turn_on(&self) {
        self.set_on(true);
    }

    fn turn_off(&self) {
        self.set_on(false);
    }

    /// Set brightness, clamped to `0..=255`. Zero is dim, not off.
    fn set_bri(&self, bri: i64) {
        self.core()
            .set(vec![("bri", json!(Brightness::clamped(bri)))]);
    }

    /// Switch to color temperature mode, clamped to `154..=500` mireds.
    fn set_ct(&self, ct: i64) {
        self.core().set(vec![
            ("ct", json!(Mireds::clamped(ct))),
            ("colormode", json!(ColorMode::Ct)),
        ]);
    }

    /// Switch to xy mode; coordinates are clamped to `0.0..=1.0`.
    fn set_xy(&self, x: f64, y: f64) {
        self.core().set(vec![
            ("xy", json!(Xy::clamped(x, y))),
            ("colormode", json!(ColorMode::Xy)),
        ]);
    }

    fn set_x(&self, x: f64) {
        let y = self.xy().y();
        self.set_xy(x, y);
    }

    fn set_y(&self, y: f64) {
        let x = self.xy().x();
        self.set_xy(x, y);
    }

    /// Switch to hue/saturation mode; `degrees` wraps around the color wheel.
    fn set_hue(&self, degrees: f64) {
        self.core().set(vec![
            ("hue", json!(Hue::from_degrees(degrees))),
            ("colormode", json!(ColorMode::Hs)),
        ]);
    }

    /// Switch to hue/saturation mode, saturation clamped to `0..=255`.
    fn set_sat(&self, sat: i64) {
        self.core().set(vec![
            ("sat", json!(Saturation::clamped(sat))),
            ("colormode", json!(ColorMode::Hs)),
        ]);
    }

    fn set_effect(&self, effect: Effect) {
        self.core().set(vec![("effect", json!(effect))]);
    }

    fn set_alert(&self, alert: Alert) {
        self.core().set(vec![("alert", json!(alert))]);
    }

    /// Flash once, or repeatedly for a while if `repeat` is set.
    fn flash(&self, repeat: bool) {
        self.set_alert(if repeat { Alert::LSelect } else { Alert::Select });
    }

    fn clear_alert(&self) {
        self.set_alert(Alert::None);
    }

    /// Transition time for the next write. Sent in 100ms steps; cleared once
    /// sent. `None` leaves it to the bridge.
    fn set_transition_time(&self, time: Option<Duration>) {
        let steps = time.map(|t| u16::try_from(t.as_millis() / 100).unwrap_or(u16::MAX));
        lock(&self.core().state).transitiontime = steps;
    }

    fn transition_time(&self) -> Option<Duration> {
        lock(&self.core().state)
            .transitiontime
            .map(|steps| Duration::from_millis(u64::from(steps) * 100))
    }

    /// Collect changes locally until [`Lightset::submit`] or
    /// [`Lightset::nodefer`].
    fn defer(&self) {
        lock(&self.core().state).defer = true;
    }

    /// Stop deferring and queue whatever was collected.
    fn nodefer(&self) {
        lock(&self.core().state).defer = false;
        self.core().schedule(None);
    }

    fn is_deferred(&self) -> bool {
        lock(&self.core().state).defer
    }

    /// Whether some parameter changed locally has not been sent yet.
    fn has_pending_changes(&self) -> bool {
        self.core().has_changes()
    }

    /// Fetch this light or group alone and merge it into the local copy.
    ///
    /// Goes through the bridge's request queue under the `lights` or
    /// `groups` category. Unsent local changes keep their values, as with a
    /// full bridge refresh. Returns the info the bridge sent.
    fn update(&self) -> crate::runtime::BoxFuture<'_, Result<Value>> {
        let core = self.core();
        let category = core.kind.category();
        let read = core
            .coalescer
            .read(format!("/{category}/{}", core.id), category);
        Box::pin(async move {
            let info = read.await?;
            core.handle_json(info.clone())?;
            Ok(info)
        })
    }

    /// Queue the collected changes with the coalescer and wait for the
    /// bridge's answer.
    fn submit(&self) -> crate::runtime::BoxFuture<'static, Result<Value>> {
        let core = self.core();
        match core.me.upgrade() {
            Some(me) => core.coalescer.submit(me),
            None => Box::pin(async { Err(Error::Cancelled) }),
        }
    }

    /// Like [`Lightset::submit`], reporting the outcome to `on_complete`.
    fn submit_with<F>(&self, on_complete: F)
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
        Self: Sized,
    {
        self.core().schedule(Some(Box::new(on_complete)));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::coalescer::tests::RecordingSink;
    use crate::light::Light;

    pub(crate) fn light(id: u32, info: Value) -> (Arc<Light>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = Coalescer::new(sink.clone(), Duration::from_millis(20));
        (Light::new(id, info, coalescer), sink)
    }

    fn lamp() -> Value {
        json!({
            "name": "Hue Lamp 1",
            "type": "Extended color light",
            "state": {"on": false, "bri": 10, "hue": 0, "sat": 0, "ct": 300, "colormode": "ct",
                      "alert": "none", "effect": "none", "reachable": true}
        })
    }

    #[test]
    fn test_setters_clamp() {
        let (light, _) = light(1, lamp());
        light.defer();
        light.set_bri(400);
        light.set_ct(20);
        light.set_xy(-1.0, 2.0);
        light.set_sat(-3);

        assert_eq!(light.bri().map(|b| b.value()), Some(255));
        assert_eq!(light.ct().map(|c| c.value()), Some(154));
        assert_eq!(light.xy(), Xy::clamped(0.0, 1.0));
        assert_eq!(light.sat().map(|s| s.value()), Some(0));
        assert_eq!(light.colormode(), Some(ColorMode::Hs));
    }

    #[test]
    fn test_write_follows_color_mode() {
        let (light, _) = light(1, lamp());
        light.defer();
        light.set_ct(400);
        light.set_hue(120.0);
        light.set_bri(50);
        light.set_transition_time(Some(Duration::from_millis(400)));

        let write = light.take_write();
        assert_eq!(write.path, "/lights/1/state");
        assert_eq!(write.category, "lights");
        // ct was overridden by the switch to hs before anything was sent
        assert_eq!(
            write.body,
            json!({"bri": 50, "hue": 21845, "transitiontime": 4})
        );
        assert_eq!(light.transition_time(), None);
    }

    #[test]
    fn test_refresh_keeps_unsent_changes() {
        let (light, _) = light(1, lamp());
        light.defer();
        light.set_bri(200);

        let mut fresh = lamp();
        fresh["state"]["bri"] = json!(10);
        fresh["state"]["on"] = json!(true);
        fresh["name"] = json!("Renamed");
        light.core().handle_json(fresh).unwrap();

        assert_eq!(light.bri().map(|b| b.value()), Some(200));
        assert!(light.is_on());
        assert_eq!(light.name(), "Renamed");
    }

    #[test]
    fn test_failed_write_is_retried_but_invalid_value_is_dropped() {
        let (light, _) = light(1, lamp());
        light.defer();
        light.set_bri(100);
        light.flash(false);

        light.take_write();
        assert!(!light.has_pending_changes());
        light.complete(&Err(Error::api(
            201,
            "/lights/1/state/alert",
            "parameter, alert, is not modifiable. Device is set to off.",
        )));
        // bri is kept for the next write, the alert is pointless while off
        assert_eq!(light.take_write().body, json!({"bri": 100}));

        light.complete(&Err(Error::api(
            7,
            "/lights/1/state/bri",
            "invalid value, 100, for parameter, bri",
        )));
        assert!(!light.has_pending_changes());
    }

    #[tokio::test]
    async fn test_update_keeps_unsent_changes() {
        let (light, sink) = light(1, lamp());
        let mut fresh = lamp();
        fresh["state"]["bri"] = json!(10);
        fresh["state"]["on"] = json!(true);
        fresh["name"] = json!("Renamed");
        *lock(&sink.info) = Some(fresh);

        light.defer();
        light.set_bri(200);
        let info = light.update().await.unwrap();

        assert_eq!(info["name"], "Renamed");
        assert_eq!(*lock(&sink.reads), vec![("/lights/1".to_string(), "lights")]);
        assert_eq!(light.bri().map(|b| b.value()), Some(200));
        assert!(light.is_on());
        assert_eq!(light.name(), "Renamed");
        assert!(light.has_pending_changes());
        assert!(lock(&sink.writes).is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_non_object() {
        let (light, sink) = light(1, lamp());
        *lock(&sink.info) = Some(json!("nope"));
        assert!(matches!(light.update().await, Err(Error::MalformedResponse(_))));
        assert_eq!(light.name(), "Hue Lamp 1");
    }

    #[test]
    fn test_missing_xy_and_name_get_defaults() {
        let (light, _) = light(3, json!({"state": {"on": true}}));
        assert_eq!(light.xy(), Xy::default());
        assert_eq!(light.name(), "Lightset 3");
        assert_eq!(light.state().hue, None);
    }

    #[test]
    fn test_non_object_info_is_rejected() {
        let (light, _) = light(1, lamp());
        assert!(matches!(
            light.core().handle_json(json!([1, 2])),
            Err(Error::MalformedResponse(_))
        ));
        assert_eq!(light.name(), "Hue Lamp 1");
    }
}
