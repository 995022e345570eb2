//! Connection to a single Hue bridge.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde_json::{Map, Value, json};

use crate::callbacks::{CallbackId, Callbacks, lock};
use crate::coalescer::{Coalescer, Completion, WriteSink};
use crate::config::BridgeConfig;
use crate::description::BridgeDescription;
use crate::errors::Error;
use crate::group::Group;
use crate::history::RequestHistory;
use crate::light::Light;
use crate::request_queue::RequestQueue;
use crate::response::{check_json, success_value};
use crate::runtime::{self, BoxFuture, TaskHandle};
use crate::scene::Scene;
use crate::target::{Flushable, Lightset, TargetWrite};
use crate::transport::Transport;

type Result<T> = std::result::Result<T, Error>;

/// A Hue bridge on the local network.
///
/// A `Bridge` moves through `unverified → verified → registered`:
/// [`Bridge::verify`] checks that the device really is a Hue bridge,
/// [`Bridge::register`] (or [`Bridge::set_username`]) provides a credential,
/// and the first successful [`Bridge::refresh`] marks it registered. A
/// refresh rejected as unauthorized drops it back to verified.
///
/// All requests go through the bridge's [`RequestQueue`]; changes to its
/// lights, groups and scenes go through its [`Coalescer`].
///
/// Cloning is cheap; clones refer to the same connection.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use hue_bridge_rs::{Bridge, BridgeConfig, Lightset, ReqwestTransport};
///
/// let transport = Arc::new(ReqwestTransport::new()?);
/// let bridge = Bridge::new("192.168.1.20", "00178810ab2c", transport, BridgeConfig::default());
/// if bridge.verify().await? {
///     bridge.set_username(Some("my-username"));
///     bridge.refresh().await?;
///     for light in bridge.lights().values() {
///         light.turn_on();
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    serial: String,
    queue: RequestQueue,
    coalescer: Coalescer,
    state: Mutex<BridgeState>,
    update_callbacks: Callbacks<Result<bool>>,
    bridge_callbacks: Callbacks<(Bridge, bool)>,
    subscription: Mutex<Option<TaskHandle>>,
}

#[derive(Default)]
struct BridgeState {
    addr: String,
    verified: bool,
    registered: bool,
    username: Option<String>,
    description: Option<BridgeDescription>,
    lights: BTreeMap<u32, Arc<Light>>,
    groups: BTreeMap<u32, Arc<Group>>,
    scenes: BTreeMap<String, Arc<Scene>>,
}

/// Sends coalesced writes through the owning bridge.
struct BridgeSink {
    bridge: Weak<BridgeInner>,
}

impl WriteSink for BridgeSink {
    fn write(&self, write: TargetWrite) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let inner = self.bridge.upgrade().ok_or(Error::Cancelled)?;
            let bridge = Bridge { inner };
            bridge.api_put(&write.path, &write.body, write.category).await
        })
    }

    fn read(&self, path: String, category: &'static str) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let inner = self.bridge.upgrade().ok_or(Error::Cancelled)?;
            Bridge { inner }.api_get(&path, category).await
        })
    }
}

impl Bridge {
    pub fn new(
        addr: &str,
        serial: &str,
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|me: &Weak<BridgeInner>| {
            let sink = Arc::new(BridgeSink { bridge: me.clone() });
            BridgeInner {
                serial: serial.to_ascii_lowercase(),
                queue: RequestQueue::new(addr, transport, &config),
                coalescer: Coalescer::new(sink, config.flush_interval),
                state: Mutex::new(BridgeState {
                    addr: addr.to_string(),
                    ..BridgeState::default()
                }),
                update_callbacks: Callbacks::new("bridge update"),
                bridge_callbacks: Callbacks::new("bridge availability"),
                subscription: Mutex::new(None),
            }
        });
        Bridge { inner }
    }

    /// Lower-cased hardware serial number.
    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub fn addr(&self) -> String {
        lock(&self.inner.state).addr.clone()
    }

    /// Point the connection at a new address.
    ///
    /// The bridge must be verified again before it is trusted at the new
    /// address.
    pub fn set_addr(&self, addr: &str) {
        let mut st = lock(&self.inner.state);
        if st.addr != addr {
            debug!("Bridge {} moved from {} to {addr}", self.inner.serial, st.addr);
            st.addr = addr.to_string();
            st.verified = false;
            self.inner.queue.set_host(addr);
        }
    }

    pub fn username(&self) -> Option<String> {
        lock(&self.inner.state).username.clone()
    }

    /// Use `username` as the credential for API calls.
    ///
    /// Changing it clears the registered flag until the next successful
    /// refresh.
    pub fn set_username(&self, username: Option<&str>) {
        let changed = {
            let mut st = lock(&self.inner.state);
            if st.username.as_deref() == username {
                false
            } else {
                st.username = username.map(String::from);
                true
            }
        };
        if changed {
            self.set_registered(false);
        }
    }

    /// Friendly name from the bridge's description.
    pub fn name(&self) -> Option<String> {
        lock(&self.inner.state)
            .description
            .as_ref()
            .map(|d| d.friendly_name.clone())
    }

    /// Model name from the bridge's description.
    pub fn model(&self) -> Option<String> {
        lock(&self.inner.state)
            .description
            .as_ref()
            .map(|d| d.model_name.clone())
    }

    pub fn is_verified(&self) -> bool {
        lock(&self.inner.state).verified
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner.state).registered
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.subscription)
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn coalescer(&self) -> &Coalescer {
        &self.inner.coalescer
    }

    /// Queue a light, group or scene for the next coalescer flush.
    pub fn add_target(&self, target: Arc<dyn Flushable>, on_complete: Option<Completion>) {
        self.inner.coalescer.add_target(target, on_complete);
    }

    /// A copy of the bridge's request history.
    pub fn history(&self) -> RequestHistory {
        self.inner.queue.history()
    }

    /// Snapshot of the lights known after the last refresh.
    pub fn lights(&self) -> BTreeMap<u32, Arc<Light>> {
        lock(&self.inner.state).lights.clone()
    }

    /// Snapshot of the groups, including group 0 (all lights) once known.
    pub fn groups(&self) -> BTreeMap<u32, Arc<Group>> {
        lock(&self.inner.state).groups.clone()
    }

    pub fn scenes(&self) -> BTreeMap<String, Arc<Scene>> {
        lock(&self.inner.state).scenes.clone()
    }

    pub fn light(&self, id: u32) -> Option<Arc<Light>> {
        lock(&self.inner.state).lights.get(&id).cloned()
    }

    pub fn group(&self, id: u32) -> Option<Arc<Group>> {
        lock(&self.inner.state).groups.get(&id).cloned()
    }

    pub fn scene(&self, id: &str) -> Option<Arc<Scene>> {
        lock(&self.inner.state).scenes.get(id).cloned()
    }

    /// Find a scene by id, or else by case-insensitive name.
    pub fn find_scene(&self, name_or_id: &str) -> Option<Arc<Scene>> {
        let st = lock(&self.inner.state);
        st.scenes.get(name_or_id).cloned().or_else(|| {
            st.scenes
                .values()
                .find(|scene| scene.name().eq_ignore_ascii_case(name_or_id))
                .cloned()
        })
    }

    /// The lights of `group` known to this bridge, in id order.
    ///
    /// Members the bridge has not reported yet are skipped.
    pub fn group_lights(&self, group: &Group) -> Vec<Arc<Light>> {
        self.lights_by_id(&group.light_ids())
    }

    /// The lights `scene` applies to, in id order.
    pub fn scene_lights(&self, scene: &Scene) -> Vec<Arc<Light>> {
        self.lights_by_id(&scene.light_ids())
    }

    fn lights_by_id(&self, ids: &[u32]) -> Vec<Arc<Light>> {
        let st = lock(&self.inner.state);
        ids.iter().filter_map(|id| st.lights.get(id).cloned()).collect()
    }

    /// Call `callback` with the outcome of every refresh.
    ///
    /// `Ok(true)` means lights, groups or scenes were added or removed.
    pub fn add_update_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Result<bool>) + Send + Sync + 'static,
    {
        self.inner.update_callbacks.add(callback)
    }

    pub fn remove_update_callback(&self, id: CallbackId) -> bool {
        self.inner.update_callbacks.remove(id)
    }

    /// Call `callback` whenever the bridge becomes registered (`true`) or
    /// loses its registration (`false`).
    pub fn add_bridge_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Bridge, bool) + Send + Sync + 'static,
    {
        self.inner
            .bridge_callbacks
            .add(move |(bridge, available): &(Bridge, bool)| callback(bridge, *available))
    }

    pub fn remove_bridge_callback(&self, id: CallbackId) -> bool {
        self.inner.bridge_callbacks.remove(id)
    }

    /// Check that the device at this address is the Hue bridge we expect.
    ///
    /// Returns immediately once verified. A device that answers but is not
    /// a Hue bridge, or describes a different serial, yields `Ok(false)`.
    pub async fn verify(&self) -> Result<bool> {
        if self.is_verified() {
            return Ok(true);
        }

        let response = self.inner.queue.get("/description.xml", Some("info")).await?;
        if response.status != 200 {
            debug!("Bridge {}: description.xml returned {}", self.inner.serial, response.status);
            return Ok(false);
        }

        let description = BridgeDescription::from_xml(&response.body)?;
        if !description.is_hue_bridge() {
            debug!("{} is a {}, not a Hue bridge", self.addr(), description.model_name);
            return Ok(false);
        }
        if let Some(serial) = description.serial() {
            if serial != self.inner.serial {
                warn!(
                    "Device at {} has serial {serial}, expected {}",
                    self.addr(),
                    self.inner.serial
                );
                return Ok(false);
            }
        }

        info!("Verified Hue bridge {} ({})", self.inner.serial, description.friendly_name);
        let mut st = lock(&self.inner.state);
        st.description = Some(description);
        st.verified = true;
        Ok(true)
    }

    /// Ask the bridge for a new credential.
    ///
    /// The bridge's link button must have been pressed shortly before. The
    /// new username is stored and returned; the bridge counts as registered
    /// after the next successful refresh.
    pub async fn register(&self, device_label: &str) -> Result<String> {
        {
            let st = lock(&self.inner.state);
            if !st.verified {
                return Err(Error::NotVerified(self.inner.serial.clone()));
            }
            if st.registered {
                if let Some(username) = &st.username {
                    return Ok(username.clone());
                }
            }
        }

        let body = serde_json::to_string(&json!({"devicetype": device_label}))
            .map_err(Error::json_dump)?;
        let response = self
            .inner
            .queue
            .post("/api", body, Some("registration"))
            .await?;
        let value = check_json(&response)?;
        let username = success_value(&value, "username")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedResponse(format!("no username in {value}")))?
            .to_string();

        info!("Registered with bridge {}", self.inner.serial);
        lock(&self.inner.state).username = Some(username.clone());
        Ok(username)
    }

    /// Revoke a credential, by default this connection's own.
    pub async fn unregister(&self, username: Option<&str>) -> Result<()> {
        let own = self
            .username()
            .ok_or_else(|| Error::NotRegistered("no username set".into()))?;
        let target = username.unwrap_or(&own).to_string();

        let response = self
            .inner
            .queue
            .delete(
                &format!("/api/{own}/config/whitelist/{target}"),
                Some("registration"),
            )
            .await?;
        check_json(&response)?;

        if target == own {
            lock(&self.inner.state).username = None;
            self.set_registered(false);
        }
        Ok(())
    }

    /// Fetch all lights, groups and scenes.
    ///
    /// Returns whether anything was added or removed. Entities present
    /// before and after keep their identity, and their unsent changes. Every
    /// update callback sees the outcome.
    pub async fn refresh(&self) -> Result<bool> {
        let result = self.refresh_inner().await;
        match &result {
            Ok(changed) => trace!("Bridge {} refreshed, changed: {changed}", self.inner.serial),
            Err(e) => debug!("Bridge {} refresh failed: {e}", self.inner.serial),
        }
        self.inner.update_callbacks.notify(&result);
        result
    }

    async fn refresh_inner(&self) -> Result<bool> {
        let full = self.api_get("", "info").await?;
        let Value::Object(mut full) = full else {
            return Err(Error::MalformedResponse(
                "full state must be an object".into(),
            ));
        };

        let lights = numeric_entries(section(&mut full, "lights"));
        let groups = numeric_entries(section(&mut full, "groups"));
        let scenes: Vec<(String, Value)> = section(&mut full, "scenes").into_iter().collect();

        let coalescer = &self.inner.coalescer;
        let (changed, need_all_group) = {
            let mut st = lock(&self.inner.state);

            let (lights, lights_changed) = reconcile(
                &st.lights,
                lights,
                |id, info| Light::new(*id, info, coalescer.clone()),
                |light, info| {
                    if let Err(e) = light.core().handle_json(info) {
                        warn!("Light {}: {e}", light.core().id());
                    }
                },
            );

            let mut current_groups = st.groups.clone();
            let all_group = current_groups.remove(&0);
            let (mut groups, groups_changed) = reconcile(
                &current_groups,
                groups.into_iter().filter(|(id, _)| *id != 0).collect(),
                |id, info| Group::new(*id, info, coalescer.clone()),
                |group, info| {
                    if let Err(e) = group.core().handle_json(info) {
                        warn!("Group {}: {e}", group.core().id());
                    }
                },
            );
            if let Some(all_group) = all_group {
                groups.insert(0, all_group);
            }

            let (scenes, scenes_changed) = reconcile(
                &st.scenes,
                scenes,
                |id, info| Scene::new(id, info, coalescer.clone()),
                |scene, info| scene.handle_json(info),
            );

            st.lights = lights;
            st.groups = groups;
            st.scenes = scenes;
            (
                lights_changed || groups_changed || scenes_changed,
                !st.groups.contains_key(&0),
            )
        };

        if need_all_group {
            let info = self.api_get("/groups/0", "groups").await?;
            let mut st = lock(&self.inner.state);
            match st.groups.get(&0) {
                Some(group) => group.core().handle_json(info)?,
                None => {
                    st.groups.insert(0, Group::new(0, info, coalescer.clone()));
                }
            }
        }

        self.set_registered(true);
        Ok(changed)
    }

    /// Refresh now and then every `interval` until [`Bridge::unsubscribe`].
    ///
    /// Does nothing if already subscribed.
    pub fn subscribe(&self, interval: Duration) {
        let mut subscription = lock(&self.inner.subscription);
        if subscription.as_ref().is_some_and(|h| !h.is_cancelled()) {
            return;
        }

        debug!("Subscribing to bridge {} every {interval:?}", self.inner.serial);
        let weak = Arc::downgrade(&self.inner);
        *subscription = Some(runtime::spawn_task(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // errors reach the update callbacks
                let _ = Bridge { inner }.refresh().await;
                runtime::sleep(interval).await;
            }
        }));
    }

    /// Stop the periodic refresh. Safe to call when not subscribed.
    pub fn unsubscribe(&self) {
        if let Some(handle) = lock(&self.inner.subscription).take() {
            debug!("Unsubscribing from bridge {}", self.inner.serial);
            handle.cancel();
        }
    }

    /// GET `/api/<username><path>` and parse the result.
    pub async fn api_get(&self, path: &str, category: &str) -> Result<Value> {
        let full = self.api_path(path)?;
        let response = self.inner.queue.get(&full, Some(category)).await?;
        self.check_api(&response)
    }

    /// PUT `body` to `/api/<username><path>` and parse the result.
    pub async fn api_put(&self, path: &str, body: &Value, category: &str) -> Result<Value> {
        let full = self.api_path(path)?;
        let body = serde_json::to_string(body).map_err(Error::json_dump)?;
        let response = self.inner.queue.put(&full, body, Some(category)).await?;
        self.check_api(&response)
    }

    fn api_path(&self, path: &str) -> Result<String> {
        let username = self
            .username()
            .ok_or_else(|| Error::NotRegistered("no username set".into()))?;
        Ok(format!("/api/{username}{path}"))
    }

    fn check_api(&self, response: &crate::transport::HttpResponse) -> Result<Value> {
        let result = check_json(response);
        if let Err(e) = &result {
            if e.is_unauthorized() {
                warn!("Bridge {} rejected our username: {e}", self.inner.serial);
                self.set_registered(false);
            }
        }
        result
    }

    fn set_registered(&self, registered: bool) {
        let flipped = {
            let mut st = lock(&self.inner.state);
            let flipped = st.registered != registered;
            st.registered = registered;
            flipped
        };
        if flipped {
            self.inner.bridge_callbacks.notify(&(self.clone(), registered));
        }
    }
}

fn section(full: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match full.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn numeric_entries(map: Map<String, Value>) -> Vec<(u32, Value)> {
    map.into_iter()
        .filter_map(|(id, info)| match id.parse() {
            Ok(id) => Some((id, info)),
            Err(_) => {
                trace!("Skipping entry with non-numeric id {id}");
                None
            }
        })
        .collect()
}

/// Build the next snapshot of one collection, reusing entities that already
/// exist. The flag is set if any id was added or removed.
fn reconcile<K, T>(
    current: &BTreeMap<K, Arc<T>>,
    fresh: Vec<(K, Value)>,
    create: impl Fn(&K, Value) -> Arc<T>,
    update: impl Fn(&T, Value),
) -> (BTreeMap<K, Arc<T>>, bool)
where
    K: Ord,
{
    let mut changed = false;
    let mut next = BTreeMap::new();
    for (id, info) in fresh {
        let entity = match current.get(&id) {
            Some(existing) => {
                update(existing, info);
                Arc::clone(existing)
            }
            None => {
                changed = true;
                create(&id, info)
            }
        };
        next.insert(id, entity);
    }
    let changed = changed || next.len() != current.len();
    (next, changed)
}

impl PartialEq for Bridge {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Bridge {}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("Bridge")
            .field("serial", &self.inner.serial)
            .field("addr", &st.addr)
            .field("verified", &st.verified)
            .field("registered", &st.registered)
            .finish()
    }
}

impl std::fmt::Display for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Hue bridge {} ({name}) at {}", self.inner.serial, self.addr()),
            None => write!(f, "Hue bridge {} at {}", self.inner.serial, self.addr()),
        }
    }
}
