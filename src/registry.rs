//! Periodic bridge discovery and lifecycle management.
//!
//! A [`Registry`] runs SSDP discovery cycles, turns answers into verified
//! [`Bridge`] connections, and keeps a map of the bridges it currently
//! believes in. Bridges leave the map when they stay missing from discovery
//! for too many cycles, or when their refreshes keep failing.
//!
//! One cycle goes like this:
//!
//! 1. `Start` is emitted and an SSDP search is sent.
//! 2. Every answering bridge is verified, given its credential and
//!    refreshed. Each observation resets a quiet-period timer.
//! 3. Once the timer expires, unseen bridges age by one; bridges past their
//!    age limit are removed. `End` is emitted and the next cycle is
//!    scheduled.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::bridge::Bridge;
use crate::callbacks::{CallbackId, Callbacks, lock};
use crate::config::RegistryConfig;
use crate::errors::Error;
use crate::runtime::{self, TaskHandle};
use crate::ssdp::{Discoverer, SsdpResponse};
use crate::transport::Transport;

type Result<T> = std::result::Result<T, Error>;

/// Credentials applied to discovered bridges.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// Leave bridges without a username.
    #[default]
    None,
    /// Use the same username on every bridge.
    Shared(String),
    /// Username per bridge serial.
    PerBridge(HashMap<String, String>),
}

impl Credentials {
    fn for_serial(&self, serial: &str) -> Option<&str> {
        match self {
            Credentials::None => None,
            Credentials::Shared(username) => Some(username.as_str()),
            Credentials::PerBridge(map) => map
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(serial))
                .map(|(_, username)| username.as_str()),
        }
    }
}

/// Notification delivered to discovery subscribers.
#[derive(Debug, Clone)]
pub enum DiscoEvent {
    /// A discovery cycle started.
    Start,
    /// A bridge joined the registry.
    Add(Bridge),
    /// A bridge left the registry.
    Del { bridge: Bridge, reason: String },
    /// A cycle finished; `changed` is set if bridges were added or removed
    /// since the previous `End`.
    End { changed: bool },
}

/// Discovery service tracking every bridge on the network.
///
/// Cloning is cheap; clones share the same state. Independent registries can
/// coexist.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use hue_bridge_rs::{Credentials, DiscoEvent, Registry, RegistryConfig};
///
/// let registry = Registry::with_config(RegistryConfig::default())?;
/// registry.add_disco_callback(|event| {
///     if let DiscoEvent::Add(bridge) = event {
///         println!("found {bridge}");
///     }
/// });
/// registry.start_discovery(Credentials::Shared("my-username".into()), Duration::from_secs(15))?;
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    transport: Arc<dyn Transport>,
    discoverer: Arc<dyn Discoverer>,
    state: Mutex<RegistryState>,
    disco_callbacks: Callbacks<DiscoEvent>,
    bridge_callbacks: Callbacks<(Bridge, bool)>,
}

#[derive(Default)]
struct RegistryState {
    bridges: BTreeMap<String, Tracked>,
    settings: Option<Settings>,
    running: bool,
    changed: bool,
    // Bumped whenever a cycle starts or discovery stops; work started under
    // an older value is stale.
    generation: u64,
    search: Option<TaskHandle>,
    observers: Vec<TaskHandle>,
    quiet_timer: Option<TaskHandle>,
    next_cycle: Option<TaskHandle>,
}

struct Settings {
    credentials: Credentials,
    interval: Duration,
}

struct Tracked {
    bridge: Bridge,
    age: u32,
    errors: u32,
    seen: bool,
    update_callback: CallbackId,
    bridge_callback: CallbackId,
}

impl Tracked {
    fn detach(self) -> Bridge {
        self.bridge.remove_update_callback(self.update_callback);
        self.bridge.remove_bridge_callback(self.bridge_callback);
        self.bridge.unsubscribe();
        self.bridge
    }
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        transport: Arc<dyn Transport>,
        discoverer: Arc<dyn Discoverer>,
    ) -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                config,
                transport,
                discoverer,
                state: Mutex::new(RegistryState::default()),
                disco_callbacks: Callbacks::new("discovery"),
                bridge_callbacks: Callbacks::new("bridge availability"),
            }),
        }
    }

    /// A registry using SSDP multicast and a `reqwest` HTTP client.
    #[cfg(feature = "reqwest-transport")]
    pub fn with_config(config: RegistryConfig) -> Result<Self> {
        let transport = Arc::new(crate::transport::ReqwestTransport::new()?);
        Ok(Self::new(
            config,
            transport,
            Arc::new(crate::ssdp::SsdpDiscoverer),
        ))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Start periodic discovery and run the first cycle right away.
    ///
    /// `interval` is the pause between the end of one cycle and the start of
    /// the next, and must be at least one second.
    pub fn start_discovery(&self, credentials: Credentials, interval: Duration) -> Result<()> {
        if interval < Duration::from_secs(1) {
            return Err(Error::InvalidInterval(interval));
        }
        {
            let mut st = lock(&self.inner.state);
            if st.settings.is_some() || st.running {
                return Err(Error::AlreadyRunning);
            }
            st.settings = Some(Settings {
                credentials,
                interval,
            });
        }
        info!("Starting Hue bridge discovery every {interval:?}");
        self.do_discovery()
    }

    /// Stop discovery and drop every tracked bridge.
    ///
    /// Subscribers get `Del` for each bridge, then `End` if a cycle was
    /// interrupted. Subscriptions stay registered for a later restart.
    pub fn stop_discovery(&self) {
        let (tracked, interrupted) = {
            let mut st = lock(&self.inner.state);
            st.settings = None;
            st.generation += 1;
            for handle in st
                .search
                .take()
                .into_iter()
                .chain(st.quiet_timer.take())
                .chain(st.next_cycle.take())
                .chain(mem::take(&mut st.observers))
            {
                handle.cancel();
            }
            let interrupted = mem::replace(&mut st.running, false);
            st.changed = false;
            (mem::take(&mut st.bridges), interrupted)
        };
        info!("Stopped Hue bridge discovery");

        let had_bridges = !tracked.is_empty();
        for (_, tracked) in tracked {
            let bridge = tracked.detach();
            self.notify(DiscoEvent::Del {
                bridge,
                reason: "discovery stopped".into(),
            });
        }
        if interrupted {
            self.notify(DiscoEvent::End {
                changed: had_bridges,
            });
        }
    }

    /// Run a discovery cycle now instead of waiting for the next one.
    ///
    /// Does nothing while a cycle is running.
    pub fn do_discovery(&self) -> Result<()> {
        let generation = {
            let mut st = lock(&self.inner.state);
            if st.settings.is_none() {
                return Err(Error::DiscoveryNotStarted);
            }
            if st.running {
                return Ok(());
            }
            if let Some(timer) = st.next_cycle.take() {
                timer.cancel();
            }
            st.running = true;
            st.generation += 1;
            st.observers.clear();
            for tracked in st.bridges.values_mut() {
                tracked.seen = false;
            }
            st.generation
        };

        debug!("Discovery cycle {generation} starting");
        self.notify(DiscoEvent::Start);
        self.reset_quiet_timer(generation, self.inner.config.initial_quiet_period);

        let registry = self.clone();
        let search = runtime::spawn_task(async move {
            let config = &registry.inner.config;
            let observer = registry.clone();
            let result = registry
                .inner
                .discoverer
                .discover(
                    &config.service_type,
                    config.search_window,
                    Box::new(move |response: SsdpResponse| {
                        observer.spawn_observer(generation, response)
                    }),
                )
                .await;
            if let Err(e) = result {
                warn!("Bridge discovery failed: {e}");
            }
        });

        let mut st = lock(&self.inner.state);
        if st.generation == generation {
            st.search = Some(search);
        } else {
            search.cancel();
        }
        Ok(())
    }

    /// Whether [`Registry::start_discovery`] is in effect.
    pub fn is_started(&self) -> bool {
        lock(&self.inner.state).settings.is_some()
    }

    /// Whether a discovery cycle is in progress.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    /// Every tracked bridge.
    pub fn bridges(&self) -> Vec<Bridge> {
        lock(&self.inner.state)
            .bridges
            .values()
            .map(|t| t.bridge.clone())
            .collect()
    }

    pub fn bridge(&self, serial: &str) -> Option<Bridge> {
        lock(&self.inner.state)
            .bridges
            .get(&serial.to_ascii_lowercase())
            .map(|t| t.bridge.clone())
    }

    /// Consecutive cycles the bridge has been missing from.
    pub fn missing_count(&self, serial: &str) -> Option<u32> {
        lock(&self.inner.state)
            .bridges
            .get(&serial.to_ascii_lowercase())
            .map(|t| t.age)
    }

    /// Consecutive failed refreshes of the bridge.
    pub fn error_count(&self, serial: &str) -> Option<u32> {
        lock(&self.inner.state)
            .bridges
            .get(&serial.to_ascii_lowercase())
            .map(|t| t.errors)
    }

    /// Track a bridge that was not found by discovery.
    ///
    /// Returns false if a bridge with the same serial is already tracked.
    pub fn add_bridge(&self, bridge: Bridge) -> bool {
        self.track(&bridge, None)
    }

    /// One SSDP search without touching the registry.
    ///
    /// Answers are verified concurrently; the verified bridges are returned.
    /// Bridges already tracked are reused.
    pub async fn send_discovery(&self, window: Duration) -> Result<Vec<Bridge>> {
        let mut responses: Vec<SsdpResponse> = Vec::new();
        self.inner
            .discoverer
            .discover(
                &self.inner.config.service_type,
                window,
                Box::new(|response: SsdpResponse| responses.push(response)),
            )
            .await?;

        let candidates: Vec<Bridge> = responses
            .iter()
            .filter_map(|response| self.candidate(response))
            .collect();
        let verified = join_all(candidates.iter().map(|bridge| bridge.verify())).await;

        Ok(candidates
            .into_iter()
            .zip(verified)
            .filter_map(|(bridge, verified)| matches!(verified, Ok(true)).then_some(bridge))
            .collect())
    }

    pub fn add_disco_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&DiscoEvent) + Send + Sync + 'static,
    {
        self.inner.disco_callbacks.add(callback)
    }

    pub fn remove_disco_callback(&self, id: CallbackId) -> bool {
        self.inner.disco_callbacks.remove(id)
    }

    /// Call `callback` when a tracked bridge gains (`true`) or loses
    /// (`false`) its registration.
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

    fn notify(&self, event: DiscoEvent) {
        self.inner.disco_callbacks.notify(&event);
    }

    /// The bridge an SSDP answer refers to, if it looks like a Hue bridge.
    fn candidate(&self, response: &SsdpResponse) -> Option<Bridge> {
        if !response.location()?.contains("description.xml") {
            return None;
        }
        let serial = response.serial()?;
        let addr = response.ip().to_string();

        let bridge = self.bridge(&serial).unwrap_or_else(|| {
            Bridge::new(
                &addr,
                &serial,
                Arc::clone(&self.inner.transport),
                self.inner.config.bridge.clone(),
            )
        });
        bridge.set_addr(&addr);
        Some(bridge)
    }

    fn spawn_observer(&self, generation: u64, response: SsdpResponse) {
        let registry = self.clone();
        let handle = runtime::spawn_task(async move {
            registry.observe(generation, response).await;
        });

        let mut st = lock(&self.inner.state);
        if st.generation == generation {
            st.observers.push(handle);
        } else {
            handle.cancel();
        }
    }

    async fn observe(&self, generation: u64, response: SsdpResponse) {
        let Some(bridge) = self.candidate(&response) else {
            return;
        };

        match bridge.verify().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!("Could not verify {}: {e}", response.ip());
                return;
            }
        }

        let username = {
            let st = lock(&self.inner.state);
            if st.generation != generation {
                return;
            }
            st.settings
                .as_ref()
                .and_then(|s| s.credentials.for_serial(bridge.serial()))
                .map(String::from)
        };
        if let Some(username) = username {
            bridge.set_username(Some(&username));
        }

        // the outcome reaches the registry through the update callback
        let _ = bridge.refresh().await;

        if self.is_current(generation) {
            self.track(&bridge, Some(generation));
            self.reset_quiet_timer(generation, self.inner.config.quiet_period);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = lock(&self.inner.state);
        st.generation == generation && st.running
    }

    /// Start tracking `bridge`, or mark it seen if already tracked.
    ///
    /// Returns true if the bridge was added.
    fn track(&self, bridge: &Bridge, generation: Option<u64>) -> bool {
        {
            let mut st = lock(&self.inner.state);
            if generation.is_some_and(|g| g != st.generation || !st.running) {
                return false;
            }
            if let Some(tracked) = st.bridges.get_mut(bridge.serial()) {
                if generation.is_some() {
                    tracked.age = 0;
                    tracked.seen = true;
                }
                return false;
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let serial = bridge.serial().to_string();
        let update_callback = bridge.add_update_callback(move |result| {
            if let Some(registry) = Registry::upgrade(&weak) {
                registry.on_refresh(&serial, result);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let bridge_callback = bridge.add_bridge_callback(move |bridge, available| {
            if let Some(registry) = Registry::upgrade(&weak) {
                registry
                    .inner
                    .bridge_callbacks
                    .notify(&(bridge.clone(), available));
            }
        });

        let tracked = Tracked {
            bridge: bridge.clone(),
            age: 0,
            errors: 0,
            seen: generation.is_some(),
            update_callback,
            bridge_callback,
        };
        let added = {
            let mut st = lock(&self.inner.state);
            if st.bridges.contains_key(bridge.serial()) {
                false
            } else {
                st.bridges.insert(bridge.serial().to_string(), tracked);
                st.changed = true;
                true
            }
        };

        if added {
            info!("Tracking {bridge}");
            self.notify(DiscoEvent::Add(bridge.clone()));
        } else {
            // lost a race with another observer of the same bridge
            bridge.remove_update_callback(update_callback);
            bridge.remove_bridge_callback(bridge_callback);
        }
        added
    }

    fn upgrade(weak: &Weak<RegistryInner>) -> Option<Registry> {
        weak.upgrade().map(|inner| Registry { inner })
    }

    fn on_refresh(&self, serial: &str, result: &Result<bool>) {
        let evict = {
            let mut st = lock(&self.inner.state);
            let Some(tracked) = st.bridges.get_mut(serial) else {
                return;
            };
            match result {
                Ok(_) => {
                    tracked.errors = 0;
                    false
                }
                Err(e) if e.counts_toward_eviction() => {
                    tracked.errors += 1;
                    debug!("Bridge {serial} refresh failure {}: {e}", tracked.errors);
                    tracked.errors > self.inner.config.max_bridge_errors
                }
                Err(_) => false,
            }
        };

        if evict {
            let registry = self.clone();
            let serial = serial.to_string();
            runtime::defer(async move { registry.evict_failing(&serial) });
        }
    }

    fn evict_failing(&self, serial: &str) {
        let (tracked, errors) = {
            let mut st = lock(&self.inner.state);
            let errors = match st.bridges.get(serial) {
                Some(tracked) if tracked.errors > self.inner.config.max_bridge_errors => {
                    tracked.errors
                }
                // gone or recovered in the meantime
                _ => return,
            };
            st.changed = true;
            match st.bridges.remove(serial) {
                Some(tracked) => (tracked, errors),
                None => return,
            }
        };

        let bridge = tracked.detach();
        warn!("Dropping {bridge} after {errors} consecutive refresh errors");
        self.notify(DiscoEvent::Del {
            bridge,
            reason: format!("{errors} consecutive refresh errors"),
        });

        match self.do_discovery() {
            Ok(()) | Err(Error::DiscoveryNotStarted) => {}
            Err(e) => debug!("Could not restart discovery: {e}"),
        }
    }

    fn reset_quiet_timer(&self, generation: u64, quiet: Duration) {
        let registry = self.clone();
        let timer = runtime::spawn_task(async move {
            runtime::sleep(quiet).await;
            registry.finish_cycle(generation);
        });

        let mut st = lock(&self.inner.state);
        if st.generation != generation || !st.running {
            timer.cancel();
            return;
        }
        if let Some(previous) = st.quiet_timer.replace(timer) {
            previous.cancel();
        }
    }

    fn finish_cycle(&self, generation: u64) {
        let (removed, changed) = {
            let mut st = lock(&self.inner.state);
            if st.generation != generation || !st.running {
                return;
            }
            st.quiet_timer = None;
            if let Some(search) = st.search.take() {
                search.cancel();
            }

            for tracked in st.bridges.values_mut() {
                if !tracked.seen {
                    tracked.age += 1;
                }
            }
            let config = &self.inner.config;
            let expired: Vec<String> = st
                .bridges
                .iter()
                .filter(|(_, t)| {
                    let limit = if t.bridge.is_subscribed() {
                        config.max_subscribed_age
                    } else {
                        config.max_bridge_age
                    };
                    t.age > limit
                })
                .map(|(serial, _)| serial.clone())
                .collect();
            let removed: Vec<Tracked> = expired
                .iter()
                .filter_map(|serial| st.bridges.remove(serial))
                .collect();

            let changed = mem::take(&mut st.changed) || !removed.is_empty();
            st.running = false;

            if let Some(interval) = st.settings.as_ref().map(|s| s.interval) {
                let registry = self.clone();
                st.next_cycle = Some(runtime::spawn_task(async move {
                    runtime::sleep(interval).await;
                    if let Err(e) = registry.do_discovery() {
                        debug!("Scheduled discovery skipped: {e}");
                    }
                }));
            }
            (removed, changed)
        };

        for tracked in removed {
            let age = tracked.age;
            let bridge = tracked.detach();
            info!("{bridge} missing from {age} discovery cycles");
            self.notify(DiscoEvent::Del {
                bridge,
                reason: format!("missing from {age} discovery cycles"),
            });
        }
        debug!("Discovery cycle {generation} done, changed: {changed}");
        self.notify(DiscoEvent::End { changed });
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("Registry")
            .field("bridges", &st.bridges.keys().collect::<Vec<_>>())
            .field("started", &st.settings.is_some())
            .field("running", &st.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::bridge::tests::{SERIAL, hue_transport};
    use crate::config::BridgeConfig;
    use crate::request_queue::tests::MockTransport;

    const HUE_ANSWER: &str = "HTTP/1.1 200 OK\r\n\
        LOCATION: http://192.168.1.20:80/description.xml\r\n\
        ST: upnp:rootdevice\r\n\
        USN: uuid:2f402f80-da50-11e1-9b23-00178810AB2C::upnp:rootdevice\r\n\
        \r\n";

    const PRINTER_ANSWER: &str = "HTTP/1.1 200 OK\r\n\
        LOCATION: http://192.168.1.30:631/printer.xml\r\n\
        ST: upnp:rootdevice\r\n\
        USN: uuid:11111111-2222-3333-4444-555555555555::upnp:rootdevice\r\n\
        \r\n";

    const UNAUTHORIZED: &str =
        r#"[{"error": {"type": 1, "address": "/", "description": "unauthorized user"}}]"#;

    /// Answers every search with a fixed set of SSDP responses.
    #[derive(Default)]
    struct MockDiscoverer {
        answers: Mutex<Vec<SsdpResponse>>,
        searches: Mutex<usize>,
    }

    impl MockDiscoverer {
        fn answer(&self, ip: [u8; 4], text: &str) {
            let ip = IpAddr::V4(Ipv4Addr::from(ip));
            lock(&self.answers).extend(SsdpResponse::parse(ip, text));
        }

        fn go_quiet(&self) {
            lock(&self.answers).clear();
        }
    }

    impl Discoverer for MockDiscoverer {
        fn discover<'a>(
            &'a self,
            _service_type: &'a str,
            _window: Duration,
            mut on_response: Box<dyn FnMut(SsdpResponse) + Send + 'a>,
        ) -> runtime::BoxFuture<'a, Result<usize>> {
            Box::pin(async move {
                *lock(&self.searches) += 1;
                let answers = lock(&self.answers).clone();
                for answer in &answers {
                    on_response(answer.clone());
                }
                Ok(answers.len())
            })
        }
    }

    struct Fixture {
        registry: Registry,
        transport: Arc<MockTransport>,
        discoverer: Arc<MockDiscoverer>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = hue_transport("192.168.1.20");
            let discoverer = Arc::new(MockDiscoverer::default());
            discoverer.answer([192, 168, 1, 20], HUE_ANSWER);

            let config = RegistryConfig {
                search_window: Duration::from_millis(10),
                initial_quiet_period: Duration::from_millis(60),
                quiet_period: Duration::from_millis(30),
                max_bridge_age: 1,
                max_subscribed_age: 3,
                max_bridge_errors: 2,
                bridge: BridgeConfig {
                    flush_interval: Duration::from_millis(20),
                    ..BridgeConfig::default()
                },
                ..RegistryConfig::default()
            };
            let registry = Registry::new(
                config,
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::clone(&discoverer) as Arc<dyn Discoverer>,
            );

            let events = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&events);
            registry.add_disco_callback(move |event| {
                let line = match event {
                    DiscoEvent::Start => "start".to_string(),
                    DiscoEvent::Add(bridge) => format!("add:{}", bridge.serial()),
                    DiscoEvent::Del { bridge, .. } => format!("del:{}", bridge.serial()),
                    DiscoEvent::End { changed } => format!("end:{changed}"),
                };
                lock(&log).push(line);
            });

            Fixture {
                registry,
                transport,
                discoverer,
                events,
            }
        }

        fn start(&self) {
            self.registry
                .start_discovery(Credentials::Shared("user".into()), Duration::from_secs(1))
                .unwrap();
        }

        fn events(&self) -> Vec<String> {
            lock(&self.events).clone()
        }

        fn ends(&self) -> usize {
            self.events().iter().filter(|e| e.starts_with("end:")).count()
        }

        /// Run one more discovery cycle to completion.
        async fn cycle(&self) {
            let ends = self.ends();
            self.registry.do_discovery().unwrap();
            wait_for(|| self.ends() > ends).await;
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_credentials_per_bridge_ignore_case() {
        let creds = Credentials::PerBridge(HashMap::from([(
            "00178810AB2C".to_string(),
            "secret".to_string(),
        )]));
        assert_eq!(creds.for_serial(SERIAL), Some("secret"));
        assert_eq!(creds.for_serial("001788000000"), None);
        assert_eq!(Credentials::Shared("u".into()).for_serial(SERIAL), Some("u"));
        assert_eq!(Credentials::None.for_serial(SERIAL), None);
    }

    #[tokio::test]
    async fn test_one_bridge_cycle() {
        let fx = Fixture::new();
        fx.start();
        assert!(fx.registry.is_started());
        wait_for(|| fx.ends() == 1).await;

        assert_eq!(fx.events(), vec!["start", "add:00178810ab2c", "end:true"]);
        assert!(!fx.registry.is_running());

        let bridge = fx.registry.bridge("00178810AB2C").unwrap();
        assert!(bridge.is_verified());
        assert!(bridge.is_registered());
        assert_eq!(bridge.username().as_deref(), Some("user"));
        assert_eq!(bridge.lights().len(), 2);
        assert_eq!(fx.registry.missing_count(SERIAL), Some(0));

        // seen again: no new Add, nothing changed
        fx.cycle().await;
        assert_eq!(fx.registry.bridges().len(), 1);
        assert_eq!(fx.events()[3..], ["start", "end:false"]);
        assert_eq!(*lock(&fx.discoverer.searches), 2);
    }

    #[tokio::test]
    async fn test_start_rules() {
        let fx = Fixture::new();
        assert!(matches!(fx.registry.do_discovery(), Err(Error::DiscoveryNotStarted)));
        assert!(matches!(
            fx.registry
                .start_discovery(Credentials::None, Duration::from_millis(500)),
            Err(Error::InvalidInterval(_))
        ));
        assert!(!fx.registry.is_started());

        fx.start();
        assert!(matches!(
            fx.registry
                .start_discovery(Credentials::None, Duration::from_secs(5)),
            Err(Error::AlreadyRunning)
        ));
        // already running: no second Start
        fx.registry.do_discovery().unwrap();
        assert_eq!(fx.events(), vec!["start"]);
        fx.registry.stop_discovery();
    }

    #[tokio::test]
    async fn test_missing_bridge_ages_out() {
        let fx = Fixture::new();
        fx.start();
        wait_for(|| fx.ends() == 1).await;

        fx.discoverer.go_quiet();
        fx.cycle().await;
        assert_eq!(fx.registry.missing_count(SERIAL), Some(1));
        assert!(fx.registry.bridge(SERIAL).is_some());

        fx.cycle().await;
        assert!(fx.registry.bridge(SERIAL).is_none());
        let events = fx.events();
        assert_eq!(events[events.len() - 2..], ["del:00178810ab2c", "end:true"]);
    }

    #[tokio::test]
    async fn test_subscribed_bridge_tolerates_longer_absence() {
        let fx = Fixture::new();
        fx.start();
        wait_for(|| fx.ends() == 1).await;
        let bridge = fx.registry.bridge(SERIAL).unwrap();
        bridge.subscribe(Duration::from_secs(60));

        fx.discoverer.go_quiet();
        for _ in 0..3 {
            fx.cycle().await;
        }
        assert_eq!(fx.registry.missing_count(SERIAL), Some(3));

        fx.cycle().await;
        assert!(fx.registry.bridge(SERIAL).is_none());
        assert!(!bridge.is_subscribed());
    }

    #[tokio::test]
    async fn test_failing_refreshes_evict_bridge() {
        let fx = Fixture::new();
        fx.start();
        wait_for(|| fx.ends() == 1).await;
        let bridge = fx.registry.bridge(SERIAL).unwrap();

        fx.discoverer.go_quiet();
        fx.transport.respond_at("192.168.1.20", "/api/user", 500, "");
        for _ in 0..2 {
            assert!(bridge.refresh().await.is_err());
        }
        assert_eq!(fx.registry.error_count(SERIAL), Some(2));

        let dels = || {
            fx.events()
                .iter()
                .filter(|e| *e == "del:00178810ab2c")
                .count()
        };
        assert!(bridge.refresh().await.is_err());
        wait_for(|| fx.registry.bridge(SERIAL).is_none()).await;
        assert_eq!(dels(), 1);

        // eviction kicks off a fresh cycle
        wait_for(|| fx.events().iter().filter(|e| *e == "start").count() == 2).await;

        // the registry no longer listens to the evicted bridge
        assert!(bridge.refresh().await.is_err());
        runtime::sleep(Duration::from_millis(20)).await;
        assert_eq!(dels(), 1);
        assert_eq!(fx.registry.error_count(SERIAL), None);

        fx.registry.stop_discovery();
        assert_eq!(dels(), 1);
    }

    #[tokio::test]
    async fn test_successful_refresh_resets_errors() {
        let fx = Fixture::new();
        fx.start();
        wait_for(|| fx.ends() == 1).await;
        let bridge = fx.registry.bridge(SERIAL).unwrap();

        fx.transport.respond_at("192.168.1.20", "/api/user", 503, "");
        assert!(bridge.refresh().await.is_err());
        assert_eq!(fx.registry.error_count(SERIAL), Some(1));

        let state = crate::bridge::tests::full_state().to_string();
        fx.transport.respond_at("192.168.1.20", "/api/user", 200, &state);
        assert!(bridge.refresh().await.is_ok());
        assert_eq!(fx.registry.error_count(SERIAL), Some(0));
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_an_error() {
        let fx = Fixture::new();
        let availability = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&availability);
        fx.registry
            .add_bridge_callback(move |bridge, available| {
                lock(&seen).push((bridge.serial().to_string(), available))
            });

        fx.start();
        wait_for(|| fx.ends() == 1).await;
        let bridge = fx.registry.bridge(SERIAL).unwrap();

        fx.transport.respond_at("192.168.1.20", "/api/user", 200, UNAUTHORIZED);
        for _ in 0..4 {
            assert!(bridge.refresh().await.unwrap_err().is_unauthorized());
        }
        assert_eq!(fx.registry.error_count(SERIAL), Some(0));
        assert!(fx.registry.bridge(SERIAL).is_some());
        assert!(!bridge.is_registered());
        assert_eq!(*lock(&availability), vec![(SERIAL.to_string(), false)]);
    }

    #[tokio::test]
    async fn test_stop_drops_bridges_and_keeps_subscribers() {
        let fx = Fixture::new();
        fx.start();
        wait_for(|| fx.ends() == 1).await;

        fx.registry.stop_discovery();
        assert!(!fx.registry.is_started());
        assert!(fx.registry.bridges().is_empty());
        assert_eq!(fx.events().last().map(String::as_str), Some("del:00178810ab2c"));

        // subscribers survive a restart
        fx.start();
        wait_for(|| fx.ends() == 2).await;
        assert_eq!(fx.registry.bridges().len(), 1);
        fx.registry.stop_discovery();
    }

    #[tokio::test]
    async fn test_stop_during_cycle_emits_end() {
        let fx = Fixture::new();
        fx.discoverer.go_quiet();
        fx.start();
        fx.registry.stop_discovery();
        assert_eq!(fx.events(), vec!["start", "end:false"]);

        // the cancelled quiet timer never fires
        runtime::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.ends(), 1);
    }

    #[tokio::test]
    async fn test_add_bridge_manually() {
        let fx = Fixture::new();
        let transport: Arc<dyn Transport> = fx.transport.clone();
        let bridge = Bridge::new("192.168.1.20", SERIAL, transport, BridgeConfig::default());

        assert!(fx.registry.add_bridge(bridge.clone()));
        assert!(!fx.registry.add_bridge(bridge.clone()));
        assert_eq!(fx.registry.bridges(), vec![bridge]);
        assert_eq!(fx.events(), vec!["add:00178810ab2c"]);
    }

    #[tokio::test]
    async fn test_send_discovery_verifies_without_tracking() {
        let fx = Fixture::new();
        fx.discoverer.answer([192, 168, 1, 30], PRINTER_ANSWER);

        let found = fx
            .registry
            .send_discovery(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].serial(), SERIAL);
        assert!(found[0].is_verified());
        assert!(fx.registry.bridges().is_empty());
        assert!(fx.events().is_empty());
    }
}
