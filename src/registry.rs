//! The process-wide registry of pushers.
//!
//! The registry listens for discovery beacons, creates and expires
//! [`Pusher`]s, derives the group map, and drives the global frame clock.
//! Three background tasks do the work:
//!
//!  * the discovery task receives beacons and updates the pusher map,
//!  * the sweeper task expires pushers that have stopped beaconing,
//!  * the frame task delivers lifecycle notifications, runs the frame
//!    delegate handshake, enforces the power budget, and awaits every
//!    pusher's flush before arming the next tick.
//!
//! Construct one registry per process with [`Registry::new`] and tear it
//! down with [`Registry::shutdown`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::command::PusherCommand;
use crate::error::{Error, Result};
use crate::group::PusherGroup;
use crate::header::{DeviceType, PusherHeader};
use crate::observer::{DisappearReason, FrameDelegate, PacketSink, RegistryObserver};
use crate::pusher::Pusher;

/// The UDP port pushers broadcast their beacons to.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7331;

/// Tick length while there is nothing to push and no frame-rate limit to
/// honor, so the frame task neither spins nor sleeps past notifications.
const IDLE_TICK: Duration = Duration::from_millis(16);

/// How long `stop_pushing` waits for in-flight flushes before forcing.
const STOP_DRAIN_WINDOW: Duration = Duration::from_secs(1);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

static REGISTRY_EXISTS: AtomicBool = AtomicBool::new(false);

/// Initial configuration for [`Registry::new`]. Everything here can also
/// be changed at runtime through the registry's setters.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Port for the beacon listener.
    pub discovery_port: u16,
    /// Frame clock cap in Hz; 0 means as fast as the pushers allow.
    pub frame_rate_limit: u32,
    /// Baseline delay added to every pusher's update period.
    pub extra_delay: Duration,
    /// Cap on the summed reported power draw; negative disables limiting.
    pub total_power_limit: i64,
    /// Per-component brightness applied in every strip's pipeline.
    pub brightness_scale: (f32, f32, f32),
    /// Enables the per-pusher autothrottle.
    pub adjust_for_dropped_packets: bool,
    /// Whether `stop_pushing` closes all pushers.
    pub kill_pushers_when_not_running: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            frame_rate_limit: 60,
            extra_delay: Duration::ZERO,
            total_power_limit: -1,
            brightness_scale: (1.0, 1.0, 1.0),
            adjust_for_dropped_packets: true,
            kill_pushers_when_not_running: false,
        }
    }
}

struct RuntimeConfig {
    frame_rate_limit: u32,
    extra_delay: Duration,
    total_power_limit: i64,
    brightness_scale: [f32; 3],
    adjust_for_dropped_packets: bool,
    kill_pushers_when_not_running: bool,
}

enum Event {
    Appeared(Arc<Pusher>),
    Updated(Arc<Pusher>),
    Disappeared { mac: String, reason: DisappearReason },
}

struct RegistryInner {
    config: Mutex<RuntimeConfig>,
    pushers: Mutex<FxHashMap<String, Arc<Pusher>>>,
    groups: Mutex<FxHashMap<u32, PusherGroup>>,
    delegate: Mutex<Option<Weak<dyn FrameDelegate>>>,
    observer: Mutex<Option<Arc<dyn RegistryObserver>>>,
    packet_sink: Mutex<Option<Arc<dyn PacketSink>>>,
    events: mpsc::UnboundedSender<Event>,
    pushing: AtomicBool,
    render_done: Notify,
    frame_idle: Notify,
    cancel: CancellationToken,
    discovery_addr: SocketAddr,
    power_scale: Mutex<f32>,
    total_power: Mutex<u64>,
    beacon_decode_errors: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        REGISTRY_EXISTS.store(false, Ordering::SeqCst);
    }
}

/// A cheap handle to the process-wide registry. Clone freely; the last
/// handle dropped (or [`Registry::shutdown`]) tears the registry down.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Binds the discovery listener and starts the background tasks.
    ///
    /// Only one registry may exist per process; a second call fails with
    /// [`Error::AlreadyCreated`] until the first is torn down. Must be
    /// called from within a tokio runtime.
    pub async fn new(settings: RegistrySettings) -> Result<Registry> {
        if REGISTRY_EXISTS
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyCreated);
        }

        let socket = match UdpSocket::bind(("0.0.0.0", settings.discovery_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                REGISTRY_EXISTS.store(false, Ordering::SeqCst);
                return Err(Error::Socket(e));
            }
        };
        let discovery_addr = socket.local_addr()?;
        log::info!("Listening for pusher beacons on {discovery_addr}");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (r, g, b) = settings.brightness_scale;
        let inner = Arc::new(RegistryInner {
            config: Mutex::new(RuntimeConfig {
                frame_rate_limit: settings.frame_rate_limit,
                extra_delay: settings.extra_delay,
                total_power_limit: settings.total_power_limit,
                brightness_scale: [r, g, b],
                adjust_for_dropped_packets: settings.adjust_for_dropped_packets,
                kill_pushers_when_not_running: settings.kill_pushers_when_not_running,
            }),
            pushers: Mutex::new(FxHashMap::default()),
            groups: Mutex::new(FxHashMap::default()),
            delegate: Mutex::new(None),
            observer: Mutex::new(None),
            packet_sink: Mutex::new(None),
            events: events_tx,
            pushing: AtomicBool::new(false),
            render_done: Notify::new(),
            frame_idle: Notify::new(),
            cancel: CancellationToken::new(),
            discovery_addr,
            power_scale: Mutex::new(1.0),
            total_power: Mutex::new(0),
            beacon_decode_errors: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(discovery_task(Arc::downgrade(&inner), socket)),
            tokio::spawn(sweeper_task(Arc::downgrade(&inner))),
            tokio::spawn(frame_task(Arc::downgrade(&inner), events_rx)),
        ];
        *inner.tasks.lock().unwrap() = tasks;

        Ok(Registry { inner })
    }

    /// The address the beacon listener actually bound, useful when the
    /// configured port was 0.
    pub fn discovery_addr(&self) -> SocketAddr {
        self.inner.discovery_addr
    }

    /// Registers the frame delegate. The registry keeps only a weak
    /// reference; the application owns the delegate.
    pub fn set_frame_delegate(&self, delegate: &Arc<dyn FrameDelegate>) {
        *self.inner.delegate.lock().unwrap() = Some(Arc::downgrade(delegate));
    }

    pub fn set_observer(&self, observer: Arc<dyn RegistryObserver>) {
        *self.inner.observer.lock().unwrap() = Some(observer);
    }

    /// Mirrors every outbound datagram to `sink`, for capture.
    pub fn set_packet_sink(&self, sink: Option<Arc<dyn PacketSink>>) {
        *self.inner.packet_sink.lock().unwrap() = sink.clone();
        for pusher in self.pushers() {
            pusher.set_packet_sink(sink.clone());
        }
    }

    /// Called by an asynchronous frame delegate when its pixel writes are
    /// complete, unblocking the pending tick.
    pub fn render_finished(&self) {
        self.inner.render_done.notify_one();
    }

    /// Arms the frame clock; flushes begin on the next tick.
    pub fn start_pushing(&self) {
        if !self.inner.pushing.swap(true, Ordering::SeqCst) {
            for pusher in self.pushers() {
                pusher.mark_started();
            }
            log::info!("Frame clock armed");
        }
    }

    /// Disarms the frame clock, waiting up to a bounded drain window for
    /// in-flight flushes. With the kill policy enabled, all pushers are
    /// closed and reported as disappeared.
    pub async fn stop_pushing(&self) {
        if self.inner.pushing.swap(false, Ordering::SeqCst) {
            let drained = self.inner.frame_idle.notified();
            if tokio::time::timeout(STOP_DRAIN_WINDOW, drained).await.is_err() {
                log::warn!("Flushes still in flight after the stop drain window; forcing");
            }
            log::info!("Frame clock disarmed");
        }
        let kill = self.inner.config.lock().unwrap().kill_pushers_when_not_running;
        if kill {
            for pusher in self.pushers() {
                self.inner.remove_pusher(&pusher, DisappearReason::Stopped);
            }
        }
    }

    /// Whether the frame clock is armed.
    pub fn is_running(&self) -> bool {
        self.inner.pushing.load(Ordering::SeqCst)
    }

    /// Stops every background task, closes all pushers, and releases the
    /// process-wide registry slot.
    pub async fn shutdown(self) {
        self.inner.pushing.store(false, Ordering::SeqCst);
        for pusher in self.pushers() {
            pusher.close();
        }
        self.inner.pushers.lock().unwrap().clear();
        self.inner.groups.lock().unwrap().clear();
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// All pushers, sorted by controller ordinal and then MAC address.
    pub fn pushers(&self) -> Vec<Arc<Pusher>> {
        let mut pushers: Vec<Arc<Pusher>> =
            self.inner.pushers.lock().unwrap().values().cloned().collect();
        pushers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        pushers
    }

    pub fn pusher_with_mac(&self, mac: &str) -> Option<Arc<Pusher>> {
        self.inner.pushers.lock().unwrap().get(mac).cloned()
    }

    /// All groups, sorted by ordinal. The returned groups are snapshots;
    /// membership tracks the live pushers through weak references.
    pub fn groups(&self) -> Vec<PusherGroup> {
        let mut groups: Vec<PusherGroup> =
            self.inner.groups.lock().unwrap().values().cloned().collect();
        groups.sort_by_key(|g| g.ordinal());
        groups
    }

    /// The group with the given ordinal, created empty on demand.
    pub fn group_with_ordinal(&self, ordinal: u32) -> PusherGroup {
        self.inner
            .groups
            .lock()
            .unwrap()
            .entry(ordinal)
            .or_insert_with(|| PusherGroup::new(ordinal))
            .clone()
    }

    /// Visits every strip of every pusher, in pusher sort order.
    pub fn for_each_strip(&self, mut f: impl FnMut(&mut crate::strip::Strip)) {
        for pusher in self.pushers() {
            for strip in pusher.strips().iter_mut() {
                f(strip);
            }
        }
    }

    pub fn strip_count(&self) -> usize {
        self.pushers().iter().map(|p| p.strips().len()).sum()
    }

    /// Appends `command` to every pusher's queue. Failures on individual
    /// pushers never abort the fan-out.
    pub fn enqueue_command_in_all_pushers(&self, command: &PusherCommand) {
        for pusher in self.pushers() {
            pusher.enqueue_command(command.clone());
        }
    }

    /// Scales stored pixels down to an average-brightness limit.
    ///
    /// With `per_pusher` set, each pusher's average is computed and capped
    /// separately; otherwise one average across all strips decides a
    /// single scale for everything. Returns whether any scaling happened.
    /// A limit of 1.0 or higher never scales.
    pub fn scale_average_brightness_for_limit(&self, limit: f32, per_pusher: bool) -> bool {
        let pushers = self.pushers();
        let mut scaled = false;
        if per_pusher {
            for pusher in &pushers {
                let average = pusher.average_brightness();
                if average > limit && average > 0.0 {
                    pusher.scale_average_brightness(limit / average);
                    scaled = true;
                }
            }
        } else {
            let mut sum = 0.0f32;
            let mut count = 0usize;
            for pusher in &pushers {
                for strip in pusher.strips().iter() {
                    sum += strip.average_brightness();
                    count += 1;
                }
            }
            let average = if count == 0 { 0.0 } else { sum / count as f32 };
            if average > limit && average > 0.0 {
                for pusher in &pushers {
                    pusher.scale_average_brightness(limit / average);
                }
                scaled = true;
            }
        }
        scaled
    }

    /// Per-component brightness applied in every strip's pipeline,
    /// multiplied with each pusher's own brightness scale.
    pub fn set_brightness_scale(&self, red: f32, green: f32, blue: f32) {
        self.inner.config.lock().unwrap().brightness_scale = [red, green, blue];
        for pusher in self.pushers() {
            pusher.set_registry_brightness([red, green, blue]);
        }
    }

    pub fn brightness_scale(&self) -> (f32, f32, f32) {
        let [r, g, b] = self.inner.config.lock().unwrap().brightness_scale;
        (r, g, b)
    }

    pub fn set_frame_rate_limit(&self, fps: u32) {
        self.inner.config.lock().unwrap().frame_rate_limit = fps;
    }

    pub fn frame_rate_limit(&self) -> u32 {
        self.inner.config.lock().unwrap().frame_rate_limit
    }

    /// Resets the pacing-delay baseline on every pusher, discarding any
    /// autothrottle accumulation.
    pub fn set_extra_delay(&self, delay: Duration) {
        self.inner.config.lock().unwrap().extra_delay = delay;
        for pusher in self.pushers() {
            pusher.set_extra_delay(delay);
        }
    }

    /// Caps the summed reported power draw; negative disables limiting.
    pub fn set_total_power_limit(&self, limit: i64) {
        self.inner.config.lock().unwrap().total_power_limit = limit;
    }

    /// The sum of reported pusher power from the last limited tick.
    pub fn total_power(&self) -> u64 {
        *self.inner.total_power.lock().unwrap()
    }

    /// The power-budget scale currently broadcast to strips; 1.0 when no
    /// limiting is in effect.
    pub fn power_scale(&self) -> f32 {
        *self.inner.power_scale.lock().unwrap()
    }

    /// Toggles the autothrottle on every pusher.
    pub fn set_adjust_for_dropped_packets(&self, enabled: bool) {
        self.inner.config.lock().unwrap().adjust_for_dropped_packets = enabled;
        for pusher in self.pushers() {
            pusher.set_autothrottle(enabled);
        }
    }

    pub fn set_kill_pushers_when_not_running(&self, kill: bool) {
        self.inner.config.lock().unwrap().kill_pushers_when_not_running = kill;
    }

    /// Malformed datagrams seen on the discovery socket so far.
    pub fn beacon_decode_errors(&self) -> u64 {
        self.inner.beacon_decode_errors.load(Ordering::Relaxed)
    }
}

impl RegistryInner {
    async fn handle_beacon(&self, packet: &[u8], src: SocketAddr) {
        let header = match PusherHeader::parse(packet) {
            Ok(header) => header,
            Err(Error::UnknownDevice(device_type)) => {
                log::trace!("Ignoring beacon from {src} with unknown device type {device_type}");
                return;
            }
            Err(e) => {
                self.beacon_decode_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping malformed beacon from {src}: {e}");
                return;
            }
        };
        if header.device_type != DeviceType::PixelPusher {
            log::trace!(
                "Ignoring {:?} beacon from {}",
                header.device_type,
                header.mac_string()
            );
            return;
        }

        let mac = header.mac_string();
        let existing = self.pushers.lock().unwrap().get(&mac).cloned();
        if let Some(pusher) = existing {
            match pusher.update_with_header(&header) {
                Ok(true) => {
                    let _ = self.events.send(Event::Updated(pusher));
                    return;
                }
                Ok(false) => return,
                Err(e) => {
                    // The pusher rejected the beacon; destroy and recreate.
                    log::info!("{e}; recreating");
                    self.remove_pusher(&pusher, DisappearReason::CapabilityChanged);
                }
            }
        }

        let (extra_delay, autothrottle, brightness) = {
            let config = self.config.lock().unwrap();
            (
                config.extra_delay,
                config.adjust_for_dropped_packets,
                config.brightness_scale,
            )
        };
        let sink = self.packet_sink.lock().unwrap().clone();
        let addr = header.socket_addr();
        match Pusher::create(header, extra_delay, autothrottle, brightness, sink).await {
            Ok(pusher) => {
                if self.pushing.load(Ordering::SeqCst) {
                    pusher.mark_started();
                }
                self.pushers.lock().unwrap().insert(mac.clone(), Arc::clone(&pusher));
                self.groups
                    .lock()
                    .unwrap()
                    .entry(pusher.group_ordinal())
                    .or_insert_with(|| PusherGroup::new(pusher.group_ordinal()))
                    .add_pusher(&pusher);
                log::info!("Pusher {mac} appeared at {addr}");
                let _ = self.events.send(Event::Appeared(pusher));
            }
            Err(e) => {
                log::warn!("Could not open a socket for pusher {mac} at {addr}: {e}");
            }
        }
    }

    fn remove_pusher(&self, pusher: &Arc<Pusher>, reason: DisappearReason) {
        pusher.close();
        let mac = pusher.mac().to_owned();
        self.pushers.lock().unwrap().remove(&mac);
        let mut groups = self.groups.lock().unwrap();
        let ordinal = pusher.group_ordinal();
        if let Some(group) = groups.get_mut(&ordinal) {
            group.remove_pusher(pusher);
            if group.is_empty() {
                groups.remove(&ordinal);
            }
        }
        drop(groups);
        log::info!("Pusher {mac} disappeared ({reason:?})");
        let _ = self.events.send(Event::Disappeared { mac, reason });
    }

    fn dispatch_events(&self, events: &mut mpsc::UnboundedReceiver<Event>) {
        while let Ok(event) = events.try_recv() {
            let observer = self.observer.lock().unwrap().clone();
            let Some(observer) = observer else { continue };
            match event {
                Event::Appeared(pusher) => observer.pusher_appeared(&pusher),
                Event::Updated(pusher) => observer.pusher_updated(&pusher),
                Event::Disappeared { mac, reason } => observer.pusher_disappeared(&mac, reason),
            }
        }
    }

    /// Sums the reported power draw and broadcasts the resulting scale to
    /// every strip. The scale that enforces the cap is `limit / total`.
    fn enforce_power_budget(&self, pushers: &[Arc<Pusher>]) {
        let limit = self.config.lock().unwrap().total_power_limit;
        if limit < 0 {
            let mut power_scale = self.power_scale.lock().unwrap();
            if *power_scale != 1.0 {
                *power_scale = 1.0;
                drop(power_scale);
                for pusher in pushers {
                    pusher.set_power_scale(1.0);
                }
            }
            return;
        }

        let total: u64 = pushers.iter().map(|p| u64::from(p.power_total())).sum();
        let scale = if total == 0 || total <= limit as u64 {
            1.0
        } else {
            (limit as f64 / total as f64) as f32
        };
        *self.total_power.lock().unwrap() = total;
        *self.power_scale.lock().unwrap() = scale;
        for pusher in pushers {
            pusher.set_power_scale(scale);
        }
    }
}

async fn discovery_task(inner: Weak<RegistryInner>, socket: UdpSocket) {
    let mut buf = vec![0u8; 2048];
    loop {
        let Some(registry) = inner.upgrade() else { return };
        let cancel = registry.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => registry.handle_beacon(&buf[..len], src).await,
                Err(e) => {
                    log::warn!("Discovery receive error: {e}");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn sweeper_task(inner: Weak<RegistryInner>) {
    loop {
        {
            let Some(registry) = inner.upgrade() else { return };
            let pushers: Vec<Arc<Pusher>> =
                registry.pushers.lock().unwrap().values().cloned().collect();
            for pusher in pushers {
                if pusher.last_seen().elapsed() > pusher.expiry_threshold() {
                    log::info!(
                        "Pusher {} unseen for {:?}; expiring",
                        pusher.mac(),
                        pusher.last_seen().elapsed()
                    );
                    registry.remove_pusher(&pusher, DisappearReason::Expired);
                }
            }
            if registry.cancel.is_cancelled() {
                return;
            }
        }
        sleep(SWEEP_INTERVAL).await;
    }
}

async fn frame_task(inner: Weak<RegistryInner>, mut events: mpsc::UnboundedReceiver<Event>) {
    loop {
        let Some(registry) = inner.upgrade() else { return };
        if registry.cancel.is_cancelled() {
            return;
        }
        let cancel = registry.cancel.clone();
        let tick_start = Instant::now();

        // Notifications always fire on this task, in arrival order.
        registry.dispatch_events(&mut events);

        if !registry.pushing.load(Ordering::SeqCst) {
            registry.frame_idle.notify_waiters();
            drop(registry);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(IDLE_TICK) => {}
            }
            continue;
        }

        // Frame delegate handshake: a `true` return means the pixels are
        // ready now; `false` means wait for render_finished().
        let delegate = registry
            .delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            if !delegate.render_start() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = registry.render_done.notified() => {}
                }
            }
        }

        let pushers: Vec<Arc<Pusher>> =
            registry.pushers.lock().unwrap().values().cloned().collect();

        registry.enforce_power_budget(&pushers);

        // One flush per pusher; the tick does not advance until every
        // flush has finished.
        let results = join_all(pushers.iter().map(|p| p.flush())).await;
        for (pusher, result) in pushers.iter().zip(results) {
            match result {
                Ok(()) | Err(Error::Closed) => {}
                Err(e) => {
                    if pusher.has_failed() {
                        log::warn!("Pusher {} socket failed; removing", pusher.mac());
                        registry.remove_pusher(pusher, DisappearReason::SocketFailed);
                    } else {
                        log::debug!("Flush error on pusher {}: {e}", pusher.mac());
                    }
                }
            }
        }

        let frame_rate_limit = registry.config.lock().unwrap().frame_rate_limit;
        drop(registry);

        if frame_rate_limit > 0 {
            let next_tick = tick_start + Duration::from_secs(1) / frame_rate_limit;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(next_tick) => {}
            }
        } else if pushers.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(IDLE_TICK) => {}
            }
        }
    }
}
