//! Communication with a single PixelPusher controller.
//!
//! A `Pusher` holds the capability record from the controller's first
//! beacon, the strips it drives, a connected UDP socket, and the pacing
//! state that spreads each flush's packets across the controller's update
//! period. Beacons refresh the drifting fields and feed the autothrottle;
//! [`Pusher::flush`] serializes the strips into as few datagrams as the
//! controller accepts and sends them at computed egress times.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::PusherCommand;
use crate::error::{Error, Result};
use crate::header::{PusherFlags, PusherHeader, StripFlags};
use crate::observer::PacketSink;
use crate::strip::Strip;
use crate::wire::PacketWriter;

/// Data and command datagrams stay within this many bytes, including the
/// sequence prefix.
pub const PACKET_SIZE_LIMIT: usize = 1460;

const SEQUENCE_PREFIX_LEN: usize = 4;

/// Controllers are paced no faster than this, whatever they advertise.
const MIN_UPDATE_PERIOD_USEC: u64 = 1_000;
/// Advertised periods above this are treated as bogus for pacing.
const MAX_UPDATE_PERIOD_USEC: u64 = 100_000;

/// Autothrottle: beacons reporting more than this many dropped packets
/// back off the pusher.
const DROPPED_PACKET_TOLERANCE: u32 = 2;
const THROTTLE_BACKOFF_STEP: Duration = Duration::from_millis(5);
const THROTTLE_RECOVERY_STEP: Duration = Duration::from_millis(1);

/// Consecutive socket send errors before the pusher gives up.
const MAX_CONSECUTIVE_SEND_ERRORS: u32 = 3;

/// Where a pusher is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed from a beacon; the registry is not pushing yet.
    Created,
    /// The registry's frame clock is running.
    Started,
    /// At least one packet has been sent successfully.
    Running,
    /// Close requested; in-flight flushes are being cancelled.
    Closing,
    /// Socket released; all operations fail with [`Error::Closed`].
    Closed,
}

struct PusherState {
    lifecycle: Lifecycle,
    update_period: Duration,
    power_total: u32,
    delta_sequence: u32,
    last_seen: Instant,
    extra_delay: Duration,
    commands: VecDeque<PusherCommand>,
    sequence: u32,
    /// When the previous flush's last packet was sent; the next flush's
    /// egress schedule is anchored here.
    last_egress: Option<Instant>,
    consecutive_errors: u32,
    brightness_scale: [f32; 3],
    registry_brightness: [f32; 3],
    packet_sink: Option<Arc<dyn PacketSink>>,
}

pub struct Pusher {
    header: PusherHeader,
    mac: String,
    addr: SocketAddr,
    socket: UdpSocket,
    strips: Mutex<Vec<Strip>>,
    state: Mutex<PusherState>,
    cancel: CancellationToken,
    autothrottle: AtomicBool,
    oversize_warned: AtomicBool,
}

impl Pusher {
    /// Opens a socket to the controller described by `header` and
    /// allocates its strips.
    pub(crate) async fn create(
        header: PusherHeader,
        extra_delay: Duration,
        autothrottle: bool,
        registry_brightness: [f32; 3],
        packet_sink: Option<Arc<dyn PacketSink>>,
    ) -> Result<Arc<Pusher>> {
        let addr = header.socket_addr();
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(addr).await?;

        let strips = (0..header.strips_attached)
            .map(|i| {
                let flags = header
                    .strip_flags
                    .get(i as usize)
                    .copied()
                    .unwrap_or(StripFlags::empty());
                let mut strip = Strip::new(u32::from(i), u32::from(header.pixels_per_strip), flags);
                strip.set_global_brightness(
                    registry_brightness[0],
                    registry_brightness[1],
                    registry_brightness[2],
                );
                strip
            })
            .collect();

        // The creating beacon participates in the autothrottle too.
        let mut extra_delay = extra_delay;
        if autothrottle && header.delta_sequence > DROPPED_PACKET_TOLERANCE {
            extra_delay += THROTTLE_BACKOFF_STEP;
        }

        let state = PusherState {
            lifecycle: Lifecycle::Created,
            update_period: Duration::from_micros(u64::from(header.update_period_usec)),
            power_total: header.power_total,
            delta_sequence: header.delta_sequence,
            last_seen: Instant::now(),
            extra_delay,
            commands: VecDeque::new(),
            sequence: 0,
            last_egress: None,
            consecutive_errors: 0,
            brightness_scale: [1.0; 3],
            registry_brightness,
            packet_sink,
        };

        let mac = header.mac_string();
        Ok(Arc::new(Pusher {
            header,
            mac,
            addr,
            socket,
            strips: Mutex::new(strips),
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            autothrottle: AtomicBool::new(autothrottle),
            oversize_warned: AtomicBool::new(false),
        }))
    }

    /// The capability record from the beacon that created this pusher.
    pub fn header(&self) -> &PusherHeader {
        &self.header
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn controller_ordinal(&self) -> u32 {
        self.header.controller_ordinal
    }

    pub fn group_ordinal(&self) -> u32 {
        self.header.group_ordinal
    }

    pub fn max_strips_per_packet(&self) -> u8 {
        self.header.max_strips_per_packet
    }

    pub fn pixels_per_strip(&self) -> u16 {
        self.header.pixels_per_strip
    }

    pub fn pusher_flags(&self) -> PusherFlags {
        self.header.pusher_flags
    }

    /// The update period from the most recent beacon.
    pub fn update_period(&self) -> Duration {
        self.state.lock().unwrap().update_period
    }

    /// The controller's reported milliamp draw from the most recent beacon.
    pub fn power_total(&self) -> u32 {
        self.state.lock().unwrap().power_total
    }

    /// The leaky-bucket dropped-packet count from the most recent beacon.
    pub fn delta_sequence(&self) -> u32 {
        self.state.lock().unwrap().delta_sequence
    }

    /// The adaptive delay currently added to the controller's period.
    pub fn extra_delay(&self) -> Duration {
        self.state.lock().unwrap().extra_delay
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.lifecycle(),
            Lifecycle::Closing | Lifecycle::Closed
        )
    }

    /// Write access to the strips for the frame delegate. Strips are
    /// single-writer; hold the guard only while writing pixels, and never
    /// across a frame boundary.
    pub fn strips(&self) -> MutexGuard<'_, Vec<Strip>> {
        self.strips.lock().unwrap()
    }

    /// Sort key for registry ordering: controller ordinal, then MAC.
    pub(crate) fn sort_key(&self) -> (u32, &str) {
        (self.header.controller_ordinal, &self.mac)
    }

    pub(crate) fn last_seen(&self) -> Instant {
        self.state.lock().unwrap().last_seen
    }

    /// How long a pusher may go unseen before the sweeper expires it.
    pub(crate) fn expiry_threshold(&self) -> Duration {
        let period = self.state.lock().unwrap().update_period;
        (period * 10).max(Duration::from_secs(2))
    }

    /// Folds a fresh beacon's drifting fields into this pusher and runs
    /// the autothrottle. Returns whether anything changed that merits an
    /// update notification.
    ///
    /// A beacon that disagrees on the immutable capability fields fails
    /// with [`Error::CapabilityMismatch`]; the registry responds by
    /// destroying and recreating the pusher.
    pub(crate) fn update_with_header(&self, header: &PusherHeader) -> Result<bool> {
        if !self.header.capabilities_match(header) {
            return Err(Error::CapabilityMismatch(self.mac.clone()));
        }
        let mut state = self.state.lock().unwrap();
        state.last_seen = Instant::now();

        let mut changed = false;
        let period = Duration::from_micros(u64::from(header.update_period_usec));
        if state.update_period != period {
            state.update_period = period;
            changed = true;
        }
        if state.power_total != header.power_total {
            state.power_total = header.power_total;
            changed = true;
        }
        state.delta_sequence = header.delta_sequence;

        if self.autothrottle.load(Ordering::Relaxed) {
            if header.delta_sequence > DROPPED_PACKET_TOLERANCE {
                state.extra_delay += THROTTLE_BACKOFF_STEP;
                log::debug!(
                    "Pusher {} dropped {} packets, extra delay now {:?}",
                    self.mac,
                    header.delta_sequence,
                    state.extra_delay
                );
            } else if header.delta_sequence == 0 {
                state.extra_delay = state.extra_delay.saturating_sub(THROTTLE_RECOVERY_STEP);
            }
        }
        Ok(changed)
    }

    /// Appends an administrative command. Commands are drained one per
    /// flush, ahead of that flush's data packets.
    pub fn enqueue_command(&self, command: PusherCommand) {
        let mut state = self.state.lock().unwrap();
        state.commands.push_back(command);
    }

    /// Queues hardware brightness resets for everything this pusher
    /// supports: a global-brightness command if the controller takes one,
    /// and one per-strip command if it supports those.
    pub fn reset_hardware_brightness(&self) {
        if self.header.pusher_flags.contains(PusherFlags::GLOBAL_BRIGHTNESS) {
            self.enqueue_command(PusherCommand::global_brightness(u16::MAX));
        }
        if self.header.pusher_flags.contains(PusherFlags::STRIP_BRIGHTNESS) {
            for strip in 0..self.header.strips_attached {
                self.enqueue_command(PusherCommand::strip_brightness(strip, u16::MAX));
            }
        }
    }

    /// Scales the pixels currently stored in every strip, once.
    pub fn scale_average_brightness(&self, scale: f32) {
        for strip in self.strips.lock().unwrap().iter_mut() {
            strip.scale_average_brightness(scale);
        }
    }

    /// Mean stored brightness across all strips, 0 to 1.
    pub fn average_brightness(&self) -> f32 {
        let strips = self.strips.lock().unwrap();
        if strips.is_empty() {
            return 0.0;
        }
        strips.iter().map(|s| s.average_brightness()).sum::<f32>() / strips.len() as f32
    }

    pub fn does_any_strip_support_hardware_brightness(&self) -> bool {
        self.strips
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.supports_hardware_brightness())
    }

    /// Per-pusher brightness factors, multiplied with the registry's into
    /// every strip's pipeline.
    pub fn set_brightness_scale(&self, red: f32, green: f32, blue: f32) {
        let registry = {
            let mut state = self.state.lock().unwrap();
            state.brightness_scale = [red, green, blue];
            state.registry_brightness
        };
        self.apply_brightness([red, green, blue], registry);
    }

    pub fn brightness_scale(&self) -> (f32, f32, f32) {
        let [r, g, b] = self.state.lock().unwrap().brightness_scale;
        (r, g, b)
    }

    pub(crate) fn set_registry_brightness(&self, brightness: [f32; 3]) {
        let own = {
            let mut state = self.state.lock().unwrap();
            state.registry_brightness = brightness;
            state.brightness_scale
        };
        self.apply_brightness(own, brightness);
    }

    fn apply_brightness(&self, own: [f32; 3], registry: [f32; 3]) {
        let combined = [
            own[0] * registry[0],
            own[1] * registry[1],
            own[2] * registry[2],
        ];
        for strip in self.strips.lock().unwrap().iter_mut() {
            strip.set_global_brightness(combined[0], combined[1], combined[2]);
        }
    }

    /// Applies the registry's power-budget scale to every strip.
    pub(crate) fn set_power_scale(&self, scale: f32) {
        for strip in self.strips.lock().unwrap().iter_mut() {
            strip.set_power_scale(scale);
        }
    }

    pub(crate) fn set_packet_sink(&self, sink: Option<Arc<dyn PacketSink>>) {
        self.state.lock().unwrap().packet_sink = sink;
    }

    pub(crate) fn set_autothrottle(&self, enabled: bool) {
        self.autothrottle.store(enabled, Ordering::Relaxed);
    }

    /// Resets the pacing delay to a new baseline, discarding whatever the
    /// autothrottle had accumulated.
    pub(crate) fn set_extra_delay(&self, delay: Duration) {
        self.state.lock().unwrap().extra_delay = delay;
    }

    pub(crate) fn mark_started(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Created {
            state.lifecycle = Lifecycle::Started;
        }
    }

    /// Whether the send-error counter has escalated to closure.
    pub(crate) fn has_failed(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.consecutive_errors >= MAX_CONSECUTIVE_SEND_ERRORS
    }

    /// Serializes all strips into paced datagrams and sends them.
    ///
    /// At most one queued command is drained first, in its own packet.
    /// Every packet carries the next value of the wrapping u32 sequence,
    /// and packets are dispatched in sequence order at egress times spread
    /// across the controller's period. The future completes when the last
    /// packet has been handed to the socket; callers must not start a new
    /// flush on the same pusher until the previous one has completed.
    pub async fn flush(&self) -> Result<()> {
        let (packets, period, t0) = {
            let mut state = self.state.lock().unwrap();
            if matches!(state.lifecycle, Lifecycle::Closing | Lifecycle::Closed) {
                return Err(Error::Closed);
            }
            let command = state.commands.pop_front();
            let mut sequence = state.sequence;
            let packets = {
                let mut strips = self.strips.lock().unwrap();
                plan_packets(
                    &mut strips,
                    usize::from(self.header.max_strips_per_packet),
                    command.as_ref(),
                    &mut sequence,
                )
            };
            state.sequence = sequence;

            let period = Duration::from_micros(pacing_base_usec(state.update_period)) + state.extra_delay;
            let t0 = state.last_egress.unwrap_or_else(Instant::now);
            (packets, period, t0)
        };

        if packets
            .iter()
            .any(|p| p.len() > PACKET_SIZE_LIMIT)
            && !self.oversize_warned.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "Pusher {}: a single strip exceeds the {}-byte datagram budget; sending oversized packets",
                self.mac,
                PACKET_SIZE_LIMIT
            );
        }

        let count = packets.len() as u64;
        for (k, packet) in packets.iter().enumerate() {
            let offset = Duration::from_nanos(period.as_nanos() as u64 * k as u64 / count);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Closed),
                _ = tokio::time::sleep_until(t0 + offset) => {}
            }
            self.send_packet(packet).await?;
        }

        let mut state = self.state.lock().unwrap();
        state.last_egress = Some(Instant::now());
        Ok(())
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        match self.socket.send(packet).await {
            Ok(_) => {
                let sink = {
                    let mut state = self.state.lock().unwrap();
                    state.consecutive_errors = 0;
                    if matches!(state.lifecycle, Lifecycle::Created | Lifecycle::Started) {
                        state.lifecycle = Lifecycle::Running;
                    }
                    state.packet_sink.clone()
                };
                if let Some(sink) = sink {
                    sink.packet_sent(&self.mac, packet);
                }
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.consecutive_errors += 1;
                log::warn!(
                    "Pusher {}: send error {} ({} consecutive)",
                    self.mac,
                    e,
                    state.consecutive_errors
                );
                if state.consecutive_errors >= MAX_CONSECUTIVE_SEND_ERRORS {
                    state.lifecycle = Lifecycle::Closed;
                    drop(state);
                    self.cancel.cancel();
                }
                Err(Error::Socket(e))
            }
        }
    }

    /// Cancels pending sends and fails any in-flight flush with
    /// [`Error::Closed`]. The socket is released with the pusher.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Closing;
        }
        self.cancel.cancel();
        self.state.lock().unwrap().lifecycle = Lifecycle::Closed;
    }
}

/// The pacing base: the advertised period clamped to sane bounds.
fn pacing_base_usec(period: Duration) -> u64 {
    (period.as_micros() as u64).clamp(MIN_UPDATE_PERIOD_USEC, MAX_UPDATE_PERIOD_USEC)
}

/// Packs the strips into datagrams: each packet takes up to
/// `max_strips_per_packet` strip payloads without crossing the size limit,
/// and an optional command rides alone in the first packet. Every packet
/// is prefixed with the next sequence number.
fn plan_packets(
    strips: &mut [Strip],
    max_strips_per_packet: usize,
    command: Option<&PusherCommand>,
    sequence: &mut u32,
) -> Vec<Vec<u8>> {
    let mut next_sequence = || {
        *sequence = sequence.wrapping_add(1);
        *sequence
    };

    let mut packets = Vec::new();

    if let Some(command) = command {
        let mut w = PacketWriter::with_capacity(SEQUENCE_PREFIX_LEN + command.encoded().len());
        w.put_u32(next_sequence());
        w.put_bytes(command.encoded());
        packets.push(w.into_vec());
    }

    let max_strips = max_strips_per_packet.max(1);
    let mut current: Option<(PacketWriter, usize)> = None;
    for strip in strips.iter_mut() {
        let strip_len = strip.packet_len();
        let fits = match &current {
            None => false,
            Some((w, n)) => *n < max_strips && w.len() + strip_len <= PACKET_SIZE_LIMIT,
        };
        if !fits {
            if let Some((w, _)) = current.take() {
                packets.push(w.into_vec());
            }
            let mut w = PacketWriter::with_capacity(SEQUENCE_PREFIX_LEN + strip_len);
            w.put_u32(next_sequence());
            current = Some((w, 0));
        }
        if let Some((w, n)) = &mut current {
            w.put_bytes(strip.wire_bytes());
            *n += 1;
        }
    }
    if let Some((w, _)) = current.take() {
        packets.push(w.into_vec());
    }

    packets
}
