use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use pixelpusher_client::{
    DeviceType, DisappearReason, Error, FrameDelegate, PacketSink, PusherCommand, PusherFlags,
    PusherHeader, Registry, RegistryObserver, RegistrySettings, StripFlags, COMMAND_MAGIC,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Only one registry may exist per process, so every test that creates one
/// takes this lock first.
fn registry_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn test_settings() -> RegistrySettings {
    let _ = env_logger::builder().is_test(true).try_init();
    RegistrySettings {
        discovery_port: 0,
        frame_rate_limit: 120,
        ..RegistrySettings::default()
    }
}

fn beacon(mac_low: u8, port: u16) -> PusherHeader {
    PusherHeader {
        mac: [0x00, 0x04, 0xa3, 0x00, 0x00, mac_low],
        ip: Ipv4Addr::LOCALHOST,
        device_type: DeviceType::PixelPusher,
        protocol_version: 1,
        vendor_id: 3,
        product_id: 2,
        hw_revision: 2,
        sw_revision: 122,
        link_speed: 100_000_000,
        strips_attached: 1,
        max_strips_per_packet: 1,
        pixels_per_strip: 4,
        update_period_usec: 1_000,
        power_total: 100,
        delta_sequence: 0,
        controller_ordinal: 0,
        group_ordinal: 0,
        artnet_universe: 0,
        artnet_channel: 0,
        port,
        pusher_flags: PusherFlags::empty(),
        segments: Some(0),
        power_domain: Some(0),
        strip_flags: vec![StripFlags::empty()],
    }
}

async fn send_beacon(registry: &Registry, header: &PusherHeader) {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let port = registry.discovery_addr().port();
    socket
        .send_to(&header.to_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();
}

async fn wait_for_pusher(
    registry: &Registry,
    mac: &str,
) -> Arc<pixelpusher_client::Pusher> {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(pusher) = registry.pusher_with_mac(mac) {
                return pusher;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pusher never appeared")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn recv_packet(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no packet arrived")
        .unwrap();
    buf.truncate(len);
    buf
}

fn sequence_of(packet: &[u8]) -> u32 {
    u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]])
}

#[derive(Default)]
struct Recorder {
    appeared: Mutex<Vec<String>>,
    updated: AtomicU32,
    disappeared: Mutex<Vec<(String, DisappearReason)>>,
}

impl RegistryObserver for Recorder {
    fn pusher_appeared(&self, pusher: &Arc<pixelpusher_client::Pusher>) {
        self.appeared.lock().unwrap().push(pusher.mac().to_owned());
    }

    fn pusher_updated(&self, _pusher: &Arc<pixelpusher_client::Pusher>) {
        self.updated.fetch_add(1, Ordering::SeqCst);
    }

    fn pusher_disappeared(&self, mac: &str, reason: DisappearReason) {
        self.disappeared
            .lock()
            .unwrap()
            .push((mac.to_owned(), reason));
    }
}

/// Paints pixel 0 of every strip red on every frame.
struct RedPainter {
    registry: Registry,
}

impl FrameDelegate for RedPainter {
    fn render_start(&self) -> bool {
        for pusher in self.registry.pushers() {
            for strip in pusher.strips().iter_mut() {
                strip.set_pixel_rgb8(0, 255, 0, 0);
            }
        }
        true
    }
}

/// Renders off the frame task: `render_start` returns false and a spawned
/// task paints and then reports completion.
struct DeferredPainter {
    registry: Registry,
    renders: Arc<AtomicU32>,
}

impl FrameDelegate for DeferredPainter {
    fn render_start(&self) -> bool {
        let registry = self.registry.clone();
        let renders = self.renders.clone();
        tokio::spawn(async move {
            for pusher in registry.pushers() {
                for strip in pusher.strips().iter_mut() {
                    strip.set_pixel_rgb8(0, 0, 255, 0);
                }
            }
            renders.fetch_add(1, Ordering::SeqCst);
            registry.render_finished();
        });
        false
    }
}

#[derive(Default)]
struct CaptureSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl PacketSink for CaptureSink {
    fn packet_sent(&self, _pusher_mac: &str, datagram: &[u8]) {
        self.packets.lock().unwrap().push(datagram.to_vec());
    }
}

#[tokio::test]
async fn only_one_registry_per_process() {
    let _guard = registry_lock().lock().await;
    let registry = Registry::new(test_settings()).await.unwrap();
    assert!(matches!(
        Registry::new(test_settings()).await,
        Err(Error::AlreadyCreated)
    ));
    registry.shutdown().await;
    let again = Registry::new(test_settings()).await.unwrap();
    again.shutdown().await;
}

#[tokio::test]
async fn discovery_creates_updates_and_replaces_pushers() {
    let _guard = registry_lock().lock().await;
    let registry = Registry::new(test_settings()).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    registry.set_observer(recorder.clone());

    let header = beacon(0x21, 9897);
    let mac = header.mac_string();
    send_beacon(&registry, &header).await;
    let pusher = wait_for_pusher(&registry, &mac).await;
    assert_eq!(pusher.strips().len(), 1);
    assert_eq!(pusher.power_total(), 100);
    assert_eq!(registry.pushers().len(), 1);
    assert_eq!(registry.groups().len(), 1);

    // A beacon with drifted runtime fields updates in place.
    let mut drifted = header.clone();
    drifted.power_total = 900;
    send_beacon(&registry, &drifted).await;
    {
        let pusher = pusher.clone();
        wait_until(move || pusher.power_total() == 900).await;
    }
    assert_eq!(registry.pushers().len(), 1);

    // A beacon with different capabilities forces a replacement.
    let mut reconfigured = header.clone();
    reconfigured.pixels_per_strip = 8;
    send_beacon(&registry, &reconfigured).await;
    {
        let registry = registry.clone();
        let mac = mac.clone();
        wait_until(move || {
            registry
                .pusher_with_mac(&mac)
                .is_some_and(|p| p.header().pixels_per_strip == 8)
        })
        .await;
    }
    assert!(pusher.is_closed());

    // Observer callbacks arrived in lifecycle order.
    wait_until(|| recorder.disappeared.lock().unwrap().len() == 1).await;
    wait_until(|| recorder.appeared.lock().unwrap().len() == 2).await;
    assert_eq!(
        recorder.disappeared.lock().unwrap()[0],
        (mac.clone(), DisappearReason::CapabilityChanged)
    );

    registry.shutdown().await;
}

#[tokio::test]
async fn commands_and_frames_reach_the_controller() {
    let _guard = registry_lock().lock().await;
    let controller = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let controller_port = controller.local_addr().unwrap().port();

    let registry = Registry::new(test_settings()).await.unwrap();
    let delegate: Arc<dyn FrameDelegate> = Arc::new(RedPainter {
        registry: registry.clone(),
    });
    registry.set_frame_delegate(&delegate);

    let header = beacon(0x31, controller_port);
    send_beacon(&registry, &header).await;
    let pusher = wait_for_pusher(&registry, &header.mac_string()).await;

    pusher.enqueue_command(PusherCommand::reset());
    registry.start_pushing();
    assert!(registry.is_running());

    // The queued command rides first, alone in its own packet.
    let command_packet = recv_packet(&controller).await;
    assert_eq!(sequence_of(&command_packet), 1);
    assert_eq!(&command_packet[4..20], &COMMAND_MAGIC);
    assert_eq!(&command_packet[20..], &[0x01]);

    // Then the frame: strip number, pixel 0 red, the rest dark. The
    // default antilog curve is exact at the endpoints.
    let data_packet = recv_packet(&controller).await;
    assert_eq!(sequence_of(&data_packet), 2);
    assert_eq!(data_packet.len(), 4 + 1 + 4 * 3);
    assert_eq!(data_packet[4], 0);
    assert_eq!(&data_packet[5..8], &[0xff, 0x00, 0x00]);
    assert_eq!(&data_packet[8..], &[0u8; 9]);

    // Subsequent flushes resend the full frame with increasing sequences.
    let next = recv_packet(&controller).await;
    assert_eq!(sequence_of(&next), 3);
    assert_eq!(next[4..], data_packet[4..]);

    registry.stop_pushing().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn async_delegates_block_the_tick_until_render_finished() {
    let _guard = registry_lock().lock().await;
    let controller = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let controller_port = controller.local_addr().unwrap().port();

    let registry = Registry::new(test_settings()).await.unwrap();
    let sink = Arc::new(CaptureSink::default());
    registry.set_packet_sink(Some(sink.clone()));
    let renders = Arc::new(AtomicU32::new(0));
    let delegate: Arc<dyn FrameDelegate> = Arc::new(DeferredPainter {
        registry: registry.clone(),
        renders: renders.clone(),
    });
    registry.set_frame_delegate(&delegate);

    let header = beacon(0x91, controller_port);
    send_beacon(&registry, &header).await;
    wait_for_pusher(&registry, &header.mac_string()).await;

    registry.start_pushing();

    // Every datagram was rendered by the deferred task before it left,
    // and was mirrored to the capture sink.
    let packet = recv_packet(&controller).await;
    assert!(renders.load(Ordering::SeqCst) >= 1);
    assert_eq!(&packet[5..8], &[0x00, 0xff, 0x00]);
    {
        let sink = sink.clone();
        let expected = packet.clone();
        wait_until(move || sink.packets.lock().unwrap().first() == Some(&expected)).await;
    }

    registry.stop_pushing().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn flushes_split_across_the_strip_limit() {
    let _guard = registry_lock().lock().await;
    let controller = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let controller_port = controller.local_addr().unwrap().port();

    let registry = Registry::new(test_settings()).await.unwrap();
    let mut header = beacon(0x32, controller_port);
    header.strips_attached = 3;
    header.max_strips_per_packet = 2;
    header.strip_flags = vec![StripFlags::empty(); 3];
    send_beacon(&registry, &header).await;
    wait_for_pusher(&registry, &header.mac_string()).await;

    registry.start_pushing();

    // Strips {0, 1} and then {2}, with contiguous sequence numbers.
    let first = recv_packet(&controller).await;
    let second = recv_packet(&controller).await;
    assert_eq!(sequence_of(&first), 1);
    assert_eq!(sequence_of(&second), 2);
    assert_eq!(first.len(), 4 + 2 * 13);
    assert_eq!(first[4], 0);
    assert_eq!(first[4 + 13], 1);
    assert_eq!(second.len(), 4 + 13);
    assert_eq!(second[4], 2);

    let third = recv_packet(&controller).await;
    assert_eq!(sequence_of(&third), 3);
    assert_eq!(third[4], 0);

    registry.stop_pushing().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn autothrottle_backs_off_and_recovers() {
    let _guard = registry_lock().lock().await;
    let registry = Registry::new(test_settings()).await.unwrap();

    let mut header = beacon(0x33, 9897);
    header.update_period_usec = 16_000;
    header.delta_sequence = 4;

    // Three beacons reporting drops, 5 ms of backoff each.
    send_beacon(&registry, &header).await;
    let pusher = wait_for_pusher(&registry, &header.mac_string()).await;
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_beacon(&registry, &header).await;
    }
    {
        let pusher = pusher.clone();
        wait_until(move || pusher.extra_delay() == Duration::from_millis(15)).await;
    }

    // Clean beacons recover 1 ms at a time.
    header.delta_sequence = 0;
    send_beacon(&registry, &header).await;
    {
        let pusher = pusher.clone();
        wait_until(move || pusher.extra_delay() == Duration::from_millis(14)).await;
    }
    send_beacon(&registry, &header).await;
    {
        let pusher = pusher.clone();
        wait_until(move || pusher.extra_delay() == Duration::from_millis(13)).await;
    }

    registry.shutdown().await;
}

#[tokio::test]
async fn power_budget_scales_every_strip() {
    let _guard = registry_lock().lock().await;
    let controller_a = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let controller_b = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

    let mut settings = test_settings();
    settings.total_power_limit = 1000;
    let registry = Registry::new(settings).await.unwrap();

    let mut first = beacon(0x41, controller_a.local_addr().unwrap().port());
    first.power_total = 800;
    let mut second = beacon(0x42, controller_b.local_addr().unwrap().port());
    second.power_total = 400;
    second.controller_ordinal = 1;
    send_beacon(&registry, &first).await;
    send_beacon(&registry, &second).await;
    let pusher = wait_for_pusher(&registry, &first.mac_string()).await;
    wait_for_pusher(&registry, &second.mac_string()).await;

    registry.start_pushing();

    let expected = 1000.0f32 / 1200.0;
    {
        let registry = registry.clone();
        wait_until(move || (registry.power_scale() - expected).abs() < 1e-4).await;
    }
    assert_eq!(registry.total_power(), 1200);
    let strip_scale = pusher.strips()[0].power_scale();
    assert!((strip_scale - expected).abs() < 1e-4);

    registry.stop_pushing().await;
    registry.shutdown().await;
}

#[tokio::test]
async fn stop_pushing_honors_the_kill_policy() {
    let _guard = registry_lock().lock().await;
    let controller = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

    let mut settings = test_settings();
    settings.kill_pushers_when_not_running = true;
    let registry = Registry::new(settings).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    registry.set_observer(recorder.clone());

    let header = beacon(0x51, controller.local_addr().unwrap().port());
    send_beacon(&registry, &header).await;
    let pusher = wait_for_pusher(&registry, &header.mac_string()).await;

    // Commands fanned out to all pushers ride ahead of the first frame.
    registry.enqueue_command_in_all_pushers(&PusherCommand::reset());
    registry.start_pushing();
    let first = recv_packet(&controller).await;
    assert_eq!(&first[4..20], &COMMAND_MAGIC);
    registry.stop_pushing().await;

    assert!(pusher.is_closed());
    assert!(registry.pushers().is_empty());
    wait_until(|| {
        recorder
            .disappeared
            .lock()
            .unwrap()
            .iter()
            .any(|(_, reason)| *reason == DisappearReason::Stopped)
    })
    .await;

    registry.shutdown().await;
}

#[tokio::test]
async fn unseen_pushers_expire() {
    let _guard = registry_lock().lock().await;
    let registry = Registry::new(test_settings()).await.unwrap();
    let recorder = Arc::new(Recorder::default());
    registry.set_observer(recorder.clone());

    let header = beacon(0x61, 9897);
    send_beacon(&registry, &header).await;
    let mac = header.mac_string();
    wait_for_pusher(&registry, &mac).await;

    // The expiry threshold is max(2 s, 10x the update period).
    timeout(Duration::from_secs(10), async {
        while registry.pusher_with_mac(&mac).is_some() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("pusher never expired");
    wait_until(|| {
        recorder
            .disappeared
            .lock()
            .unwrap()
            .iter()
            .any(|(m, reason)| m == &mac && *reason == DisappearReason::Expired)
    })
    .await;

    registry.shutdown().await;
}

#[tokio::test]
async fn malformed_beacons_are_counted_and_dropped() {
    let _guard = registry_lock().lock().await;
    let registry = Registry::new(test_settings()).await.unwrap();

    let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let port = registry.discovery_addr().port();
    socket.send_to(&[1, 2, 3], ("127.0.0.1", port)).await.unwrap();
    {
        let registry = registry.clone();
        wait_until(move || registry.beacon_decode_errors() == 1).await;
    }
    assert!(registry.pushers().is_empty());

    // A well-formed beacon for a non-pusher device is ignored, without
    // counting as a decode error.
    let mut other = beacon(0x71, 9897);
    other.device_type = DeviceType::EtherDream;
    send_beacon(&registry, &other).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.pushers().is_empty());
    assert_eq!(registry.beacon_decode_errors(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn brightness_limit_scales_stored_pixels() {
    let _guard = registry_lock().lock().await;
    let controller = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let registry = Registry::new(test_settings()).await.unwrap();

    // Logarithmic strips bypass the intensity table, making the stored
    // bytes predictable.
    let mut header = beacon(0x81, controller.local_addr().unwrap().port());
    header.strip_flags = vec![StripFlags::LOGARITHMIC];
    send_beacon(&registry, &header).await;
    let pusher = wait_for_pusher(&registry, &header.mac_string()).await;

    {
        let mut strips = pusher.strips();
        for i in 0..4 {
            strips[0].set_pixel_rgb8(i, 200, 200, 200);
        }
    }
    let average = pusher.average_brightness();
    assert!((average - 200.0 / 255.0).abs() < 1e-3);

    // Above the limit: scaled down to exactly the limit.
    assert!(registry.scale_average_brightness_for_limit(0.5, true));
    assert!((pusher.average_brightness() - 0.5).abs() < 0.01);

    // Already below the limit: untouched.
    assert!(!registry.scale_average_brightness_for_limit(0.9, true));

    registry.shutdown().await;
}
