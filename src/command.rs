//! Out-of-band administrative commands.
//!
//! A command rides in its own packet, interleaved with frame data: the
//! pusher drains one queued command per flush, ahead of that flush's data
//! packets. On the wire a command packet is the u32 sequence prefix, a
//! 16-byte magic marker, one type byte, and a type-specific payload.

use crate::wire::PacketWriter;

/// Marker that distinguishes a command packet from pixel data.
pub const COMMAND_MAGIC: [u8; 16] = [
    0x40, 0x09, 0x2d, 0xa6, 0x15, 0xa5, 0xdd, 0xe5, 0x6a, 0x9d, 0x4d, 0x5a, 0xcf, 0x09, 0xaf, 0x50,
];

const COMMAND_RESET: u8 = 0x01;
const COMMAND_GLOBAL_BRIGHTNESS: u8 = 0x02;
const COMMAND_WIFI_CONFIGURE: u8 = 0x03;
const COMMAND_LED_CONFIGURE: u8 = 0x04;
const COMMAND_STRIP_BRIGHTNESS: u8 = 0x05;

/// Wi-Fi security modes for [`PusherCommand::wifi_configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    None = 0,
    Wep = 1,
    Wpa = 2,
    Wpa2 = 3,
}

/// LED driver chips selectable through [`PusherCommand::led_configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripType {
    Lpd8806 = 0,
    Ws2801 = 1,
    Ws2811 = 2,
    Apa102 = 3,
}

/// Color component orders selectable through [`PusherCommand::led_configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentOrdering {
    Rgb = 0,
    Rbg = 1,
    Gbr = 2,
    Grb = 3,
    Bgr = 4,
    Brg = 5,
}

/// One administrative command, encoded at construction.
///
/// Enqueue with `Pusher::enqueue_command` or fan out with
/// `Registry::enqueue_command_in_all_pushers`.
#[derive(Debug, Clone)]
pub struct PusherCommand {
    encoded: Vec<u8>,
}

impl PusherCommand {
    /// Reboots the controller.
    pub fn reset() -> PusherCommand {
        Self::build(COMMAND_RESET, 0, |_| {})
    }

    /// Sets the hardware global brightness, for pushers that advertise
    /// `PusherFlags::GLOBAL_BRIGHTNESS`.
    pub fn global_brightness(brightness: u16) -> PusherCommand {
        Self::build(COMMAND_GLOBAL_BRIGHTNESS, 2, |w| w.put_u16(brightness))
    }

    /// Sets one strip's hardware brightness, for pushers that advertise
    /// `PusherFlags::STRIP_BRIGHTNESS`.
    pub fn strip_brightness(strip: u8, brightness: u16) -> PusherCommand {
        Self::build(COMMAND_STRIP_BRIGHTNESS, 3, |w| {
            w.put_u8(strip);
            w.put_u16(brightness);
        })
    }

    /// Points the controller at a Wi-Fi network. The ssid and key travel
    /// as NUL-terminated strings.
    pub fn wifi_configure(ssid: &str, key: &str, security: SecurityType) -> PusherCommand {
        Self::build(COMMAND_WIFI_CONFIGURE, ssid.len() + key.len() + 3, |w| {
            w.put_bytes(ssid.as_bytes());
            w.put_u8(0);
            w.put_bytes(key.as_bytes());
            w.put_u8(0);
            w.put_u8(security as u8);
        })
    }

    /// Reconfigures the controller's LED layout and addressing.
    #[allow(clippy::too_many_arguments)]
    pub fn led_configure(
        strip_count: u32,
        pixels_per_strip: u32,
        strip_types: [StripType; 8],
        component_orderings: [ComponentOrdering; 8],
        group: u16,
        controller: u16,
        artnet_universe: u16,
        artnet_channel: u16,
    ) -> PusherCommand {
        Self::build(COMMAND_LED_CONFIGURE, 32, |w| {
            w.put_u32(strip_count);
            w.put_u32(pixels_per_strip);
            for t in strip_types {
                w.put_u8(t as u8);
            }
            for o in component_orderings {
                w.put_u8(o as u8);
            }
            w.put_u16(group);
            w.put_u16(controller);
            w.put_u16(artnet_universe);
            w.put_u16(artnet_channel);
        })
    }

    /// Reconfigures the LED layout, leaving group, controller and Art-Net
    /// addressing at zero.
    pub fn led_configure_layout(
        strip_count: u32,
        pixels_per_strip: u32,
        strip_types: [StripType; 8],
        component_orderings: [ComponentOrdering; 8],
    ) -> PusherCommand {
        Self::led_configure(
            strip_count,
            pixels_per_strip,
            strip_types,
            component_orderings,
            0,
            0,
            0,
            0,
        )
    }

    fn build(command_type: u8, payload_len: usize, fill: impl FnOnce(&mut PacketWriter)) -> Self {
        let mut w = PacketWriter::with_capacity(COMMAND_MAGIC.len() + 1 + payload_len);
        w.put_bytes(&COMMAND_MAGIC);
        w.put_u8(command_type);
        fill(&mut w);
        PusherCommand {
            encoded: w.into_vec(),
        }
    }

    /// The command's on-wire bytes, everything after the sequence prefix.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// The command type byte.
    pub fn command_type(&self) -> u8 {
        self.encoded[COMMAND_MAGIC.len()]
    }
}
