//! Parsing of the discovery beacons that pushers broadcast once a second.
//!
//! A beacon starts with a fixed device header (MAC, IP, device type,
//! revisions, link speed). For PixelPusher devices it continues with the
//! capability and runtime fields described by [`PusherHeader`], and ends
//! with one flags byte per attached strip.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::wire::{format_mac, BeaconReader, PacketWriter};

/// Device types that announce themselves on the discovery port.
///
/// Only [`DeviceType::PixelPusher`] devices are operable by this crate;
/// the other types are recognized so their beacons can be skipped without
/// being counted as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    EtherDream,
    LumiaBridge,
    PixelPusher,
}

impl DeviceType {
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DeviceType::EtherDream),
            1 => Ok(DeviceType::LumiaBridge),
            2 => Ok(DeviceType::PixelPusher),
            other => Err(Error::UnknownDevice(other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            DeviceType::EtherDream => 0,
            DeviceType::LumiaBridge => 1,
            DeviceType::PixelPusher => 2,
        }
    }
}

bitflags! {
    /// Controller-wide capability flags from the beacon.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PusherFlags: u32 {
        /// Pusher is marked as protected.
        const PROTECTED = 1 << 0;
        /// Pusher requires fixed size datagrams.
        const FIXED_SIZE = 1 << 1;
        /// Pusher accepts the global-brightness command.
        const GLOBAL_BRIGHTNESS = 1 << 2;
        /// Pusher accepts the per-strip brightness command.
        const STRIP_BRIGHTNESS = 1 << 3;
    }
}

bitflags! {
    /// Per-strip flags from the beacon's trailing flags array.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StripFlags: u32 {
        /// Strip uses COW pixel ordering; every logical pixel expands to
        /// eight output cells.
        const RGBOW = 1 << 0;
        /// Strip takes 48 bits per pixel (R16 G16 B16).
        const WIDE_PIXELS = 1 << 1;
        /// Strip applies its own antilog correction; the intensity table
        /// is bypassed.
        const LOGARITHMIC = 1 << 2;
        /// Strip is actually a motion control device.
        const MOTION = 1 << 3;
        /// Repeated writes of the same data have side effects.
        const NOT_IDEMPOTENT = 1 << 4;
        /// Strip hardware supports per-strip brightness.
        const BRIGHTNESS = 1 << 5;
    }
}

/// Software revisions at or above this send pusherFlags as a u32 instead
/// of a u16.
const SW_REVISION_WIDE_PUSHER_FLAGS: u16 = 121;

/// Strip count cap, matching the fixed-size arrays in the LED-configure
/// command payload.
pub const MAX_STRIPS_PER_PUSHER: usize = 8;

/// An immutable capability record parsed from one discovery beacon.
///
/// The registry compares these across beacons: fields that may never
/// change for a live pusher are checked by [`PusherHeader::capabilities_match`],
/// while `update_period_usec`, `power_total` and `delta_sequence` are
/// expected to drift and are folded into the existing pusher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherHeader {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub device_type: DeviceType,
    pub protocol_version: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub hw_revision: u16,
    pub sw_revision: u16,
    /// Link speed in bits per second.
    pub link_speed: u32,

    // PixelPusher extension; all zero for other device types.
    pub strips_attached: u8,
    pub max_strips_per_packet: u8,
    pub pixels_per_strip: u16,
    pub update_period_usec: u32,
    pub power_total: u32,
    pub delta_sequence: u32,
    pub controller_ordinal: u32,
    pub group_ordinal: u32,
    pub artnet_universe: u16,
    pub artnet_channel: u16,
    pub port: u16,
    pub pusher_flags: PusherFlags,
    pub segments: Option<u32>,
    pub power_domain: Option<u32>,
    pub strip_flags: Vec<StripFlags>,
}

impl PusherHeader {
    /// Decodes a beacon datagram.
    ///
    /// Fails with [`Error::BadPacket`] when the packet is shorter than the
    /// declared device type allows, and with [`Error::UnknownDevice`] when
    /// the device type byte is not recognized.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let mut r = BeaconReader::new(packet);
        let mac = r.read_mac()?;
        let ip = r.read_ipv4()?;
        let device_type = DeviceType::from_wire(r.read_u8()?)?;
        let protocol_version = r.read_u8()?;
        let vendor_id = r.read_u16()?;
        let product_id = r.read_u16()?;
        let hw_revision = r.read_u16()?;
        let sw_revision = r.read_u16()?;
        let link_speed = r.read_u32()?;

        let mut header = PusherHeader {
            mac,
            ip,
            device_type,
            protocol_version,
            vendor_id,
            product_id,
            hw_revision,
            sw_revision,
            link_speed,
            strips_attached: 0,
            max_strips_per_packet: 0,
            pixels_per_strip: 0,
            update_period_usec: 0,
            power_total: 0,
            delta_sequence: 0,
            controller_ordinal: 0,
            group_ordinal: 0,
            artnet_universe: 0,
            artnet_channel: 0,
            port: 0,
            pusher_flags: PusherFlags::empty(),
            segments: None,
            power_domain: None,
            strip_flags: Vec::new(),
        };

        if device_type != DeviceType::PixelPusher {
            return Ok(header);
        }

        let declared_strips = r.read_u8()?;
        if declared_strips == 0 {
            return Err(Error::BadPacket("pusher declares zero strips"));
        }
        if declared_strips as usize > MAX_STRIPS_PER_PUSHER {
            log::warn!(
                "Pusher {} declares {} strips, capping at {}",
                format_mac(&mac),
                declared_strips,
                MAX_STRIPS_PER_PUSHER
            );
        }
        header.strips_attached = declared_strips.min(MAX_STRIPS_PER_PUSHER as u8);
        header.max_strips_per_packet = r.read_u8()?.max(1);
        header.pixels_per_strip = r.read_u16()?;
        if header.pixels_per_strip == 0 {
            return Err(Error::BadPacket("pusher declares zero pixels per strip"));
        }
        header.update_period_usec = r.read_u32()?;
        header.power_total = r.read_u32()?;
        header.delta_sequence = r.read_u32()?;
        header.controller_ordinal = r.read_u32()?;
        header.group_ordinal = r.read_u32()?;
        header.artnet_universe = r.read_u16()?;
        header.artnet_channel = r.read_u16()?;
        header.port = r.read_u16()?;

        // The pusherFlags width depends on the software revision; the
        // chosen width shifts every subsequent field offset.
        let raw_flags = if sw_revision >= SW_REVISION_WIDE_PUSHER_FLAGS {
            r.read_u32()?
        } else {
            u32::from(r.read_u16()?)
        };
        header.pusher_flags = PusherFlags::from_bits_truncate(raw_flags);

        // segments and powerDomain were appended in later firmware; they
        // are present when enough bytes remain ahead of the trailing
        // per-strip flags array.
        let flags_len = declared_strips as usize;
        if r.remaining() >= 4 + flags_len {
            header.segments = Some(r.read_u32()?);
        }
        if r.remaining() >= 4 + flags_len {
            header.power_domain = Some(r.read_u32()?);
        }

        if r.remaining() < flags_len {
            return Err(Error::BadPacket("strip flags array truncated"));
        }
        let flag_bytes = r.read_bytes(flags_len)?;
        header.strip_flags = flag_bytes
            .iter()
            .take(MAX_STRIPS_PER_PUSHER)
            .map(|&b| StripFlags::from_bits_truncate(u32::from(b)))
            .collect();

        Ok(header)
    }

    /// Re-encodes the header as a beacon datagram.
    ///
    /// Decoding a valid beacon and encoding the result reproduces the
    /// original bytes for beacons declaring at most
    /// [`MAX_STRIPS_PER_PUSHER`] strips; beyond that cap the strip count
    /// and flags array come back truncated to the cap.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = PacketWriter::with_capacity(84);
        w.put_bytes(&self.mac);
        w.put_bytes(&self.ip.octets());
        w.put_u8(self.device_type.to_wire());
        w.put_u8(self.protocol_version);
        w.put_u16(self.vendor_id);
        w.put_u16(self.product_id);
        w.put_u16(self.hw_revision);
        w.put_u16(self.sw_revision);
        w.put_u32(self.link_speed);
        if self.device_type != DeviceType::PixelPusher {
            return w.into_vec();
        }
        w.put_u8(self.strips_attached);
        w.put_u8(self.max_strips_per_packet);
        w.put_u16(self.pixels_per_strip);
        w.put_u32(self.update_period_usec);
        w.put_u32(self.power_total);
        w.put_u32(self.delta_sequence);
        w.put_u32(self.controller_ordinal);
        w.put_u32(self.group_ordinal);
        w.put_u16(self.artnet_universe);
        w.put_u16(self.artnet_channel);
        w.put_u16(self.port);
        if self.sw_revision >= SW_REVISION_WIDE_PUSHER_FLAGS {
            w.put_u32(self.pusher_flags.bits());
        } else {
            w.put_u16(self.pusher_flags.bits() as u16);
        }
        if let Some(segments) = self.segments {
            w.put_u32(segments);
        }
        if let Some(power_domain) = self.power_domain {
            w.put_u32(power_domain);
        }
        for flags in &self.strip_flags {
            w.put_u8(flags.bits() as u8);
        }
        w.into_vec()
    }

    /// The MAC address in the `xx:xx:xx:xx:xx:xx` form used to key the
    /// registry's pusher map.
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }

    pub fn ip_string(&self) -> String {
        self.ip.to_string()
    }

    /// The unicast destination for this pusher's data and command packets.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Whether `other` describes the same hardware configuration.
    ///
    /// A beacon whose MAC matches an existing pusher but whose capability
    /// fields differ requires destroying and recreating the pusher; only
    /// `update_period_usec`, `power_total` and `delta_sequence` may drift.
    pub fn capabilities_match(&self, other: &PusherHeader) -> bool {
        self.mac == other.mac
            && self.ip == other.ip
            && self.port == other.port
            && self.strips_attached == other.strips_attached
            && self.max_strips_per_packet == other.max_strips_per_packet
            && self.pixels_per_strip == other.pixels_per_strip
            && self.controller_ordinal == other.controller_ordinal
            && self.group_ordinal == other.group_ordinal
            && self.artnet_universe == other.artnet_universe
            && self.artnet_channel == other.artnet_channel
            && self.pusher_flags == other.pusher_flags
            && self.strip_flags == other.strip_flags
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A plausible beacon record for tests; strips and addressing can be
    /// adjusted per test.
    pub(crate) fn test_header(mac_low: u8, port: u16) -> PusherHeader {
        PusherHeader {
            mac: [0x00, 0x04, 0xa3, 0x00, 0x00, mac_low],
            ip: Ipv4Addr::new(192, 168, 1, 40),
            device_type: DeviceType::PixelPusher,
            protocol_version: 1,
            vendor_id: 3,
            product_id: 2,
            hw_revision: 2,
            sw_revision: 122,
            link_speed: 100_000_000,
            strips_attached: 2,
            max_strips_per_packet: 2,
            pixels_per_strip: 16,
            update_period_usec: 16_000,
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
            strip_flags: vec![StripFlags::empty(), StripFlags::empty()],
        }
    }
}
