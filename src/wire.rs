//! Little-endian cursor reads and writes for the discovery and data wire
//! formats. All multi-byte integers on the wire are little-endian.

use std::net::Ipv4Addr;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Reads little-endian integers from a byte slice, front to back.
pub struct BeaconReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BeaconReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::BadPacket("packet truncated"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_mac(&mut self) -> Result<[u8; 6]> {
        let slice = self.take(6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(slice);
        Ok(mac)
    }

    pub fn read_ipv4(&mut self) -> Result<Ipv4Addr> {
        let slice = self.take(4)?;
        Ok(Ipv4Addr::new(slice[0], slice[1], slice[2], slice[3]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }
}

/// Appends little-endian integers to an owned buffer. Packet assembly
/// sizes its buffers up front, so writes are infallible.
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Formats a MAC address the way pushers are keyed in the registry:
/// lowercase hex octets joined by colons.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut r = BeaconReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x01);
        assert_eq!(r.read_u16().unwrap(), 0x0302);
        assert_eq!(r.read_u32().unwrap(), 0x07060504);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let data = [0x01, 0x02];
        let mut r = BeaconReader::new(&data);
        assert!(matches!(r.read_u32(), Err(Error::BadPacket(_))));
    }

    #[test]
    fn writer_round_trips_reader() {
        let mut w = PacketWriter::with_capacity(16);
        w.put_u32(0xdeadbeef);
        w.put_u16(0x1234);
        w.put_u8(0x56);
        let buf = w.into_vec();
        let mut r = BeaconReader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u8().unwrap(), 0x56);
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0xab, 0x00, 0x12, 0xff, 0x01, 0x9c]),
            "ab:00:12:ff:01:9c"
        );
    }
}
