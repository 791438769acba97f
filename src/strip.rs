//! Pixel storage and serialization for one LED strip.
//!
//! A strip owns the exact bytes that will travel in its slice of a data
//! packet: one leading strip-number byte, then one 3-byte (or 6-byte, for
//! wide strips) cell per output pixel. Pixel writes run through the
//! brightness pipeline and the process-wide intensity table as they land,
//! so serialization is a straight copy.
//!
//! Strips are single-writer: the frame delegate writes pixels, the owning
//! pusher serializes. No locking happens inside the strip itself.

use crate::error::{Error, Result};
use crate::header::StripFlags;
use crate::intensity::{self, IntensityTable};

const RED: usize = 0;
const GREEN: usize = 1;
const BLUE: usize = 2;

/// RGBOW strips replicate every logical pixel across eight output cells.
const RGBOW_EXPANSION: u32 = 8;

pub struct Strip {
    number: u32,
    flags: StripFlags,
    /// Logical pixels addressable by the pixel-write methods.
    logical_pixels: u32,
    /// Output pixels on the wire; 8x the logical count for RGBOW.
    pixel_count: u32,
    bytes_per_pixel: usize,
    data: Vec<u8>,
    touched: bool,
    power_scale: f32,
    brightness_scale: [f32; 3],
    global_brightness: [f32; 3],
}

impl Strip {
    /// Creates a strip. `pixels_per_strip` is the pusher's advertised
    /// value; the wire pixel count is derived from it and the flags.
    pub fn new(number: u32, pixels_per_strip: u32, flags: StripFlags) -> Strip {
        let pixel_count = if flags.contains(StripFlags::RGBOW) {
            pixels_per_strip * RGBOW_EXPANSION
        } else {
            pixels_per_strip
        };
        let bytes_per_pixel = if flags.contains(StripFlags::WIDE_PIXELS) {
            6
        } else {
            3
        };
        let data = vec![0u8; 1 + pixel_count as usize * bytes_per_pixel];
        let mut strip = Strip {
            number,
            flags,
            logical_pixels: pixels_per_strip,
            pixel_count,
            bytes_per_pixel,
            data,
            touched: false,
            power_scale: 1.0,
            brightness_scale: [1.0; 3],
            global_brightness: [1.0; 3],
        };
        strip.data[0] = number as u8;
        strip
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn flags(&self) -> StripFlags {
        self.flags
    }

    /// Output pixels on the wire.
    pub fn pixel_count(&self) -> u32 {
        self.pixel_count
    }

    /// Pixels addressable by the write methods.
    pub fn logical_pixel_count(&self) -> u32 {
        self.logical_pixels
    }

    pub fn is_wide(&self) -> bool {
        self.flags.contains(StripFlags::WIDE_PIXELS)
    }

    pub fn supports_hardware_brightness(&self) -> bool {
        self.flags.contains(StripFlags::BRIGHTNESS)
    }

    /// Whether any pixel has been written since the last serialization.
    /// Advisory only; serialization always emits the full frame.
    pub fn touched(&self) -> bool {
        self.touched
    }

    /// The exact number of bytes this strip contributes to a data packet.
    pub fn packet_len(&self) -> usize {
        self.data.len()
    }

    pub fn power_scale(&self) -> f32 {
        self.power_scale
    }

    /// Sets the power-budget factor applied to subsequent pixel writes.
    pub fn set_power_scale(&mut self, scale: f32) {
        self.power_scale = scale.clamp(0.0, 1.0);
    }

    pub fn brightness_scale(&self) -> (f32, f32, f32) {
        let [r, g, b] = self.brightness_scale;
        (r, g, b)
    }

    /// Sets the per-strip brightness factors applied to subsequent writes.
    pub fn set_brightness_scale(&mut self, red: f32, green: f32, blue: f32) {
        self.brightness_scale = [red.max(0.0), green.max(0.0), blue.max(0.0)];
    }

    /// Registry/pusher brightness, folded in by the owning pusher.
    pub(crate) fn set_global_brightness(&mut self, red: f32, green: f32, blue: f32) {
        self.global_brightness = [red.max(0.0), green.max(0.0), blue.max(0.0)];
    }

    fn factor(&self, channel: usize) -> f32 {
        self.brightness_scale[channel] * self.power_scale * self.global_brightness[channel]
    }

    fn shade8(&self, table: &IntensityTable, raw: u8, channel: usize) -> u16 {
        let scaled = (f32::from(raw) * self.factor(channel))
            .clamp(0.0, 255.0)
            .round() as u8;
        if self.flags.contains(StripFlags::LOGARITHMIC) {
            u16::from(scaled) << 8
        } else {
            table.lookup8(scaled)
        }
    }

    fn shade16(&self, table: &IntensityTable, raw: u16, channel: usize) -> u16 {
        let scaled = (f32::from(raw) * self.factor(channel))
            .clamp(0.0, 65535.0)
            .round() as u16;
        if self.flags.contains(StripFlags::LOGARITHMIC) {
            scaled
        } else {
            table.lookup16(scaled)
        }
    }

    /// Writes one pixel from 8-bit components through the 256-entry table.
    pub fn set_pixel_rgb8(&mut self, index: u32, red: u8, green: u8, blue: u8) {
        if index >= self.logical_pixels {
            return;
        }
        let table = intensity::current();
        let r = self.shade8(&table, red, RED);
        let g = self.shade8(&table, green, GREEN);
        let b = self.shade8(&table, blue, BLUE);
        self.store_pixel(index, r, g, b);
    }

    /// Writes one pixel from 16-bit components. Bumps the intensity table
    /// to 65536 entries on first use.
    pub fn set_pixel_rgb16(&mut self, index: u32, red: u16, green: u16, blue: u16) {
        if index >= self.logical_pixels {
            return;
        }
        let table = intensity::current_16bit();
        let r = self.shade16(&table, red, RED);
        let g = self.shade16(&table, green, GREEN);
        let b = self.shade16(&table, blue, BLUE);
        self.store_pixel(index, r, g, b);
    }

    /// Writes one pixel from float components in `[0, 1]`, clamped then
    /// scaled to the 16-bit path. Bumps the intensity table.
    pub fn set_pixel_rgbf(&mut self, index: u32, red: f32, green: f32, blue: f32) {
        let to16 = |v: f32| (v.clamp(0.0, 1.0) * 65535.0).round() as u16;
        self.set_pixel_rgb16(index, to16(red), to16(green), to16(blue));
    }

    /// Fast path for pre-curved bytes: copies up to `pixel_count` output
    /// pixels of raw payload directly, bypassing the brightness pipeline
    /// and the intensity table.
    pub fn set_pixels_from_bytes(&mut self, pixel_count: u32, bytes: &[u8]) {
        let area = &mut self.data[1..];
        let wanted = pixel_count as usize * self.bytes_per_pixel;
        let n = wanted.min(bytes.len()).min(area.len());
        area[..n].copy_from_slice(&bytes[..n]);
        self.touched = true;
    }

    fn store_pixel(&mut self, index: u32, r: u16, g: u16, b: u16) {
        if self.flags.contains(StripFlags::RGBOW) {
            // COW ordering: five white cells carrying the grayscale
            // luminance, then the source components.
            let w = ((u32::from(r) + u32::from(g) + u32::from(b)) / 3) as u16;
            let base = index * RGBOW_EXPANSION;
            for cell in 0..5 {
                self.store_cell(base + cell, w);
            }
            self.store_cell(base + 5, r);
            self.store_cell(base + 6, g);
            self.store_cell(base + 7, b);
        } else {
            let off = 1 + index as usize * self.bytes_per_pixel;
            if self.is_wide() {
                self.data[off..off + 6].copy_from_slice(&[
                    (r >> 8) as u8,
                    r as u8,
                    (g >> 8) as u8,
                    g as u8,
                    (b >> 8) as u8,
                    b as u8,
                ]);
            } else {
                self.data[off..off + 3].copy_from_slice(&[
                    (r >> 8) as u8,
                    (g >> 8) as u8,
                    (b >> 8) as u8,
                ]);
            }
        }
        self.touched = true;
    }

    /// Stores one homogeneous output cell (all three components carry the
    /// same value), used for the RGBOW expansion.
    fn store_cell(&mut self, cell: u32, v: u16) {
        let off = 1 + cell as usize * self.bytes_per_pixel;
        if self.is_wide() {
            let hi = (v >> 8) as u8;
            let lo = v as u8;
            self.data[off..off + 6].copy_from_slice(&[hi, lo, hi, lo, hi, lo]);
        } else {
            let hi = (v >> 8) as u8;
            self.data[off..off + 3].copy_from_slice(&[hi, hi, hi]);
        }
    }

    /// Multiplies the currently stored pixel values by `scale`, once.
    ///
    /// Unlike the brightness factors, which shape future writes, this
    /// permanently modifies what is already stored.
    pub fn scale_average_brightness(&mut self, scale: f32) {
        let scale = scale.max(0.0);
        if self.is_wide() {
            for cell in self.data[1..].chunks_exact_mut(2) {
                let v = u16::from_be_bytes([cell[0], cell[1]]);
                let scaled = (f32::from(v) * scale).clamp(0.0, 65535.0).round() as u16;
                cell.copy_from_slice(&scaled.to_be_bytes());
            }
        } else {
            for byte in &mut self.data[1..] {
                *byte = (f32::from(*byte) * scale).clamp(0.0, 255.0).round() as u8;
            }
        }
    }

    /// Mean of all stored components relative to full scale. The stored
    /// values already include the brightness and power factors.
    pub fn average_brightness(&self) -> f32 {
        let payload = &self.data[1..];
        if payload.is_empty() {
            return 0.0;
        }
        if self.is_wide() {
            let sum: u64 = payload
                .chunks_exact(2)
                .map(|c| u64::from(u16::from_be_bytes([c[0], c[1]])))
                .sum();
            sum as f32 / (payload.len() / 2) as f32 / 65535.0
        } else {
            let sum: u64 = payload.iter().map(|&b| u64::from(b)).sum();
            sum as f32 / payload.len() as f32 / 255.0
        }
    }

    /// Copies the strip's wire payload into `buffer` and clears the
    /// touched flag. Returns the number of bytes written.
    pub fn serialize_into(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let needed = self.data.len();
        if buffer.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: buffer.len(),
            });
        }
        buffer[..needed].copy_from_slice(&self.data);
        self.touched = false;
        Ok(needed)
    }

    /// The wire payload for a packet under assembly. Clears the touched
    /// flag, like [`Strip::serialize_into`].
    pub(crate) fn wire_bytes(&mut self) -> &[u8] {
        self.touched = false;
        &self.data
    }

    #[cfg(test)]
    fn payload(&self) -> &[u8] {
        &self.data[1..]
    }
}
