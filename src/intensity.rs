//! The process-wide intensity lookup table.
//!
//! Pixel components pass through a precomputed table translating linear
//! input to perceptually corrected 16-bit output. A single table serves
//! every strip in the process, so precise output is possible even when
//! pushers of different bit depths are active at once; 8-bit pushers
//! simply drop the low byte.
//!
//! The table starts at 256 entries. The first 16-bit pixel write (or an
//! explicit [`bump_to_16bit`]) rebuilds it at 65536 entries. Rebuilds
//! happen under a lock; readers clone the `Arc` to the current table and
//! then read it lock-free.

use std::sync::{Arc, Mutex, OnceLock};

/// An intensity curve maps inputs in `[0, 1]` to outputs in `[0, 1]`.
///
/// The curve function is called repeatedly during table rebuilds, possibly
/// from more than one thread at a time; it must be reentrant.
pub type CurveFn = dyn Fn(f32) -> f32 + Send + Sync;

/// The default curve: `(e^x - 1) / (e - 1)`, the inverse of the antilog
/// correction most LED drivers expect.
pub fn antilog_curve(input: f32) -> f32 {
    ((input.exp() - 1.0) / (std::f32::consts::E - 1.0)).clamp(0.0, 1.0)
}

/// An identity curve, for pushers that want raw linear output.
pub fn linear_curve(input: f32) -> f32 {
    input
}

/// A read-only intensity lookup, 256 or 65536 entries of u16 output.
pub struct IntensityTable {
    values: Box<[u16]>,
}

impl IntensityTable {
    fn build(curve: &CurveFn, len: usize) -> IntensityTable {
        let top = (len - 1) as f32;
        let values = (0..len)
            .map(|i| {
                let out = curve(i as f32 / top).clamp(0.0, 1.0);
                (out * 65535.0).round() as u16
            })
            .collect::<Vec<u16>>()
            .into_boxed_slice();
        IntensityTable { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Looks up an 8-bit component. Works at either table size: on the
    /// 65536-entry table, byte `v` maps to index `v * 257`, which evaluates
    /// the curve at exactly the same `v / 255` position as the small table.
    pub fn lookup8(&self, v: u8) -> u16 {
        if self.values.len() == 256 {
            self.values[v as usize]
        } else {
            self.values[v as usize * 257]
        }
    }

    /// Looks up a 16-bit component. Callers bump the table before using
    /// 16-bit inputs; on a 256-entry table the low byte is dropped.
    pub fn lookup16(&self, v: u16) -> u16 {
        if self.values.len() == 65536 {
            self.values[v as usize]
        } else {
            self.values[(v >> 8) as usize]
        }
    }
}

struct TableState {
    curve: Arc<CurveFn>,
    table: Arc<IntensityTable>,
}

static STATE: OnceLock<Mutex<TableState>> = OnceLock::new();

fn state() -> &'static Mutex<TableState> {
    STATE.get_or_init(|| {
        Mutex::new(TableState {
            curve: Arc::new(antilog_curve),
            table: Arc::new(IntensityTable::build(&antilog_curve, 256)),
        })
    })
}

/// Replaces the process-wide intensity curve and rebuilds the table at its
/// current precision.
///
/// The function may be called at any time from any thread and must be
/// reentrant; see [`CurveFn`].
pub fn set_curve(curve: impl Fn(f32) -> f32 + Send + Sync + 'static) {
    let mut state = state().lock().unwrap();
    state.curve = Arc::new(curve);
    let len = state.table.len();
    state.table = Arc::new(IntensityTable::build(&*state.curve, len));
}

/// Rebuilds the table at 65536 entries if it is still at 256.
pub fn bump_to_16bit() {
    let mut state = state().lock().unwrap();
    if state.table.len() < 65536 {
        let curve = Arc::clone(&state.curve);
        state.table = Arc::new(IntensityTable::build(&*curve, 65536));
    }
}

/// A snapshot of the current table for a batch of lock-free reads.
pub fn current() -> Arc<IntensityTable> {
    Arc::clone(&state().lock().unwrap().table)
}

/// A snapshot guaranteed to be at 16-bit precision.
pub fn current_16bit() -> Arc<IntensityTable> {
    bump_to_16bit();
    current()
}

/// Translates one 8-bit component through the current table.
pub fn lookup8(v: u8) -> u16 {
    current().lookup8(v)
}

/// Translates one 16-bit component, bumping the table first.
pub fn lookup16(v: u16) -> u16 {
    current_16bit().lookup16(v)
}
