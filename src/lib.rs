//! A client library for PixelPusher LED controllers.
//!
//! PixelPusher controllers announce themselves with broadcast UDP beacons
//! and accept frames of per-pixel color data over unicast UDP, paced to
//! each controller's advertised update period. This crate handles the
//! whole conversation:
//!
//!  * discovery and expiry of controllers via their beacons,
//!  * per-controller packet assembly, sequencing and paced transmission,
//!  * an integral "autothrottle" that backs off controllers reporting
//!    dropped packets,
//!  * a global electrical power budget enforced by scaling pixel output,
//!  * per-component brightness and a configurable intensity curve,
//!  * reliable interleaving of administrative commands (reset,
//!    brightness, Wi-Fi and LED configuration) with frame data.
//!
//! The main entry point is [`Registry::new`]. Register a [`FrameDelegate`]
//! to fill strip pixel buffers at the start of each frame, then call
//! [`Registry::start_pushing`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use pixelpusher_client::{FrameDelegate, Registry, RegistrySettings};
//!
//! struct Rainbow { registry: Registry }
//!
//! impl FrameDelegate for Rainbow {
//!     fn render_start(&self) -> bool {
//!         for pusher in self.registry.pushers() {
//!             for strip in pusher.strips().iter_mut() {
//!                 for i in 0..strip.logical_pixel_count() {
//!                     strip.set_pixel_rgb8(i, 255, 64, 0);
//!                 }
//!             }
//!         }
//!         true // rendering finished synchronously
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pixelpusher_client::Error> {
//!     let registry = Registry::new(RegistrySettings::default()).await?;
//!     let delegate: Arc<dyn FrameDelegate> =
//!         Arc::new(Rainbow { registry: registry.clone() });
//!     registry.set_frame_delegate(&delegate);
//!     registry.start_pushing();
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

mod command;
mod error;
mod group;
mod header;
pub mod intensity;
mod observer;
mod pusher;
mod registry;
mod strip;
mod wire;

pub use command::{ComponentOrdering, PusherCommand, SecurityType, StripType, COMMAND_MAGIC};
pub use error::{Error, Result};
pub use group::PusherGroup;
pub use header::{DeviceType, PusherFlags, PusherHeader, StripFlags, MAX_STRIPS_PER_PUSHER};
pub use observer::{DisappearReason, FrameDelegate, PacketSink, RegistryObserver};
pub use pusher::{Lifecycle, Pusher, PACKET_SIZE_LIMIT};
pub use registry::{Registry, RegistrySettings, DEFAULT_DISCOVERY_PORT};
pub use strip::Strip;
