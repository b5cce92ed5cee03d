//! # murmur-bus
//!
//! Publish/subscribe abstraction for the Murmur chat engine.
//!
//! The engine only needs three primitives from a broker: publish a payload
//! to a topic, subscribe to a topic and receive its payloads in order, and
//! release a topic. [`Bus`] and [`Inbound`] capture exactly that, so a
//! networked broker can replace the in-process [`LocalBus`].
//!
//! ```rust,ignore
//! use murmur_bus::{Bus, LocalBus};
//!
//! let bus = LocalBus::new();
//! let mut inbound = bus.subscribe("room-1")?;
//! bus.publish("room-1", payload)?;
//! let received = inbound.recv().await;
//! ```

pub mod local;
pub mod traits;

pub use local::{BusStats, LocalBus};
pub use traits::{validate_topic, Bus, BusError, Inbound};
