//! `guidance-middleware` – The Message Bus
//!
//! Routes typed messages between guidance components without any component
//! holding a reference to another.
//!
//! # Modules
//!
//! - [`bus`] – [`ChannelRegistry`]: one shared channel per topic name, split
//!   into a [`PublicationChannel`] and a [`SubscriptionChannel`] handle.

pub mod bus;

pub use bus::{
    ChannelRegistry, DeliveryReport, Handler, HandlerId, Message, PublicationChannel,
    SubscriptionChannel, Topic,
};
