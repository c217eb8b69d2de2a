//! RelayMQ - MQTT v3.1/v3.1.1/v5.0 broker core
//!
//! Packet codec, topic matching, retained store, per-session queues with
//! QoS 1/2 delivery tracking, and a broker that ties them together over any
//! byte stream through a channel adapter.

pub mod broker;
pub mod channel;
pub mod codec;
pub mod config;
pub mod message;
pub mod protocol;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent};
pub use channel::{ChannelAdapter, ChannelError, MqttChannel};
pub use config::Config;
pub use message::ApplicationMessage;
pub use protocol::{Packet, ProtocolVersion, QoS};
pub use session::{Session, SessionStatus};
