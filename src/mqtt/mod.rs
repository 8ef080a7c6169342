//! # MQTT Integration Module
//!
//! Connects the device registry to the broker. Devices publish through the
//! outbox capability, inbound messages are routed by the dispatcher, and the
//! bridge state machine drives the connection lifecycle and the discovery
//! announce/retract operations.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── bridge.rs           - Lifecycle state machine and task handle
//! ├── config.rs           - Broker client parameters
//! ├── dispatcher.rs       - Topic routing with fault isolation, discovery lifecycle
//! ├── message_manager.rs  - Inbound message representation
//! ├── publisher.rs        - Publish capability and outbound queue
//! └── transport.rs        - Pub/sub transport boundary and rumqttc implementation
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! broker ──► transport ──► mpsc ──► Bridge<Running> ──► Dispatcher ──► handler
//!    ▲                                                                   │
//!    └──────────── transport ◄── outbox ◄── Publisher ◄──────────────────┘
//! ```
//!
//! Handlers run one at a time in arrival order, so a command and the state
//! publish it causes keep their order.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod message_manager;
pub mod publisher;
pub mod transport;
