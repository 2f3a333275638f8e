//! # rabbit-engine
//!
//! Wire protocol engine for Rabbit, a text-framed, secure, asynchronous
//! peer-to-peer application protocol for hierarchical content networks.
//!
//! Endpoints are *burrows* connected through encrypted bidirectional
//! *tunnels*; each tunnel carries many independent *lanes* multiplexing
//! request/response transactions, streamed bodies, and event
//! subscriptions. This crate is the engine only: frame codec, tunnel
//! multiplexer, lane state machines, reliability (seq/ack/resume),
//! per-lane credit flow control, and the verb/selector semantics behind
//! menus, fetches, search, and pub/sub.
//!
//! Cryptography, transports, persistence, and content are collaborator
//! interfaces: [`transport::Transport`], [`identity::IdentityProvider`],
//! [`subscribe::ContinuityOracle`], [`dispatch::SelectorResolver`], and
//! [`warren::Discovery`].
//!
//! ## Example
//!
//! ```ignore
//! use rabbit_engine::{Engine, MemoryOracle};
//! use rabbit_engine::transport::memory_pair;
//!
//! #[tokio::main]
//! async fn main() -> rabbit_engine::Result<()> {
//!     let engine = Engine::builder()
//!         .resolver(my_resolver())
//!         .oracle(MemoryOracle::new())
//!         .build();
//!
//!     let (server_side, client_side) = memory_pair(64 * 1024);
//!     let server = tokio::spawn({
//!         let engine = engine.clone();
//!         async move { engine.accept(server_side).await }
//!     });
//!
//!     let tunnel = engine.connect(client_side).await?;
//!     let menu = tunnel.list("/").await?;
//!     let mut news = tunnel.subscribe("/q/news", None).await?;
//!     tunnel.publish("/q/news", "Rabbit spec finalized.").await?;
//!     let event = news.next().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod status;
pub mod subscribe;
pub mod transport;
pub mod tunnel;
pub mod warren;

mod engine;

pub use dispatch::{Content, Dispatcher, Resolved, SelectorResolver};
pub use engine::{Engine, EngineBuilder};
pub use error::{ParseError, RabbitError, Result};
pub use protocol::{Frame, FrameBuffer, MapEntry, Selector, Verb};
pub use session::{CapSet, Session};
pub use status::Status;
pub use subscribe::{ContinuityOracle, MemoryOracle, SubscriptionEngine};
pub use tunnel::{Subscription, SubscriptionEvent, TunnelHandle};
