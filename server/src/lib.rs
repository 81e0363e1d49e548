//! # Game Server Library
//!
//! Authoritative server core for a real-time multiplayer game. A fixed pool of
//! client slots talks to the server over a reliable stream (TCP) and an
//! unreliable datagram socket (UDP) sharing one port. Every inbound packet is
//! funneled onto a single simulation thread that runs at a fixed tick rate.
//!
//! ## Architecture
//!
//! ### Network tasks
//! The tokio runtime hosts one accept loop, one reader and one writer task per
//! stream connection, a datagram receiver and a datagram sender. These tasks
//! only touch transport state: frame reassembly buffers and the per-slot
//! connection bindings.
//!
//! ### Simulation thread
//! A dedicated OS thread owns the simulation value. Each tick it drains the
//! deferred queue (handler calls, connects, disconnects) and then advances
//! the simulation. Tick deadlines are computed from the tick index, so a slow
//! tick is caught up instead of shifting every later tick.
//!
//! ### Dispatch
//! Inbound frames carry an i32 packet id. The network side resolves the id
//! through a `HandlerTable` that must cover every `ClientPacket` kind before
//! the server starts, and queues the handler call for the simulation thread.
//!
//! ## Module Organization
//!
//! - `client`: per-slot transport state and the stream session loops
//! - `client_manager`: the fixed slot table
//! - `config`: server configuration
//! - `error`: server error type
//! - `game`: the gameplay simulation
//! - `handlers`: handler table and dispatcher
//! - `network`: sockets, background tasks and the outbound send API
//! - `scheduler`: cross-thread deferred execution
//! - `send`: server-to-client packet builders
//! - `tick`: the fixed-rate tick loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::{self, GameState};
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let server = Server::bind(config.clone()).await?;
//!     let game = GameState::new(server.network(), config.tick_rate);
//!     let handle = server.start(game::handlers(), game)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod game;
pub mod handlers;
pub mod network;
pub mod scheduler;
pub mod send;
pub mod tick;
