//! The transport and parsing core of a micro HTTP server
//!
//! This crate provides the layer below request handling: an event loop driving non-blocking
//! tcp sockets, the pooled memory every socket read and write goes through, and the cursor
//! based parsing that turns received bytes into HTTP tokens and strings without copying them
//! around first.
//!
//! # Features
//!
//! - Slab backed memory pool with pinned, reference counted blocks and bounded growth
//! - Cursors walking chains of blocks, with bulk copy, seek and distance
//! - ASCII and UTF-8 decoding straight out of block chains
//! - 64-bit word matching of HTTP methods and versions
//! - A single threaded, callback driven event loop over `mio` with tcp, async and timer handles
//! - Writes sent straight from block chains, completed in submission order
//!
//! # Example
//!
//! ```no_run
//! use micro_transport::connection::{Connection, FrameControl};
//! use micro_transport::memory::MemoryPool;
//! use micro_transport::networking::{EventLoop, ServerAddress, TcpHandle};
//! use tracing::{Level, error, info, warn};
//! use tracing_subscriber::FmtSubscriber;
//!
//! fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let pool = MemoryPool::new();
//!     let mut event_loop = match EventLoop::new() {
//!         Ok(event_loop) => event_loop,
//!         Err(e) => {
//!             error!(cause = %e, "event loop init error");
//!             return;
//!         }
//!     };
//!
//!     let address = ServerAddress::from_url("http://127.0.0.1:8080").expect("valid address");
//!     let listener = TcpHandle::init(&mut event_loop);
//!     if let Err(e) = listener.bind(&mut event_loop, &address) {
//!         error!(cause = %e, "bind server error");
//!         return;
//!     }
//!
//!     info!(%address, "start listening");
//!     let started = listener.listen(&mut event_loop, 128, move |event_loop, accepted| {
//!         let tcp = match accepted {
//!             Ok(tcp) => tcp,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 return;
//!             }
//!         };
//!
//!         let _ = Connection::start(event_loop, tcp, pool.clone(), |_, connection, request_line| {
//!             let Ok(request_line) = request_line else { return };
//!             info!(request_target = request_line.target(), "request received");
//!             let _ = connection.output().write(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
//!         });
//!     });
//!
//!     match started.and_then(|()| event_loop.run()) {
//!         Ok(()) => info!("event loop finished"),
//!         Err(e) => error!(cause = %e, "event loop error"),
//!     }
//!     event_loop.dispose();
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`memory`]: memory pool, blocks and cursors
//! - [`decode`]: strings and byte segments from cursor ranges
//! - [`token`]: fast method and version matching
//! - [`networking`]: the event loop and its handles
//! - [`connection`]: accepted sockets wired to parsing and response output
//!
//! # Core Components
//!
//! ## Memory
//!
//! Every read lands in a [`memory::MemoryBlock`] leased from a [`memory::MemoryPool`]. Blocks
//! are linked into chains and stay alive while pinned: by the receive buffer of a connection,
//! or by an in-flight [`networking::WriteRequest`]. The last unpin hands the block back to the
//! pool.
//!
//! The loop thread never waits for the pool: a connection that finds it exhausted fails and
//! is closed, the other connections keep going.
//!
//! ## Event Loop
//!
//! [`networking::EventLoop`] runs every callback on one thread. Other threads reach it only
//! through [`networking::AsyncSender`] and [`networking::StopHandle`]. A panicking callback
//! closes the handle it belongs to and the loop keeps going.
//!
//! ## Error Handling
//!
//! The crate uses custom error types that implement `std::error::Error`:
//!
//! - [`networking::NetError`]: handle and socket failures
//! - [`networking::AddressError`]: listen address parsing and resolution
//! - [`connection::StreamError`]: response stream failures
//! - [`connection::ParseError`]: request line and header section errors
//! - [`memory::PoolConfigError`]: invalid pool options
//!
//! # Limitations
//!
//! - HTTP/1.x request lines only, headers and bodies are left to the layers above
//! - No TLS support
//! - Maximum request line size: 8KB
//! - Maximum header section size: 8KB

pub mod connection;
pub mod decode;
pub mod memory;
pub mod networking;
pub mod token;

mod utils;
pub(crate) use utils::ensure;
