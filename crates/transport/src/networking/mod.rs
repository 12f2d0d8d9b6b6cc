//! A callback driven event loop over non-blocking sockets.
//!
//! Everything that can produce events is a handle owned by an [`EventLoop`]: tcp listeners and
//! connections ([`TcpHandle`]), cross-thread wake-ups ([`AsyncHandle`]) and one-shot timers
//! ([`TimerHandle`]). Handles are plain ids into the loop's table, so they are `Copy` (or
//! cheap to clone) and every operation takes the loop explicitly. A handle that was closed
//! rejects further use with [`NetError::Disposed`].
//!
//! All callbacks run on the thread calling [`EventLoop::run`]. The only ways in from other
//! threads are [`AsyncSender::send`] and [`StopHandle::stop`].
//!
//! Received bytes land in [`MemoryBlock`](crate::memory::MemoryBlock)s chosen by the read
//! `alloc` callback, and outgoing bytes are sent straight from block chains with a
//! [`WriteRequest`], so the data never passes through an intermediate buffer.
//!
//! ```no_run
//! use micro_transport::memory::MemoryPool;
//! use micro_transport::networking::{EventLoop, ServerAddress, TcpHandle};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = MemoryPool::new();
//! let mut event_loop = EventLoop::new()?;
//!
//! let listener = TcpHandle::init(&mut event_loop);
//! listener.bind(&mut event_loop, &ServerAddress::from_url("http://localhost:5000")?)?;
//! listener.listen(&mut event_loop, 128, move |event_loop, connection| {
//!     let Ok(connection) = connection else { return };
//!     let pool = pool.clone();
//!     let _ = connection.read_start(
//!         event_loop,
//!         move |_, _, _| pool.lease(),
//!         |event_loop, connection, read, block| {
//!             match read {
//!                 Ok(0) | Err(_) => {
//!                     let _ = connection.close(event_loop);
//!                 }
//!                 Ok(_) => block.with_data(|data| println!("{} bytes", data.len())),
//!             }
//!             block.unpin();
//!         },
//!     );
//! })?;
//!
//! event_loop.run()?;
//! event_loop.dispose();
//! # Ok(())
//! # }
//! ```

mod address;
mod async_handle;
mod error;
mod event_loop;
mod handle;
mod tcp;
mod timer;
mod write_req;

pub use address::ServerAddress;
pub use async_handle::{AsyncHandle, AsyncSender};
pub use error::{AddressError, NetError};
pub use event_loop::{DEFAULT_EVENT_CAPACITY, EventLoop, LoopOptions, StopHandle};
pub use handle::{HandleId, HandleState};
pub use tcp::TcpHandle;
pub use timer::TimerHandle;
pub use write_req::WriteRequest;
