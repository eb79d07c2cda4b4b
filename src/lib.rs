//! sort-server: a TCP service that sorts integer lists.
//!
//! Clients send length-prefixed lists and get each list back sorted. Two
//! server architectures share the same framing, sort pool and lifecycle:
//! - blocking: a reader and a writer thread per connection
//! - non-blocking: one read event loop and one write event loop for all
//!   connections
//!
//! ```no_run
//! use sort_server::{Config, NonBlockingServer};
//! use std::sync::Arc;
//!
//! let config = Config { port: 0, ..Config::default() };
//! let server = Arc::new(NonBlockingServer::new(&config)?);
//!
//! let runner = Arc::clone(&server);
//! let handle = std::thread::spawn(move || runner.run());
//! let addr = server.await_served();
//! println!("listening on {addr}");
//!
//! server.close()?;
//! handle.join().expect("accept thread panicked")?;
//! # Ok::<(), sort_server::ServerError>(())
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod sort;

pub use codec::{encode_message, MessageReader};
pub use config::Config;
pub use error::{ConnectionError, FormatError, ServerError};
pub use protocol::Protocol;
pub use server::{BlockingServer, ClientAcceptingServer, NonBlockingServer, ServerState};
pub use sort::SortStrategy;
