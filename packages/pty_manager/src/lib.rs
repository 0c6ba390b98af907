//! PTY Manager - pseudo-terminal allocation for interactive sessions
//!
//! This crate opens terminal pairs and spawns processes attached to them.
//! It knows nothing about SSH or about which program ends up running.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{NativeAllocator, TerminalAllocator, TerminalGeometry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pair = NativeAllocator.allocate(TerminalGeometry::default()).unwrap();
//!
//!     let mut child = pair
//!         .process()
//!         .spawn_attached("docker", &["ps".to_string()])
//!         .unwrap();
//!     child.wait().await.unwrap();
//!
//!     let mut buf = [0u8; 4096];
//!     let n = pair.controller().read(&mut buf).await.unwrap();
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{
    NativeAllocator, ProcessSide, PtyController, TerminalAllocator, TerminalGeometry, TerminalPair,
};
