#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

pub mod config;
pub mod encoding;
pub mod error;
pub mod server;
pub mod storage;

pub use config::Config;
pub use server::Server;
pub use storage::Store;
