//! The larch blob server.
//!
//! Wires the storage crates into a running server: a JSON configuration
//! declares named prefixes, the [`loader`] instantiates the storage and
//! handler graph behind them (with cycle detection), and [`server`]
//! exposes each storage prefix over the HTTP blob protocol plus the
//! search endpoints backed by an index.
//!
//! ```text
//! config file ──> Loader ──> { "/bs/":    DiskStorage
//!                              "/index/": SqliteIndex
//!                              "/bs-and-index/": Replica(bs, index)
//!                              "/search/": SearchHandler(index) }
//!                    │
//!                    └──> axum Router: <prefix>camli/* per storage
//! ```

pub mod config;
pub mod loader;
pub mod server;

pub use config::load_config;
pub use config::parse_config;
pub use config::PrefixConfig;
pub use config::ServerConfig;
pub use loader::Handler;
pub use loader::Loader;
pub use server::build_app;
