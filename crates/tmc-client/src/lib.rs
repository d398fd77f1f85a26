//! TestMyCode client adapters
//!
//! Concrete implementations of the `tmc-core` collaborator traits:
//! [`HttpClient`] talks to the TMC server and [`LangsRunner`] drives the
//! tmc-langs CLI for local tests and exercise archives.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tmc_client::{HttpClient, LangsRunner};
//! use tmc_core::{Config, FileCredentialStore, RemoteClient};
//!
//! # async fn example() -> tmc_core::Result<()> {
//! let config = Config::load()?;
//! let paths = config.paths();
//! let client = HttpClient::new(&config, Arc::new(FileCredentialStore::new(&paths.credentials)))?;
//! let runner = LangsRunner::new(&config.langs_cli, paths.root.join("tmp"));
//! for org in client.get_organizations().await? {
//!     println!("{}", org.slug);
//! }
//! # Ok(())
//! # }
//! ```

mod http;
mod runner;

pub use http::HttpClient;
pub use runner::LangsRunner;
