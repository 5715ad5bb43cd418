//! jfmigrate core - Headless engine that moves a Jellyfin installation to a new
//! filesystem layout.
//!
//! The engine copies the server's data and metadata trees, rewrites the paths
//! stored inside them, recomputes the path-derived item identifiers and
//! replaces every stored occurrence of the old ones, then puts the original
//! file times back into the library database.
//!
//! # Example
//!
//! ```rust,ignore
//! use jfmigrate_core::{CancellationToken, MigrationConfig, Migrator};
//!
//! fn main() -> jfmigrate_core::Result<()> {
//!     let config = MigrationConfig::from_file("windows-to-docker.json".as_ref())?;
//!     let summary = Migrator::new(&config, CancellationToken::new()).run()?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod files;
pub mod idmap;
pub mod ids;
pub mod paths;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod store;
pub mod summary;
pub mod timestamps;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{
    ColumnKind, EngineConfig, Job, JobLists, MigrationConfig, PathRuleSet, Phase, ReplacementRule,
    SlashStyle, TableSpec, TargetPolicy,
};
pub use error::{MigrateError, Result, Severity};
pub use idmap::IdentifierMap;
pub use ids::{derive_item_id, DerivationContext, IdKind, ItemId};
pub use paths::PathRewriter;
pub use pipeline::Migrator;
pub use state::{Ledger, LedgerEntry, Outcome};
pub use store::RowStore;
pub use summary::RunSummary;
