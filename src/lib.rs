//! Buy-back pricing engine: robust summarization of noisy marketplace
//! listings, guardrailed anchor selection, risk-adjusted prices and a
//! quota-aware batch orchestrator. Marketplace search and persistence
//! are collaborators behind the [`MarketSearch`] and [`Store`] traits.

pub mod batch;
pub mod config;
pub mod error;
pub mod market;
pub mod models;
pub mod pricing;
pub mod query;
pub mod store;
pub mod usage;

pub use batch::{BatchRequest, BatchRunner, StopHandle};
pub use config::AppConfig;
pub use error::{EngineError, MarketError, NormalizeError, StoreError};
pub use market::{FxTable, MarketSearch, SearchPage};
pub use models::{
    AnchorSource, BatchMode, BatchRun, BuyPrice, BuyPriceStatus, CatalogEntry, MarketSnapshot,
    RawListing, StopReason,
};
pub use store::{MemoryStore, Store};
pub use usage::UsageTracker;

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the default log subscriber for embedding scripts. Safe to
/// call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
