pub mod core;
pub mod http;
pub mod identity;
pub mod proxy;
pub mod scrapers;
pub mod session;
pub mod stats;
pub mod storage;
pub mod taxonomy;

pub use self::core::{
    DelayRange, HarvestConfig, HarvestError, HarvestResult, Harvester, SiteConfig, TraversalMode,
};
pub use http::{HttpRequest, HttpResponse, Item, ItemId};
pub use scrapers::{BackendKind, FetchBackend};
pub use session::{BackendFactory, ReqwestBackendFactory, SessionSupervisor};
pub use stats::{HarvestReport, StatsTracker};
pub use storage::{CheckpointStore, DiskCheckpointStore, ItemSink};
pub use taxonomy::{CategoryId, SourceId, Taxonomy, TaxonomyEntry};
