pub mod classify;
pub mod config;
pub mod errors;
mod harvester;
pub mod recovery;
pub mod retry;

pub use classify::{FetchResult, ResponseClassifier, StatusClass};
pub use config::{DelayRange, HarvestConfig, SiteConfig, TraversalMode};
pub use errors::{map_reqwest_error, HarvestError, HarvestResult, TransportKind};
pub use harvester::{Harvester, SessionProbe};
pub use recovery::{MachineState, RecoveryAction, RecoveryMachine};
