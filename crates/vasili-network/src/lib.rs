//! Vasili wireless layer
//!
//! Radio management and network evaluation for the Vasili uplink selector:
//! - Radio pool with scanning/connection roles and scoped leases
//! - Card state storage with in-memory fallback
//! - Background scanner and live network inventory
//! - Evaluation modules (open, secured, captive portal, speed test)
//! - Learned captive portal patterns
//! - Hardware backends (Linux, simulated)

pub mod backend;
pub mod backends;
pub mod card_store;
pub mod error;
pub mod inventory;
pub mod modules;
pub mod pool;
pub mod portal_store;
pub mod radio;
pub mod scanner;
pub mod types;

pub use backend::{ProbeMethod, ProbeRequest, ProbeResponse, WirelessBackend};
pub use backends::{HostBackendConfig, SimulatedBackend, SimulatedNetwork, SimulatedPortalAuth, SpeedtestEndpoints};
pub use card_store::{CardStateStore, FallbackCardStore, MemoryCardStore};
pub use error::{NetworkError, Result};
pub use inventory::NetworkInventory;
pub use modules::{
    AuthMethod, CaptivePortalModule, EvaluationModule, OpenNetworkModule, PortalType, SecuredNetworkModule,
    SpeedtestModule,
};
pub use pool::{LeaseEnd, RadioLease, RadioPool};
pub use portal_store::{MemoryPortalStore, PortalPattern, PortalPatternStore};
pub use radio::{Radio, RadioRole, RadioState};
pub use scanner::{Scanner, ScannerConfig};
pub use types::{
    AttemptOutcome, ConnectionAttempt, Credentials, EncryptionClass, ModuleKind, NetworkObservation,
    RawScanResult, SpeedMeasurement,
};
