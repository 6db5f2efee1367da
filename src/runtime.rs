//! Shared process-wide resources, constructed once in `main` and handed
//! to each worker — replaces the language-global singletons (token cache,
//! rate gate, registry, secrets table) the original kept at file scope.

use std::path::PathBuf;
use std::sync::Arc;

use crate::dump::DumpRegistry;
use crate::esi::EsiClient;
use crate::fifo::Fifo;
use crate::oauth::OAuthCache;
use crate::systems::SystemTable;

pub const ESI_BASE_URL: &str = "https://esi.evetech.net/latest";

/// The two halves of the orders-worker-answers-histories-worker protocol:
/// a request token flows one way, the computed market set flows back.
pub type MarketRequestFifo = Fifo<()>;
pub type MarketResponseFifo = Fifo<Vec<(u64, u64)>>;
pub type LocationIdFifo = Fifo<Vec<u64>>;

pub struct Runtime {
    pub esi: EsiClient,
    pub oauth: Option<OAuthCache>,
    pub dump_registry: Arc<DumpRegistry>,
    pub dump_dir: PathBuf,
    pub region_ids: Vec<u64>,
    pub systems: Arc<SystemTable>,
    pub orders_to_locations: LocationIdFifo,
    pub market_request: MarketRequestFifo,
    pub market_response: MarketResponseFifo,
}

impl Runtime {
    pub fn dump_path(&self, file_name: impl AsRef<str>) -> PathBuf {
        self.dump_dir.join(file_name.as_ref())
    }
}
