//! Exchange-facing plumbing: the read-only endpoint catalogue, the three
//! request signers, the HTTP transport seam, per-credential lanes, the
//! per-exchange connectors and the spot price oracle.

pub mod auth;
pub mod connectors;
pub mod credential;
pub mod endpoints;
pub mod error;
pub mod lane;
pub mod pricing;
pub mod responses;
pub mod transport;

// --- Public API ---
pub use auth::{AuthenticatedRequest, RequestSigner, Signer, SigningContext};
pub use connectors::{
    ConnectorFactory, ConnectorSettings, ExchangeConnector, FetchItem, HistoryPlan,
    HttpConnectorFactory, PermissionProbe, SkippedSource,
};
pub use credential::DecryptedCredential;
pub use endpoints::{AccountId, HttpMethod, ReadEndpoint};
pub use error::{ApiError, SigningError};
pub use lane::{CredentialLane, LaneArena, NonceSource};
pub use pricing::{BinanceTickerOracle, PriceOracle};
pub use transport::{HttpTransport, RawResponse, ReqwestTransport};
