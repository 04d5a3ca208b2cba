//! Client half of lightning live queries: a normalized cache kept current by server
//! patches and the client's own optimistic writes, with query results re-derived
//! from it locally.

pub mod cache;
pub mod engine;
pub mod error;
pub mod optimistic;
pub mod query;
pub mod session;
pub mod transport;

pub use cache::{Cache, CacheTable, Snapshot};
pub use engine::{derive_view, QueryEngine, QueryView};
pub use error::{ClientError, Result};
pub use optimistic::{apply_optimistic, PendingOperation, TempIds, TempRow};
pub use query::{KeyedQuery, LiveQuery};
pub use session::{RequestState, Session, SubscriptionId, ViewCallback};
