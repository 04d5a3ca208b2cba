pub mod eval;
pub mod include;
pub mod matcher;
pub mod mutation;
pub mod query;
pub mod recompute;
pub mod schema;
pub mod split;
pub mod subscription;
pub mod types;
