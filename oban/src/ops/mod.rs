//! All SQL lives here, one module per concern. Functions are generic over
//! `sqlx::Executor` so callers can run them against the pool or inside a
//! transaction.

pub(crate) mod jobs;
pub(crate) mod maintenance;
pub(crate) mod peers;
pub(crate) mod producers;
pub(crate) mod staging;
