//! REST API handlers organized by domain.

pub mod audit;
pub mod dead_letter;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod reconcile;

pub use audit::*;
pub use dead_letter::*;
pub use health::*;
pub use ingest::*;
pub use metrics::*;
pub use reconcile::*;
