pub mod catalog;
pub mod metrics;

pub use catalog::{CatalogError, ConfigCatalog, ExecutionPaths};
pub use metrics::{ExportFormat, MetricsStore, MetricsStoreError};
