//! Postgres repositories. Each submodule wraps a `DbPool` and converts row
//! structs into the domain types from `crate::types` at the boundary.

pub mod pool;
pub mod providers;
pub mod quotas;
pub mod usage;
pub mod users;

pub use pool::{init_pool, DbPool};
pub use providers::{ModelRepository, ModelSupportRepository, PricingRepository, ProviderRepository};
pub use quotas::{QuotaRepository, QuotaUsageRepository};
pub use usage::{BillingRepository, NewUsageLog, UsageLogRepository};
pub use users::{ApiKeyRepository, UserRepository};
