pub mod models;
pub mod monitor;
pub mod scheduler;

pub use models::{AlertKind, HealthAlert, SweepFailure, SweepReport, TenantHealthMonitoring};
pub use monitor::{HealthMonitor, MonitorOptions};
