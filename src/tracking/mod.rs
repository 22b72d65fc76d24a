// Order tracking: per-order reconciliation against backend truth

pub mod health;
pub mod reconciler;

pub use health::{HealthEvent, TrackingHealth};
pub use reconciler::{ReconciliationRecord, Reconciler};
