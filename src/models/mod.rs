pub mod audit_log;
pub mod stats;
pub mod tenant;
pub mod user;

pub use audit_log::{ActionType, AuditLog, AuditLogView, NewAuditLog, Severity};
pub use stats::StatsSnapshot;
pub use tenant::Tenant;
pub use user::User;
