pub mod extractor;
pub mod jwt;

/// Read-only role: may query logs but never write them.
pub const ROLE_AUDITOR: &str = "auditor";
pub const ROLE_MEMBER: &str = "member";
