use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A tenant of the platform. Orgs are the unit of archival: every archive
/// belongs to exactly one org, and orgs are swept independently.
#[derive(Debug, Clone, FromRow)]
pub struct Org {
    pub id: i32,
    pub name: String,
    pub created_on: DateTime<Utc>,
    /// Anonymous orgs have contact identities redacted in archived records.
    pub is_anon: bool,
    /// Days a record stays live before it becomes archivable. Not a column;
    /// filled in from config when the org is loaded.
    #[sqlx(skip)]
    pub retention_days: i64,
}
