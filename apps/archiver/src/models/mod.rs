pub mod archive;
pub mod org;

pub use archive::{Archive, ArchivePeriod, ArchiveType};
pub use org::Org;
