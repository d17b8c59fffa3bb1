pub mod catalog;
pub mod journal;

pub use catalog::SurrealCatalogStore;
pub use journal::SurrealChangeJournal;
