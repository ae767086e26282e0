pub mod cache_entry;
pub mod prelude;
