#![allow(unused_imports)]

pub use super::cache_entry::Entity as CacheEntry;
