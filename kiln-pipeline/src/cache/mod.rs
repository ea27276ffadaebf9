mod result_cache;
pub use result_cache::{CacheEntry, CacheKey, ResultCache};
