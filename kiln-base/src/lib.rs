pub mod hashing;
pub use hashing::ObjectIdBuilder;

pub mod lru_cache;
pub use lru_cache::LruCache;

mod object_id;
pub use object_id::ObjectId;
pub use object_id::ObjectIdParseError;
