mod object_url;
pub use object_url::{ObjectUrl, UrlType};

mod object_database;
pub use object_database::{object_id_to_path, ObjectDatabase};

mod content_resolver;
pub(crate) use content_resolver::ContentResolver;
