use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrlType {
    // A source file on disk, relative to the source root
    File,
    // Built content, produced by a command or left over from a previous build
    Content,
}

/// Names something a command reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectUrl {
    pub url_type: UrlType,
    pub path: String,
}

impl ObjectUrl {
    pub fn new<T: Into<String>>(
        url_type: UrlType,
        path: T,
    ) -> Self {
        ObjectUrl {
            url_type,
            path: path.into(),
        }
    }

    pub fn file<T: Into<String>>(path: T) -> Self {
        Self::new(UrlType::File, path)
    }

    pub fn content<T: Into<String>>(path: T) -> Self {
        Self::new(UrlType::Content, path)
    }
}

impl Display for ObjectUrl {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self.url_type {
            UrlType::File => write!(f, "file:{}", self.path),
            UrlType::Content => write!(f, "content:{}", self.path),
        }
    }
}
