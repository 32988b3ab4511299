// Remote collaborators: document byte transport and catalog metadata.

pub mod catalog;
pub mod http_source;
pub mod traits;
