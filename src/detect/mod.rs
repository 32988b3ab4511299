// Document format detection from leading bytes.

pub mod document;
