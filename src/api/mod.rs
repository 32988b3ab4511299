// Binding surface for the mobile UI layer.

pub mod reader_api;
pub mod simple;
