// Reader engine: document location, download, cache, rendering state and orchestration.

pub mod cache;
pub mod controller;
pub mod downloader;
pub mod locator;
pub mod render;
