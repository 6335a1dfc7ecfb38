pub mod config;
pub mod error;
pub mod launcher;
pub mod port_alloc;
pub mod proxy;
pub mod reaper;
pub mod request_meta;
pub mod resolver;
pub mod routes;
pub mod state;
pub mod supervisor;
pub mod templates;

#[cfg(test)]
mod testing;

pub use slidegate_process::{PreviewState, PreviewStatus, ResourceId};
