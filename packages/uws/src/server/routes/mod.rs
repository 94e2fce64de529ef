// Route handlers for the UWS URL surface.

mod jobs;
mod service;

pub use jobs::*;
pub use service::*;
