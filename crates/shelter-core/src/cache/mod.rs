//! Cache management module

mod generations;
mod policy;
mod precache;

pub use generations::{CleanupReport, GenerationManager};
pub use policy::{AdmissionPolicy, SkipReason};
pub use precache::Precacher;
