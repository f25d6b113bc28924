pub mod engine;
pub mod loader;
pub mod rules;

pub use engine::{PolicyAction, PolicyEngine, PolicyResult};
pub use loader::{load, PolicyLoadError};
pub use rules::PolicyConfig;
