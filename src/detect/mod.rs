mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectorBackend, DetectorFactory};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, DetectorSettings};
pub use result::{non_max_suppression, BoundingBox, Detection};
