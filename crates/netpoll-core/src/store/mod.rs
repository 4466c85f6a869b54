// ── In-memory object store ──

mod collection;
pub mod registry;

pub use registry::Registry;
