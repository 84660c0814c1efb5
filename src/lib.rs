pub mod bootstrap;
pub mod image;
pub mod loader;
pub mod memory;
pub mod paths;
pub mod profile;

pub use loader::{Loader, LoaderConfig};
pub use memory::AddressSpace;
pub use profile::TargetProfile;
