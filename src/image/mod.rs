pub mod builder;
pub mod error;
pub mod exports;
pub mod fixup;
pub mod format;
pub mod imports;
pub mod native;

pub use builder::{
    build_synthetic_image, preferred_module_base, BuildOptions, ExportFunctionForm,
    SyntheticImage,
};
pub use error::{ImageError, Result};
pub use exports::ExportDirectory;
