pub mod artifact;
pub mod backend;
pub mod error;
pub mod metadata;
pub mod spec;
pub mod tensor;

pub use artifact::*;
pub use backend::*;
pub use error::*;
pub use metadata::ModelMetadata;
pub use spec::*;
pub use tensor::*;
