pub mod err;
pub mod metadata;
pub mod partition;
pub mod properties;
pub mod recipe;

pub use metadata::BigKeyValueStoreMetadata;
pub use properties::{DataStoreProperties, ExpireTimeUnit};
pub use recipe::{ObjectMetadata, Recipe, RecipeChunk};
