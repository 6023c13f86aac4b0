pub mod collection;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod filter;
pub mod lock;
pub mod pipeline;
pub mod storage;

pub use collection::{Collection, CollectionFile, WriteResult};
pub use config::{CollectionConfig, CollectionDescriptor};
pub use database::Database;
pub use document::Document;
pub use error::{NodbError, Result};
pub use filter::{Condition, Filter, Mode};
pub use pipeline::{Next, Pipeline};
