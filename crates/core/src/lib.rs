pub mod config;
pub mod date;
pub mod error;
pub mod operation;
pub mod record;
pub mod source;

pub use config::LoaderConfig;
pub use date::{create_multi_date_clusters, create_single_date_clusters, DateCluster};
pub use error::*;
pub use operation::Operation;
pub use record::{Key, Record, Value};
pub use source::SourceAttribute;
