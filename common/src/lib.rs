pub mod clock;
pub mod storage;
pub mod util;

pub use clock::{Clock, FixedClock, SystemClock};
pub use storage::config::StorageConfig;
pub use storage::factory::{BackendBuilder, create_backend};
pub use storage::{
    Mutation, ParamStyle, Params, Query, Row, SqlBackend, SqlValue, StorageError, StorageResult,
};
pub use util::prefix_successor;
