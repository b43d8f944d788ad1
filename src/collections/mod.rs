pub mod expiring;
pub mod record_set;

pub use expiring::{CacheEvent, SharedCache};
pub use record_set::RecordCollection;
