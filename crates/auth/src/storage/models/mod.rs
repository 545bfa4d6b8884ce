mod key;

pub use key::{Key, KeyRecord, KeyType};

/// Storage prefixes for different types of data
pub mod prefixes {
    /// Prefix for issued keys
    pub const KEY: &str = "key:";

    /// Prefix for subject credentials
    pub const IDENTITY: &str = "identity:";
}
