pub mod token;

pub use token::{Issued, TokenManager};
