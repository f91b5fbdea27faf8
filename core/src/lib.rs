pub mod abuse;
pub mod error;
