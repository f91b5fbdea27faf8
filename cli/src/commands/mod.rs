pub mod abuse;
pub mod health;
