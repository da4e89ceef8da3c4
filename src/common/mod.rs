pub mod logger;
pub mod models;
pub mod utils;
