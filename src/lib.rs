pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod keygen;
pub mod models;
pub mod network;
pub mod party;
pub mod sign;
pub mod storage;

#[cfg(test)]
mod tests;

// error handling
pub type TssdResult<Success> = anyhow::Result<Success>;
