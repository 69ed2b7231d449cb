pub mod backend;
pub mod coordinator;
pub mod dedup;
pub mod hasher;
pub mod metadata_store;
pub mod object_store_client;
pub mod session_store;

#[cfg(test)]
pub mod test_helpers;
