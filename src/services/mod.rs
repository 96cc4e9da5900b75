pub mod finalizer;
pub mod part_store;
pub mod upload_service;
pub mod user_service;
