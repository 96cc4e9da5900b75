pub mod health_handlers;
pub mod mca_handlers;
