pub mod devices;
pub mod document_store;
pub mod heartbeat_monitor;
