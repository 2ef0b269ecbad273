pub mod capture_backend;
pub mod delivery_sink;
