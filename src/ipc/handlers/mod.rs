pub mod core;
pub mod results;
pub mod settings;
pub mod snapshot_export;
