pub mod config_parser;
pub mod file_path;
pub mod inhibitor_monitor;
pub mod load_monitor;
