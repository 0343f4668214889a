pub mod config;
pub mod convstore;
pub mod error;
pub mod logging;
pub mod logs;
pub mod pac;
pub mod paths;
pub mod ring;
pub mod tracker;
pub mod traffic;
pub mod usage;
