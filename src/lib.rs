pub mod bluetooth;
pub mod config;
pub mod engine;
pub mod hotkey;
pub mod input;
pub mod keymap;
pub mod registry;
pub mod report;
