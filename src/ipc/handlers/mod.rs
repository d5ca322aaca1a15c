pub mod activity;
pub mod core;
pub mod results;
pub mod roster;
pub mod settings;
