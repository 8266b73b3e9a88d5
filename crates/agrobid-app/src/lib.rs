// Library root: the watcher binary's modules, exposed for integration tests.

pub mod config;
pub mod console;
pub mod session;
