//! Operator console

mod console;

pub use console::ConsoleApp;
