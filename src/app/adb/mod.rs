pub mod bridge;
pub mod locator;
pub mod parse;
pub mod platform_tools;
pub mod runner;
