pub mod attach;
pub mod messages;
pub mod scripts;
