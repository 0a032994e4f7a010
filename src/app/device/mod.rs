pub mod readiness;
pub mod select;
