pub mod count;
pub mod create;
pub mod get;
pub mod images;
pub mod list;
pub mod rm;
pub mod sweep;
