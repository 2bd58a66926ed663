pub mod demo;
pub mod info;
pub mod validate;
