pub mod conversation;
pub mod principal;
