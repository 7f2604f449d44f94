pub mod conversation;
pub mod roles;
