pub mod api;
pub mod users;
