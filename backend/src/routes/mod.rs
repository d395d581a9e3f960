pub mod admin;
pub mod health;
pub mod models;
pub mod nodes;
pub mod process;
pub mod routing;
