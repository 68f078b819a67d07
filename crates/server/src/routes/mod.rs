pub mod assign;
pub mod experiments;
pub mod health;
pub mod projects;
pub mod variants;
