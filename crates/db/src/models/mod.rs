pub mod assignment;
pub mod experiment;
pub mod project;
pub mod variant;
