pub mod classes;
pub mod core;
pub mod dashboard;
pub mod grading;
pub mod people;
pub mod results;
pub mod schools;
pub mod scores;
pub mod sessions;
pub mod setup;
