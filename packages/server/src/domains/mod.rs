// Business domains
pub mod connections;
pub mod jobs;
