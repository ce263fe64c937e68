pub mod alerts;
pub mod health;
pub mod jobs;
pub mod workflows;
