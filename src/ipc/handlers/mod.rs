pub mod answers;
pub mod backup_exchange;
pub mod core;
pub mod quizzes;
pub mod results;
pub mod sessions;
