pub mod enrollments;
pub mod students;
pub mod subscription_episodes;
