pub mod episode_statuses;
pub mod plan_names;
