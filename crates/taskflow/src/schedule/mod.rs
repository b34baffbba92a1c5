pub mod cron;

pub use cron::{next_fire_time, CronError, CronSchedule};
