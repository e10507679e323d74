pub mod history;
pub mod reading;

pub use history::{
    consumption_statistic_id, statistic_id, StateSnapshot, StatisticPoint, STATISTIC_SOURCE,
};
pub use reading::{Reading, TimePeriod, DEFAULT_UNIT};
