pub mod calendar;
pub mod compactor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod observability;
pub mod range;
pub mod recurrence;
pub mod schedule;

pub use calendar::{Calendar, CalendarConfig};
pub use config::Config;
pub use directory::{Directory, DirectoryError, InMemoryDirectory, Role, RoleLookup, ScheduleSource};
pub use engine::{Engine, EngineError, ErrorKind};
pub use range::TimeRange;
pub use recurrence::{expand_rule, Frequency, RecurringRule};
pub use schedule::{expand_schedule, Schedule, ScheduleRule};
