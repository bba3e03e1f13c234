pub mod health;

pub use health::{
    Gauges, HealthMonitor, HealthReport, HealthWarning, PipelineStats, ResetTracker,
    StatsSnapshot,
};
