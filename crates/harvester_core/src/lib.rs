//! Harvester core: pure session model and the aggregation step.
mod effect;
mod msg;
mod query;
mod state;
mod update;
mod view_model;

pub use effect::Effect;
pub use msg::Msg;
pub use query::{parse_pair, QueryMap, QueryParseError, ResultMap, ResultRecord};
pub use state::{HarvestSession, JobId, Stage};
pub use update::update;
pub use view_model::SessionSummary;
