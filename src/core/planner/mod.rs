pub mod cost;
pub mod plan;
pub mod query_planner;
pub mod visualizer;

pub use cost::{
    CostEstimate, CostModel, JoinStrategy, SelectivityEstimator, StaticStatistics, StatisticsSource,
    TableStatistics,
};
pub use plan::{PlanKind, PlanNode, PlanOperator};
pub use query_planner::QueryPlanner;
pub use visualizer::PlanVisualizer;
