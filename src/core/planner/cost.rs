use crate::core::query::ast::Condition;
use crate::core::schema::IndexDefinition;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// CPU units charged per row touched.
pub const CPU_COST_PER_ROW: f64 = 0.01;

/// I/O units charged per page read.
pub const IO_COST_PER_PAGE: f64 = 1.0;

/// Transfer cost per KiB shipped off-node. Plans here are local, so this only
/// feeds `CostModel::estimate_transfer`.
pub const NETWORK_COST_PER_KB: f64 = 0.1;

/// Geodesic operators cost this many times their Euclidean counterpart.
pub const GEODESIC_COST_MULTIPLIER: f64 = 2.5;

/// Both join inputs above this many rows switch nested-loop costing to hash-join costing.
pub const HASH_JOIN_THRESHOLD: f64 = 1000.0;

/// Fraction of rows a scan predicate keeps when nothing better is known.
pub const DEFAULT_PREDICATE_SELECTIVITY: f64 = 0.1;

/// Fraction of rows an index lookup is assumed to match.
pub const INDEX_SELECTIVITY: f64 = 0.1;

/// I/O per matched row of an index scan.
pub const INDEX_IO_PER_ROW: f64 = 0.01;

/// Fraction of the cross product a join keeps.
pub const JOIN_SELECTIVITY: f64 = 0.1;

/// Fraction of rows a WHERE filter keeps.
pub const FILTER_SELECTIVITY: f64 = 0.5;

/// Output rows of a grouped aggregate as a fraction of its input.
pub const GROUPING_FACTOR: f64 = 0.1;

/// Curvature penalty per unit of geodesic radius or join threshold.
pub const CURVATURE_PENALTY_PER_UNIT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub cpu_cost: f64,
    pub io_cost: f64,
    pub network_cost: f64,
    pub curvature_penalty: f64,
    /// Always the sum of the four components above.
    pub total_cost: f64,
    pub estimated_rows: f64,
}

impl CostEstimate {
    /// Negative inputs are clamped to zero.
    pub fn new(cpu_cost: f64, io_cost: f64, network_cost: f64, curvature_penalty: f64, estimated_rows: f64) -> Self {
        let cpu_cost = cpu_cost.max(0.0);
        let io_cost = io_cost.max(0.0);
        let network_cost = network_cost.max(0.0);
        let curvature_penalty = curvature_penalty.max(0.0);
        Self {
            cpu_cost,
            io_cost,
            network_cost,
            curvature_penalty,
            total_cost: cpu_cost + io_cost + network_cost + curvature_penalty,
            estimated_rows: estimated_rows.max(0.0),
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0, 0.0)
    }

    /// Component-wise sum; rows are taken from `self`.
    pub fn plus(&self, other: &CostEstimate) -> CostEstimate {
        CostEstimate::new(
            self.cpu_cost + other.cpu_cost,
            self.io_cost + other.io_cost,
            self.network_cost + other.network_cost,
            self.curvature_penalty + other.curvature_penalty,
            self.estimated_rows,
        )
    }

    pub fn with_rows(&self, estimated_rows: f64) -> CostEstimate {
        CostEstimate::new(
            self.cpu_cost,
            self.io_cost,
            self.network_cost,
            self.curvature_penalty,
            estimated_rows,
        )
    }

    pub fn components_sum(&self) -> f64 {
        self.cpu_cost + self.io_cost + self.network_cost + self.curvature_penalty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStatistics {
    pub row_count: u64,
    pub page_count: u64,
}

/// Where the planner gets table sizes and index manifests from.
pub trait StatisticsSource {
    /// `None` when the table does not exist.
    fn table_statistics(&self, table: &str) -> Option<TableStatistics>;

    fn indices(&self, table: &str) -> Vec<IndexDefinition>;

    fn index_pages(&self, index: &IndexDefinition) -> u64 {
        self.table_statistics(&index.relation)
            .map(|stats| stats.page_count.max(1))
            .unwrap_or(1)
    }
}

/// Fixed statistics, for planning without a live engine.
#[derive(Debug, Clone, Default)]
pub struct StaticStatistics {
    tables: HashMap<String, TableStatistics>,
    indices: HashMap<String, Vec<IndexDefinition>>,
}

impl StaticStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, row_count: u64, page_count: u64) -> Self {
        self.tables.insert(table.to_string(), TableStatistics { row_count, page_count });
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indices.entry(index.relation.clone()).or_default().push(index);
        self
    }
}

impl StatisticsSource for StaticStatistics {
    fn table_statistics(&self, table: &str) -> Option<TableStatistics> {
        self.tables.get(table).copied()
    }

    fn indices(&self, table: &str) -> Vec<IndexDefinition> {
        self.indices.get(table).cloned().unwrap_or_default()
    }
}

/// Replaces the fixed predicate selectivity where it can do better.
pub trait SelectivityEstimator: Send + Sync {
    /// `None` falls back to `CostModel::predicate_selectivity`.
    fn selectivity(&self, table: &str, predicate: &Condition) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    NestedLoop,
    Hash,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JoinStrategy::NestedLoop => write!(f, "nested_loop"),
            JoinStrategy::Hash => write!(f, "hash"),
        }
    }
}

/// Heuristic cost model. Every tuning constant is a public field so callers can
/// recalibrate without touching the formulas.
#[derive(Clone)]
pub struct CostModel {
    pub cpu_cost_per_row: f64,
    pub io_cost_per_page: f64,
    pub network_cost_per_kb: f64,
    pub geodesic_cost_multiplier: f64,
    pub hash_join_threshold: f64,
    pub predicate_selectivity: f64,
    pub index_selectivity: f64,
    pub index_io_per_row: f64,
    pub join_selectivity: f64,
    pub filter_selectivity: f64,
    pub grouping_factor: f64,
    pub curvature_penalty_per_unit: f64,
    estimator: Option<Arc<dyn SelectivityEstimator>>,
}

impl fmt::Debug for CostModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CostModel")
            .field("cpu_cost_per_row", &self.cpu_cost_per_row)
            .field("io_cost_per_page", &self.io_cost_per_page)
            .field("geodesic_cost_multiplier", &self.geodesic_cost_multiplier)
            .field("hash_join_threshold", &self.hash_join_threshold)
            .field("custom_estimator", &self.estimator.is_some())
            .finish()
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new()
    }
}

impl CostModel {
    pub fn new() -> Self {
        Self {
            cpu_cost_per_row: CPU_COST_PER_ROW,
            io_cost_per_page: IO_COST_PER_PAGE,
            network_cost_per_kb: NETWORK_COST_PER_KB,
            geodesic_cost_multiplier: GEODESIC_COST_MULTIPLIER,
            hash_join_threshold: HASH_JOIN_THRESHOLD,
            predicate_selectivity: DEFAULT_PREDICATE_SELECTIVITY,
            index_selectivity: INDEX_SELECTIVITY,
            index_io_per_row: INDEX_IO_PER_ROW,
            join_selectivity: JOIN_SELECTIVITY,
            filter_selectivity: FILTER_SELECTIVITY,
            grouping_factor: GROUPING_FACTOR,
            curvature_penalty_per_unit: CURVATURE_PENALTY_PER_UNIT,
            estimator: None,
        }
    }

    pub fn with_selectivity_estimator(mut self, estimator: Arc<dyn SelectivityEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// 1.0 without a predicate; otherwise the estimator's answer or the fixed default.
    pub fn selectivity(&self, table: &str, predicate: Option<&Condition>) -> f64 {
        let predicate = match predicate {
            Some(predicate) => predicate,
            None => return 1.0,
        };
        self.estimator
            .as_ref()
            .and_then(|estimator| estimator.selectivity(table, predicate))
            .unwrap_or(self.predicate_selectivity)
            .clamp(0.0, 1.0)
    }

    pub fn estimate_scan(&self, table: &str, stats: &TableStatistics, predicate: Option<&Condition>) -> CostEstimate {
        let rows = stats.row_count as f64;
        CostEstimate::new(
            rows * self.cpu_cost_per_row,
            stats.page_count as f64 * self.io_cost_per_page,
            0.0,
            0.0,
            rows * self.selectivity(table, predicate),
        )
    }

    pub fn estimate_index_scan(&self, stats: &TableStatistics, index_pages: u64) -> CostEstimate {
        let rows = stats.row_count as f64 * self.index_selectivity;
        let io = (index_pages.max(1) as f64).log2() + rows * self.index_io_per_row;
        CostEstimate::new(
            rows * self.cpu_cost_per_row,
            io * self.io_cost_per_page,
            0.0,
            0.0,
            rows,
        )
    }

    /// Normalized hyperbolic disk area `sinh(r) - r`, clipped to [0, 1].
    pub fn geodesic_selectivity(&self, radius: f64) -> f64 {
        let r = radius.max(0.0);
        (r.sinh() - r).clamp(0.0, 1.0)
    }

    /// The start point does not enter the estimate; distance is opaque to the planner.
    pub fn estimate_geodesic_scan(&self, stats: &TableStatistics, _start_point: &[f64], radius: f64) -> CostEstimate {
        let r = radius.max(0.0);
        let rows = stats.row_count as f64;
        CostEstimate::new(
            rows * self.cpu_cost_per_row * self.geodesic_cost_multiplier,
            stats.page_count as f64 * self.io_cost_per_page,
            0.0,
            r * self.curvature_penalty_per_unit,
            rows * self.geodesic_selectivity(r),
        )
    }

    pub fn join_strategy(&self, left_rows: f64, right_rows: f64) -> JoinStrategy {
        if left_rows > self.hash_join_threshold && right_rows > self.hash_join_threshold {
            JoinStrategy::Hash
        } else {
            JoinStrategy::NestedLoop
        }
    }

    fn join_cpu(&self, strategy: JoinStrategy, left_rows: f64, right_rows: f64) -> f64 {
        match strategy {
            JoinStrategy::NestedLoop => left_rows * right_rows * self.cpu_cost_per_row,
            JoinStrategy::Hash => (left_rows + right_rows) * self.cpu_cost_per_row,
        }
    }

    /// Cost of joining two inputs, including the cost of producing them.
    pub fn estimate_join(&self, left: &CostEstimate, right: &CostEstimate) -> (CostEstimate, JoinStrategy) {
        let (l, r) = (left.estimated_rows, right.estimated_rows);
        let strategy = self.join_strategy(l, r);
        let own = CostEstimate::new(self.join_cpu(strategy, l, r), 0.0, 0.0, 0.0, l * r * self.join_selectivity);
        (own.plus(left).plus(right), strategy)
    }

    pub fn estimate_geodesic_join(
        &self,
        left: &CostEstimate,
        right: &CostEstimate,
        threshold: f64,
    ) -> (CostEstimate, JoinStrategy) {
        let (l, r) = (left.estimated_rows, right.estimated_rows);
        let strategy = self.join_strategy(l, r);
        let own = CostEstimate::new(
            self.join_cpu(strategy, l, r) * self.geodesic_cost_multiplier,
            0.0,
            0.0,
            threshold.max(0.0) * self.curvature_penalty_per_unit,
            l * r * self.join_selectivity,
        );
        (own.plus(left).plus(right), strategy)
    }

    /// Keeps `filter_selectivity` of the input rows at no extra cost.
    pub fn estimate_filter(&self, input: &CostEstimate) -> CostEstimate {
        input.with_rows(input.estimated_rows * self.filter_selectivity)
    }

    pub fn estimate_aggregate(&self, input: &CostEstimate, grouped: bool) -> CostEstimate {
        let rows = if grouped {
            (input.estimated_rows * self.grouping_factor).max(1.0)
        } else {
            1.0
        };
        let own = CostEstimate::new(input.estimated_rows * self.cpu_cost_per_row, 0.0, 0.0, 0.0, rows);
        own.plus(input)
    }

    pub fn estimate_sort(&self, input: &CostEstimate) -> CostEstimate {
        let n = input.estimated_rows;
        let cpu = if n > 1.0 { n * n.log2() * self.cpu_cost_per_row } else { 0.0 };
        CostEstimate::new(cpu, 0.0, 0.0, 0.0, n).plus(input)
    }

    pub fn estimate_limit(&self, input: &CostEstimate, limit: u64) -> CostEstimate {
        input.with_rows(input.estimated_rows.min(limit as f64))
    }

    /// Cost of shipping `rows` rows of `row_bytes` each to another node.
    pub fn estimate_transfer(&self, rows: f64, row_bytes: f64) -> CostEstimate {
        CostEstimate::new(0.0, 0.0, rows * row_bytes / 1024.0 * self.network_cost_per_kb, 0.0, rows)
    }
}
