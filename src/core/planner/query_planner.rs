use super::cost::{CostEstimate, CostModel, StatisticsSource, TableStatistics};
use super::plan::{PlanNode, PlanOperator};
use crate::core::errors::{Error, Result};
use crate::core::query::ast::{ComparisonOp, Condition, JoinClause, SelectItem, SelectStatement, Statement, TableRef};
use crate::core::query::parse;
use crate::core::schema::IndexType;

/// Turns parsed statements into costed plan trees. Plans are diagnostic; nothing executes them.
pub struct QueryPlanner<'a> {
    cost_model: CostModel,
    stats: &'a dyn StatisticsSource,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(stats: &'a dyn StatisticsSource) -> Self {
        Self::with_cost_model(CostModel::new(), stats)
    }

    pub fn with_cost_model(cost_model: CostModel, stats: &'a dyn StatisticsSource) -> Self {
        Self { cost_model, stats }
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    pub fn plan_sql(&self, sql: &str) -> Result<PlanNode> {
        let statement = parse(sql)?;
        self.plan(&statement)
    }

    pub fn plan(&self, statement: &Statement) -> Result<PlanNode> {
        match statement {
            Statement::Select(select) => self.plan_select(select),
        }
    }

    fn table_statistics(&self, table: &str) -> Result<TableStatistics> {
        self.stats
            .table_statistics(table)
            .ok_or_else(|| Error::RelationNotFound { name: table.to_string() })
    }

    fn plan_select(&self, select: &SelectStatement) -> Result<PlanNode> {
        let (mut node, mut pending_filter) = self.plan_access_path(&select.from, select.where_clause.as_ref())?;

        for join in &select.joins {
            node = self.plan_join(node, join)?;
        }

        if let Some(condition) = pending_filter.take() {
            let cost = self.cost_model.estimate_filter(&node.cost);
            let mut filter = PlanNode::new(
                PlanOperator::Filter { condition: condition.to_string() },
                cost,
                vec![node],
            )
            .with_metadata("selectivity", self.cost_model.filter_selectivity);
            if let Some((column, _, _)) = condition.curvature_filter() {
                filter = filter.with_metadata("curvature_column", column.to_string());
            }
            node = filter;
        }

        if select.has_aggregates() || !select.group_by.is_empty() {
            let grouped = !select.group_by.is_empty();
            let cost = self.cost_model.estimate_aggregate(&node.cost, grouped);
            let aggregates = select
                .columns
                .iter()
                .filter(|item| matches!(item, SelectItem::Aggregate { .. }))
                .map(|item| item.to_string())
                .collect();
            node = PlanNode::new(
                PlanOperator::Aggregate {
                    group_by: select.group_by.iter().map(|c| c.to_string()).collect(),
                    aggregates,
                },
                cost,
                vec![node],
            );
        }

        if !select.order_by.is_empty() {
            let cost = self.cost_model.estimate_sort(&node.cost);
            node = PlanNode::new(
                PlanOperator::Sort { keys: select.order_by.iter().map(|o| o.to_string()).collect() },
                cost,
                vec![node],
            );
        }

        if let Some(limit) = select.limit {
            let cost = self.cost_model.estimate_limit(&node.cost, limit);
            node = PlanNode::new(PlanOperator::Limit { limit }, cost, vec![node]);
        }

        log::debug!(
            "planned query on {}: root={} total_cost={:.3} rows={:.1}",
            select.from.name,
            node.kind(),
            node.total_cost(),
            node.estimated_rows()
        );
        Ok(node)
    }

    fn belongs_to(table: &TableRef, qualifier: Option<&str>) -> bool {
        match qualifier {
            None => true,
            Some(name) => name == table.reference_name() || name == table.name,
        }
    }

    /// Picks the scan for the FROM table. Returns the WHERE condition back when
    /// the scan did not absorb it.
    fn plan_access_path<'s>(
        &self,
        table: &TableRef,
        where_clause: Option<&'s Condition>,
    ) -> Result<(PlanNode, Option<&'s Condition>)> {
        let stats = self.table_statistics(&table.name)?;
        let condition = match where_clause {
            Some(condition) => condition,
            None => return Ok((self.scan_node(table, &stats), None)),
        };

        if let Some(range) = condition.geodesic_range() {
            let bounded = matches!(range.op, ComparisonOp::Lt | ComparisonOp::Lte);
            if bounded && Self::belongs_to(table, range.column.table.as_deref()) {
                let cost = self.cost_model.estimate_geodesic_scan(&stats, range.point, range.radius);
                let selectivity = self.cost_model.geodesic_selectivity(range.radius);
                log::debug!("geodesic scan on {} radius={}", table.name, range.radius);
                let node = PlanNode::new(
                    PlanOperator::GeodesicScan {
                        table: table.name.clone(),
                        column: range.column.column.clone(),
                        point: range.point.to_vec(),
                        radius: range.radius,
                    },
                    cost,
                    Vec::new(),
                )
                .with_metadata("selectivity", selectivity);
                return Ok((node, None));
            }
        }

        if let Some((column, op, _)) = condition.column_literal() {
            if op != ComparisonOp::NotEq && Self::belongs_to(table, column.table.as_deref()) {
                let candidate = self
                    .stats
                    .indices(&table.name)
                    .into_iter()
                    .filter(|index| {
                        index.index_type == IndexType::Btree && index.leading_column() == Some(column.column.as_str())
                    })
                    .map(|index| {
                        let pages = self.stats.index_pages(&index);
                        (self.cost_model.estimate_index_scan(&stats, pages), index)
                    })
                    .min_by(|(a, _), (b, _)| a.total_cost.total_cmp(&b.total_cost));

                if let Some((index_cost, index)) = candidate {
                    let scan_cost = self
                        .cost_model
                        .estimate_filter(&self.cost_model.estimate_scan(&table.name, &stats, None));
                    if index_cost.total_cost < scan_cost.total_cost {
                        log::debug!(
                            "index scan on {} via {} ({:.3} < {:.3})",
                            table.name,
                            index.name,
                            index_cost.total_cost,
                            scan_cost.total_cost
                        );
                        let node = PlanNode::new(
                            PlanOperator::IndexScan {
                                table: table.name.clone(),
                                index: index.name.clone(),
                                condition: condition.to_string(),
                            },
                            index_cost,
                            Vec::new(),
                        )
                        .with_metadata("selectivity", self.cost_model.index_selectivity);
                        return Ok((node, None));
                    }
                }
            }
        }

        Ok((self.scan_node(table, &stats), Some(condition)))
    }

    fn scan_node(&self, table: &TableRef, stats: &TableStatistics) -> PlanNode {
        let cost = self.cost_model.estimate_scan(&table.name, stats, None);
        PlanNode::new(
            PlanOperator::Scan { table: table.name.clone(), alias: table.alias.clone() },
            cost,
            Vec::new(),
        )
        .with_metadata("pages", stats.page_count)
    }

    fn plan_join(&self, left: PlanNode, join: &JoinClause) -> Result<PlanNode> {
        let table = join.table();
        let right = self.scan_node(table, &self.table_statistics(&table.name)?);

        let (cost, operator): (CostEstimate, PlanOperator) = match join {
            JoinClause::Inner { on, .. } => {
                let (cost, strategy) = self.cost_model.estimate_join(&left.cost, &right.cost);
                (cost, PlanOperator::Join { strategy, condition: on.to_string() })
            }
            JoinClause::Geodesic(geodesic) => {
                let (cost, strategy) =
                    self.cost_model
                        .estimate_geodesic_join(&left.cost, &right.cost, geodesic.threshold);
                (
                    cost,
                    PlanOperator::GeodesicJoin {
                        strategy,
                        left_column: geodesic.left_column.to_string(),
                        right_column: geodesic.right_column.to_string(),
                        op: geodesic.op.to_string(),
                        threshold: geodesic.threshold,
                    },
                )
            }
        };
        Ok(PlanNode::new(operator, cost, vec![left, right]))
    }
}
