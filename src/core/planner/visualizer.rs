use super::plan::{PlanNode, PlanOperator};
use serde_json::{json, Map, Value};

/// Renders plan trees for diagnostics.
pub struct PlanVisualizer;

impl PlanVisualizer {
    /// Indented, one operator per line, children below their parent:
    ///
    /// ```text
    /// LIMIT 10  (cost=61.27 rows=10)
    ///   FILTER a > 1  (cost=61.27 rows=1000)
    ///     SCAN events  (cost=61.27 rows=2000)
    /// ```
    pub fn explain(plan: &PlanNode) -> String {
        let mut out = String::new();
        Self::explain_into(plan, 0, &mut out);
        out
    }

    fn explain_into(node: &PlanNode, depth: usize, out: &mut String) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&Self::label(node));
        out.push_str(&format!(
            "  (cost={:.2} rows={:.0}",
            node.cost.total_cost, node.cost.estimated_rows
        ));
        if node.cost.curvature_penalty > 0.0 {
            out.push_str(&format!(" curvature_penalty={:.2}", node.cost.curvature_penalty));
        }
        out.push_str(")\n");
        for child in &node.children {
            Self::explain_into(child, depth + 1, out);
        }
    }

    fn label(node: &PlanNode) -> String {
        let kind = node.kind();
        match &node.operator {
            PlanOperator::Scan { table, alias: Some(alias) } => format!("{} {} AS {}", kind, table, alias),
            PlanOperator::Scan { table, alias: None } => format!("{} {}", kind, table),
            PlanOperator::IndexScan { table, index, condition } => {
                format!("{} {} USING {} ({})", kind, table, index, condition)
            }
            PlanOperator::GeodesicScan { table, column, point, radius } => {
                let coords: Vec<String> = point.iter().map(|c| c.to_string()).collect();
                format!("{} {} {} within {} of ({})", kind, table, column, radius, coords.join(", "))
            }
            PlanOperator::Filter { condition } => format!("{} {}", kind, condition),
            PlanOperator::Join { strategy, condition } => format!("{} [{}] ON {}", kind, strategy, condition),
            PlanOperator::GeodesicJoin { strategy, left_column, right_column, op, threshold } => format!(
                "{} [{}] GEODESIC_DISTANCE({}, {}) {} {}",
                kind, strategy, left_column, right_column, op, threshold
            ),
            PlanOperator::Aggregate { group_by, aggregates } if group_by.is_empty() => {
                format!("{} {}", kind, aggregates.join(", "))
            }
            PlanOperator::Aggregate { group_by, aggregates } => {
                format!("{} {} BY {}", kind, aggregates.join(", "), group_by.join(", "))
            }
            PlanOperator::Sort { keys } => format!("{} {}", kind, keys.join(", ")),
            PlanOperator::Limit { limit } => format!("{} {}", kind, limit),
        }
    }

    /// Plain data form: `{kind, <operator fields>, cost, metadata, children}`.
    pub fn to_value(plan: &PlanNode) -> Value {
        let mut object = match serde_json::to_value(&plan.operator) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("kind".to_string(), Value::from(plan.kind().as_str()));
                map
            }
        };
        object.insert(
            "cost".to_string(),
            json!({
                "cpu": plan.cost.cpu_cost,
                "io": plan.cost.io_cost,
                "network": plan.cost.network_cost,
                "curvature_penalty": plan.cost.curvature_penalty,
                "total": plan.cost.total_cost,
                "rows": plan.cost.estimated_rows,
            }),
        );
        object.insert(
            "metadata".to_string(),
            Value::Object(plan.metadata.clone().into_iter().collect()),
        );
        object.insert(
            "children".to_string(),
            Value::Array(plan.children.iter().map(Self::to_value).collect()),
        );
        Value::Object(object)
    }
}
