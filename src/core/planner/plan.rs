use super::cost::{CostEstimate, JoinStrategy};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    Scan,
    IndexScan,
    GeodesicScan,
    Filter,
    Join,
    GeodesicJoin,
    Aggregate,
    Sort,
    Limit,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Scan => "SCAN",
            PlanKind::IndexScan => "INDEX_SCAN",
            PlanKind::GeodesicScan => "GEODESIC_SCAN",
            PlanKind::Filter => "FILTER",
            PlanKind::Join => "JOIN",
            PlanKind::GeodesicJoin => "GEODESIC_JOIN",
            PlanKind::Aggregate => "AGGREGATE",
            PlanKind::Sort => "SORT",
            PlanKind::Limit => "LIMIT",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanOperator {
    Scan {
        table: String,
        alias: Option<String>,
    },
    IndexScan {
        table: String,
        index: String,
        condition: String,
    },
    GeodesicScan {
        table: String,
        column: String,
        point: Vec<f64>,
        radius: f64,
    },
    Filter {
        condition: String,
    },
    Join {
        strategy: JoinStrategy,
        condition: String,
    },
    GeodesicJoin {
        strategy: JoinStrategy,
        left_column: String,
        right_column: String,
        op: String,
        threshold: f64,
    },
    Aggregate {
        group_by: Vec<String>,
        aggregates: Vec<String>,
    },
    Sort {
        keys: Vec<String>,
    },
    Limit {
        limit: u64,
    },
}

impl PlanOperator {
    pub fn kind(&self) -> PlanKind {
        match self {
            PlanOperator::Scan { .. } => PlanKind::Scan,
            PlanOperator::IndexScan { .. } => PlanKind::IndexScan,
            PlanOperator::GeodesicScan { .. } => PlanKind::GeodesicScan,
            PlanOperator::Filter { .. } => PlanKind::Filter,
            PlanOperator::Join { .. } => PlanKind::Join,
            PlanOperator::GeodesicJoin { .. } => PlanKind::GeodesicJoin,
            PlanOperator::Aggregate { .. } => PlanKind::Aggregate,
            PlanOperator::Sort { .. } => PlanKind::Sort,
            PlanOperator::Limit { .. } => PlanKind::Limit,
        }
    }
}

/// One operator of a query plan. `cost` covers this node and everything below it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub operator: PlanOperator,
    pub cost: CostEstimate,
    pub children: Vec<PlanNode>,
    pub metadata: BTreeMap<String, Value>,
}

impl PlanNode {
    pub fn new(operator: PlanOperator, cost: CostEstimate, children: Vec<PlanNode>) -> Self {
        Self {
            operator,
            cost,
            children,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> PlanKind {
        self.operator.kind()
    }

    pub fn total_cost(&self) -> f64 {
        self.cost.total_cost
    }

    pub fn estimated_rows(&self) -> f64 {
        self.cost.estimated_rows
    }

    /// Pre-order: this node, then each child subtree left to right.
    pub fn iter(&self) -> Vec<&PlanNode> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.iter());
        }
        nodes
    }

    pub fn find(&self, kind: PlanKind) -> Option<&PlanNode> {
        self.iter().into_iter().find(|node| node.kind() == kind)
    }

    pub fn kinds(&self) -> Vec<PlanKind> {
        self.iter().into_iter().map(PlanNode::kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(table: &str) -> PlanNode {
        PlanNode::new(
            PlanOperator::Scan { table: table.to_string(), alias: None },
            CostEstimate::new(1.0, 1.0, 0.0, 0.0, 10.0),
            Vec::new(),
        )
    }

    #[test]
    fn test_tree_walk() {
        let join = PlanNode::new(
            PlanOperator::Join { strategy: JoinStrategy::NestedLoop, condition: "a.id = b.id".to_string() },
            CostEstimate::new(3.0, 2.0, 0.0, 0.0, 10.0),
            vec![scan("a"), scan("b")],
        );
        let root = PlanNode::new(
            PlanOperator::Limit { limit: 5 },
            join.cost.with_rows(5.0),
            vec![join],
        )
        .with_metadata("note", "top");

        assert_eq!(root.kinds(), vec![PlanKind::Limit, PlanKind::Join, PlanKind::Scan, PlanKind::Scan]);
        assert_eq!(root.find(PlanKind::Join).unwrap().children.len(), 2);
        assert!(root.find(PlanKind::Sort).is_none());
        assert_eq!(root.metadata["note"], Value::from("top"));
    }

    #[test]
    fn test_operator_serializes_with_kind_tag() {
        let value = serde_json::to_value(PlanOperator::GeodesicScan {
            table: "t".to_string(),
            column: "pos".to_string(),
            point: vec![0.0, 1.0],
            radius: 2.0,
        })
        .unwrap();
        assert_eq!(value["kind"], Value::from("GEODESIC_SCAN"));
        assert_eq!(value["radius"], Value::from(2.0));
    }
}
