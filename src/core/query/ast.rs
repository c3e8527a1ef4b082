use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub columns: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<Condition>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
}

impl SelectStatement {
    pub fn has_aggregates(&self) -> bool {
        self.columns
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// The name columns of this table are qualified with.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {}", self.name, alias),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Column(ColumnRef),
    /// `argument` is `None` for `COUNT(*)`.
    Aggregate {
        function: AggregateFunction,
        argument: Option<ColumnRef>,
    },
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelectItem::Wildcard => write!(f, "*"),
            SelectItem::Column(column) => write!(f, "{}", column),
            SelectItem::Aggregate { function, argument: Some(column) } => {
                write!(f, "{}({})", function, column)
            }
            SelectItem::Aggregate { function, argument: None } => write!(f, "{}(*)", function),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComparisonOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "!=",
            ComparisonOp::Lt => "<",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Gte => ">=",
        }
    }

    /// The operator with its operands swapped: `a < b` is `b > a`.
    pub fn flipped(&self) -> Self {
        match self {
            ComparisonOp::Lt => ComparisonOp::Gt,
            ComparisonOp::Lte => ComparisonOp::Gte,
            ComparisonOp::Gt => ComparisonOp::Lt,
            ComparisonOp::Gte => ComparisonOp::Lte,
            other => *other,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    String(String),
    Column(ColumnRef),
    /// `GEODESIC_DISTANCE(column, POINT(x, y, ...))`; the point is carried as given.
    GeodesicDistance { column: ColumnRef, point: Vec<f64> },
    /// `CURVATURE(column)` or bare `CURVATURE`.
    Curvature(ColumnRef),
}

impl Operand {
    pub fn is_literal(&self) -> bool {
        matches!(self, Operand::Number(_) | Operand::String(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Number(n) => write!(f, "{}", n),
            Operand::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Operand::Column(column) => write!(f, "{}", column),
            Operand::GeodesicDistance { column, point } => {
                let coords: Vec<String> = point.iter().map(|c| c.to_string()).collect();
                write!(f, "GEODESIC_DISTANCE({}, POINT({}))", column, coords.join(", "))
            }
            Operand::Curvature(column) => write!(f, "CURVATURE({})", column),
        }
    }
}

/// A single binary comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub left: Operand,
    pub op: ComparisonOp,
    pub right: Operand,
}

/// `GEODESIC_DISTANCE(col, POINT(..)) <op> radius`, normalized so the distance is on the left.
#[derive(Debug, Clone, PartialEq)]
pub struct GeodesicRange<'a> {
    pub column: &'a ColumnRef,
    pub point: &'a [f64],
    pub op: ComparisonOp,
    pub radius: f64,
}

impl Condition {
    pub fn new(left: Operand, op: ComparisonOp, right: Operand) -> Self {
        Self { left, op, right }
    }

    pub fn geodesic_range(&self) -> Option<GeodesicRange<'_>> {
        match (&self.left, &self.right) {
            (Operand::GeodesicDistance { column, point }, Operand::Number(radius)) => {
                Some(GeodesicRange { column, point, op: self.op, radius: *radius })
            }
            (Operand::Number(radius), Operand::GeodesicDistance { column, point }) => {
                Some(GeodesicRange { column, point, op: self.op.flipped(), radius: *radius })
            }
            _ => None,
        }
    }

    /// The curvature column and comparison value of a curvature filter.
    pub fn curvature_filter(&self) -> Option<(&ColumnRef, ComparisonOp, f64)> {
        match (&self.left, &self.right) {
            (Operand::Curvature(column), Operand::Number(value)) => Some((column, self.op, *value)),
            (Operand::Number(value), Operand::Curvature(column)) => {
                Some((column, self.op.flipped(), *value))
            }
            _ => None,
        }
    }

    /// A plain column compared with a literal, normalized column-first.
    pub fn column_literal(&self) -> Option<(&ColumnRef, ComparisonOp, &Operand)> {
        match (&self.left, &self.right) {
            (Operand::Column(column), literal) if literal.is_literal() => {
                Some((column, self.op, literal))
            }
            (literal, Operand::Column(column)) if literal.is_literal() => {
                Some((column, self.op.flipped(), literal))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeodesicJoin {
    pub table: TableRef,
    pub op: ComparisonOp,
    pub threshold: f64,
    pub left_column: ColumnRef,
    pub right_column: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinClause {
    Inner { table: TableRef, on: Condition },
    Geodesic(GeodesicJoin),
}

impl JoinClause {
    pub fn table(&self) -> &TableRef {
        match self {
            JoinClause::Inner { table, .. } => table,
            JoinClause::Geodesic(join) => &join.table,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub column: ColumnRef,
    pub descending: bool,
}

impl fmt::Display for OrderByItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.column, if self.descending { "DESC" } else { "ASC" })
    }
}
