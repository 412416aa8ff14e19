use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        category: String,
        timezone: String,
        slot_minutes: i64,
        max_concurrent: u32,
        /// Weekday-keyed JSON, parsed by `OpenHours::from_legacy_json`.
        open_hours: String,
    },
    UpdateResource {
        id: Ulid,
        changes: ResourceChanges,
    },
    SelectResources,
    SelectSlots {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        only_available: bool,
    },
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        slots: u32,
        expires_at: Option<Ms>,
    },
    RescheduleReservation {
        id: Ulid,
        start: Ms,
    },
    ConfirmReservation {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectReservations {
        resource_id: Ulid,
        window: Option<(Ms, Ms)>,
    },
    SelectReservation {
        id: Ulid,
    },
    InsertBlackout {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    },
    DeleteBlackout {
        id: Ulid,
    },
    SelectBlackouts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

/// Columns set by `UPDATE resources`. Unset columns keep their value.
#[derive(Debug, Default, PartialEq)]
pub struct ResourceChanges {
    pub name: Option<String>,
    pub category: Option<String>,
    pub timezone: Option<String>,
    pub slot_minutes: Option<i64>,
    pub max_concurrent: Option<u32>,
    pub open_hours: Option<String>,
}

impl ResourceChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

const RESOURCE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "category",
    "timezone",
    "slot_minutes",
    "max_concurrent",
    "open_hours",
];
const RESERVATION_COLUMNS: &[&str] = &["id", "resource_id", "requester_id", "start", "slots", "expires_at"];
const BLACKOUT_COLUMNS: &[&str] = &["id", "resource_id", "start", "end", "reason"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(&table.relation, assignments, selection)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row keyed by column name. Without a column list the table's
/// canonical column order is assumed.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str, canonical: &[&str], columns: &[ast::Ident], values: &'a [Expr]) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            canonical.iter().map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} values for {} columns",
                values.len(),
                names.len()
            )));
        }
        for name in &names {
            if !canonical.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(name.clone()));
            }
        }
        Ok(Self {
            table,
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", RESOURCE_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertResource {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string_expr(row.require("name")?)?,
                category: row.get("category").map(parse_string_expr).transpose()?.unwrap_or_default(),
                timezone: row
                    .get("timezone")
                    .map(parse_string_expr)
                    .transpose()?
                    .unwrap_or_else(|| "UTC".into()),
                slot_minutes: parse_i64_expr(row.require("slot_minutes")?)?,
                max_concurrent: row.get("max_concurrent").map(parse_u32).transpose()?.unwrap_or(1),
                open_hours: parse_string_expr(row.require("open_hours")?)?,
            })
        }
        "reservations" => {
            let row = Row::new("reservations", RESERVATION_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertReservation {
                id: parse_ulid_expr(row.require("id")?)?,
                resource_id: parse_ulid_expr(row.require("resource_id")?)?,
                requester_id: parse_string_expr(row.require("requester_id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                slots: row.get("slots").map(parse_u32).transpose()?.unwrap_or(1),
                expires_at: row.get("expires_at").map(parse_i64_or_null).transpose()?.flatten(),
            })
        }
        "blackouts" => {
            let row = Row::new("blackouts", BLACKOUT_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertBlackout {
                id: parse_ulid_expr(row.require("id")?)?,
                resource_id: parse_ulid_expr(row.require("resource_id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                end: parse_i64_expr(row.require("end")?)?,
                reason: row.get("reason").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }

    match table.as_str() {
        "resources" => {
            let mut changes = ResourceChanges::default();
            for (column, value) in set {
                match column.as_str() {
                    "name" => changes.name = Some(parse_string_expr(value)?),
                    "category" => changes.category = Some(parse_string_expr(value)?),
                    "timezone" => changes.timezone = Some(parse_string_expr(value)?),
                    "slot_minutes" => changes.slot_minutes = Some(parse_i64_expr(value)?),
                    "max_concurrent" => changes.max_concurrent = Some(parse_u32(value)?),
                    "open_hours" => changes.open_hours = Some(parse_string_expr(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            if changes.is_empty() {
                return Err(SqlError::Parse("UPDATE resources sets nothing".into()));
            }
            Ok(Command::UpdateResource { id, changes })
        }
        "reservations" => match set.as_slice() {
            [(column, value)] if column == "start" => Ok(Command::RescheduleReservation {
                id,
                start: parse_i64_expr(value)?,
            }),
            [(column, value)] if column == "status" => {
                match parse_string_expr(value)?.to_lowercase().as_str() {
                    "confirmed" => Ok(Command::ConfirmReservation { id }),
                    "cancelled" | "canceled" => Ok(Command::CancelReservation { id }),
                    other => Err(SqlError::Unsupported(format!("status '{other}'"))),
                }
            }
            _ => Err(SqlError::Unsupported(
                "UPDATE reservations must set exactly one of start, status".into(),
            )),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id }),
        "blackouts" => Ok(Command::DeleteBlackout { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Filters collected from a WHERE clause of AND-ed comparisons.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    available: Option<bool>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut f = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut f)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "slots" => Ok(Command::SelectSlots {
            resource_id: f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
            only_available: f.available.unwrap_or(false),
        }),
        "reservations" => {
            if let Some(id) = f.id {
                return Ok(Command::SelectReservation { id });
            }
            let window = match (f.start, f.end) {
                (Some(start), Some(end)) => Some((start, end)),
                (None, None) => None,
                (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
                (Some(_), None) => return Err(SqlError::MissingFilter("end")),
            };
            Ok(Command::SelectReservations {
                resource_id: f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                window,
            })
        }
        "blackouts" => Ok(Command::SelectBlackouts {
            resource_id: f.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
            start: f.start.ok_or(SqlError::MissingFilter("start"))?,
            end: f.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, f: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, f)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, f)?;
                extract_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => f.id = Some(parse_ulid_expr(right)?),
                Some("resource_id") => f.resource_id = Some(parse_ulid_expr(right)?),
                Some("available") => f.available = Some(parse_bool(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    f.start = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    f.end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        // Bare `WHERE available`
        other => {
            if expr_column_name(other).as_deref() == Some("available") {
                f.available = Some(true);
            }
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(s.clone())
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
