use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Optional `skip = n` / `take = n` pseudo-filters, validated by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paging {
    pub skip: Option<i64>,
    pub take: Option<i64>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        id: Option<Ulid>,
        draft: SlotDraft,
        returning: bool,
    },
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
        returning: bool,
    },
    DeleteSlot {
        id: Ulid,
    },
    SelectSlots {
        id: Option<Ulid>,
        filter: SlotFilter,
        paging: Paging,
    },
    InsertBooking {
        id: Option<Ulid>,
        slot_id: Ulid,
        notes: Option<String>,
        returning: bool,
    },
    /// `DELETE FROM bookings` cancels; the row stays with status `cancelled`.
    CancelBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        paging: Paging,
    },
    SelectMyBookings {
        paging: Paging,
    },
    PurgeUser {
        user_id: Ulid,
    },
}

/// Which row shape a statement produces, for describe messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Slots,
    Bookings,
}

impl Command {
    pub fn shape(&self) -> ResultShape {
        match self {
            Command::InsertSlot { returning: true, .. }
            | Command::UpdateSlot { returning: true, .. }
            | Command::SelectSlots { .. } => ResultShape::Slots,
            Command::InsertBooking { returning: true, .. }
            | Command::SelectBookings { .. }
            | Command::SelectMyBookings { .. } => ResultShape::Bookings,
            _ => ResultShape::None,
        }
    }
}

/// Result shape of a statement that may still hold `$n` placeholders.
///
/// Only the statement kind and its table are read, so placeholders need no
/// values. Unparseable text describes as `None`.
pub fn describe_shape(sql: &str) -> ResultShape {
    let Ok(stmts) = Parser::parse_sql(&PostgreSqlDialect {}, sql) else {
        return ResultShape::None;
    };
    let [stmt] = stmts.as_slice() else {
        return ResultShape::None;
    };

    let table = match stmt {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|t| table_factor_name(&t.relation).ok()),
            _ => None,
        },
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok(),
        Statement::Update {
            table,
            returning: Some(_),
            ..
        } => table_factor_name(&table.relation).ok(),
        _ => None,
    };
    match table.as_deref() {
        Some("slots") => ResultShape::Slots,
        Some("bookings" | "my_bookings") => ResultShape::Bookings,
        _ => ResultShape::None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let values = &rows[0];
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }
    let returning = insert.returning.is_some();

    match table.as_str() {
        "slots" => {
            let (mut id, mut title, mut description) = (None, None, None);
            let (mut start, mut end, mut max_participants) = (None, None, None);
            for (col, expr) in columns.iter().zip(values) {
                match col.as_str() {
                    "id" => id = parse_ulid_or_null(expr)?,
                    "title" => title = Some(parse_string(expr)?),
                    "description" => description = parse_string_or_null(expr)?,
                    "start_time" => start = Some(parse_timestamp(expr)?),
                    "end_time" => end = Some(parse_timestamp(expr)?),
                    "max_participants" => max_participants = Some(parse_u32(expr)?),
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::InsertSlot {
                id,
                draft: SlotDraft {
                    title: title.ok_or(SqlError::MissingColumn("title"))?,
                    description,
                    start: start.ok_or(SqlError::MissingColumn("start_time"))?,
                    end: end.ok_or(SqlError::MissingColumn("end_time"))?,
                    max_participants: max_participants.unwrap_or(1),
                },
                returning,
            })
        }
        "bookings" => {
            let (mut id, mut slot_id, mut notes) = (None, None, None);
            for (col, expr) in columns.iter().zip(values) {
                match col.as_str() {
                    "id" => id = parse_ulid_or_null(expr)?,
                    "slot_id" => slot_id = Some(parse_ulid(expr)?),
                    "notes" => notes = parse_string_or_null(expr)?,
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::InsertBooking {
                id,
                slot_id: slot_id.ok_or(SqlError::MissingColumn("slot_id"))?,
                notes,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "slots" {
        return Err(SqlError::UnknownTable(name));
    }
    let id = extract_where_id(selection)?;

    let mut patch = SlotPatch::default();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let expr = &assignment.value;
        match col.as_str() {
            "title" => patch.title = Some(parse_string(expr)?),
            "description" => patch.description = Some(parse_string_or_null(expr)?),
            "start_time" => patch.start = Some(parse_timestamp(expr)?),
            "end_time" => patch.end = Some(parse_timestamp(expr)?),
            "max_participants" => patch.max_participants = Some(parse_u32(expr)?),
            "is_available" => patch.is_available = Some(parse_bool(expr)?),
            _ => return Err(SqlError::UnknownColumn(col)),
        }
    }
    if patch == SlotPatch::default() {
        return Err(SqlError::Parse("UPDATE without assignments".into()));
    }
    Ok(Command::UpdateSlot { id, patch, returning })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
        "users" => Ok(Command::PurgeUser { user_id: id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    let paging = Paging {
        skip: filters.skip,
        take: filters.take,
    };

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            id: filters.id,
            filter: SlotFilter {
                available_only: filters.is_available.unwrap_or(false),
                from: filters.start_time,
                until: filters.end_time,
            },
            paging,
        }),
        "bookings" => Ok(Command::SelectBookings {
            id: filters.id,
            paging,
        }),
        "my_bookings" => Ok(Command::SelectMyBookings { paging }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    is_available: Option<bool>,
    start_time: Option<Ms>,
    end_time: Option<Ms>,
    skip: Option<i64>,
    take: Option<i64>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left);
            match (op, col.as_deref()) {
                (ast::BinaryOperator::And, _) => {
                    extract_filters(left, filters)?;
                    extract_filters(right, filters)?;
                }
                (ast::BinaryOperator::Eq, Some("id")) => filters.id = Some(parse_ulid(right)?),
                (ast::BinaryOperator::Eq, Some("is_available")) => {
                    filters.is_available = Some(parse_bool(right)?);
                }
                (ast::BinaryOperator::Eq, Some("skip")) => filters.skip = Some(parse_i64(right)?),
                (ast::BinaryOperator::Eq, Some("take")) => filters.take = Some(parse_i64(right)?),
                (ast::BinaryOperator::GtEq, Some("start_time")) => {
                    filters.start_time = Some(parse_timestamp(right)?);
                }
                (ast::BinaryOperator::LtEq, Some("end_time")) => {
                    filters.end_time = Some(parse_timestamp(right)?);
                }
                _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
            }
            Ok(())
        }
        Expr::Identifier(ident) if ident.value.eq_ignore_ascii_case("is_available") => {
            filters.is_available = Some(true);
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::BadLiteral(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::BadLiteral(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::BadLiteral(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::BadLiteral(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::BadLiteral(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::BadLiteral(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::BadLiteral(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::BadLiteral(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, or an RFC 3339 string with any UTC offset.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => match s.trim().parse::<i64>() {
            Ok(ms) => Ok(ms),
            Err(_) => chrono::DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| SqlError::BadTimestamp(format!("{s:?}: {e}"))),
        },
        _ => parse_i64(expr),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(usize, usize),
    MissingFilter(&'static str),
    BadLiteral(String),
    BadTimestamp(String),
}

impl SqlError {
    pub fn code(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::Unsupported(_) => "0A000",
            SqlError::BadLiteral(_) => "22P02",
            SqlError::BadTimestamp(_) => "22007",
            SqlError::Parse(_)
            | SqlError::Empty
            | SqlError::MissingColumn(_)
            | SqlError::WrongArity(..)
            | SqlError::MissingFilter(_) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadLiteral(s) => write!(f, "invalid literal: {s}"),
            SqlError::BadTimestamp(s) => write!(f, "invalid timestamp: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
