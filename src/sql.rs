use std::collections::BTreeMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::error::AppError;
use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetAccessToken {
        token: String,
    },
    ResetAccessToken,
    Login {
        username: String,
        password: String,
        admin_only: bool,
    },
    Refresh {
        refresh_token: String,
    },
    Register {
        username: String,
        password: String,
        email: String,
    },
    Me,
    ListAccounts {
        username: Option<String>,
        page: Pagination,
    },
    FreezeAccount {
        id: Ulid,
        frozen: bool,
    },
    GrantRole {
        account_id: Ulid,
        role: String,
    },
    CreateRoom {
        id: Option<Ulid>,
        spec: RoomSpec,
    },
    UpdateRoom {
        id: Ulid,
        patch: RoomPatch,
    },
    DeleteRoom {
        id: Ulid,
    },
    GetRoom {
        id: Ulid,
    },
    ListRooms {
        name: Option<String>,
        location: Option<String>,
        page: Pagination,
    },
    Availability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    RequestBooking {
        id: Option<Ulid>,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    },
    Reschedule {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    ListBookings {
        filter: BookingFilter,
        page: Pagination,
    },
    Urge {
        booking_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_session_statement(sql)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `SET access_token = '..'` / `RESET access_token`, handled before the SQL
/// parser so the token never has to survive its value grammar.
fn parse_session_statement(sql: &str) -> Result<Option<Command>, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();
    if upper == "RESET ACCESS_TOKEN" {
        return Ok(Some(Command::ResetAccessToken));
    }
    let Some(rest) = upper.strip_prefix("SET ACCESS_TOKEN") else {
        return Ok(None);
    };
    // Slice the original text so the token keeps its case.
    let rest = trimmed[trimmed.len() - rest.len()..].trim_start();
    let value = if let Some(v) = rest.strip_prefix('=') {
        v
    } else if rest.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("TO")) {
        &rest[2..]
    } else {
        return Err(SqlError::Parse("expected SET access_token = '<token>'".into()));
    };
    let token = value
        .trim()
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SqlError::Parse("access_token must be a non-empty quoted string".into()))?;
    Ok(Some(Command::SetAccessToken {
        token: token.to_string(),
    }))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let mut row = Row::from_insert(insert)?;

    let cmd = match table.as_str() {
        "accounts" => Command::Register {
            username: row.required_string("username")?,
            password: row.required_string("password")?,
            email: row.required_string("email")?,
        },
        "account_roles" => Command::GrantRole {
            account_id: row.required_ulid("account_id")?,
            role: row.required_string("role")?,
        },
        "rooms" => Command::CreateRoom {
            id: row.optional_ulid("id")?,
            spec: RoomSpec {
                name: row.required_string("name")?,
                capacity: row.required_u32("capacity")?,
                location: row.optional_string("location")?,
                equipment: row.optional_string("equipment")?,
                description: row.optional_string("description")?,
            },
        },
        "bookings" => Command::RequestBooking {
            id: row.optional_ulid("id")?,
            room_id: row.required_ulid("room_id")?,
            start: row.required_i64("start")?,
            end: row.required_i64("end")?,
            note: row.optional_string("note")?,
        },
        "urges" => Command::Urge {
            booking_id: row.required_ulid("booking_id")?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    row.finish()?;
    Ok(cmd)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::from_selection(delete.selection.as_ref())?;
    let cmd = match table.as_str() {
        "rooms" => Command::DeleteRoom {
            id: filters.required_eq("id", parse_ulid_expr)?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Row::from_assignments(assignments)?;
    let mut filters = Filters::from_selection(selection)?;
    let id = filters.required_eq("id", parse_ulid_expr)?;

    let cmd = match table.as_str() {
        "accounts" => Command::FreezeAccount {
            id,
            frozen: set.required_bool("is_frozen")?,
        },
        "rooms" => {
            let patch = RoomPatch {
                name: set.take_with("name", parse_string_expr)?,
                capacity: set.take_with("capacity", parse_u32_expr)?,
                location: set.take_with("location", parse_optional_string_expr)?,
                equipment: set.take_with("equipment", parse_optional_string_expr)?,
                description: set.take_with("description", parse_optional_string_expr)?,
            };
            if patch == RoomPatch::default() {
                return Err(SqlError::MissingColumn("name, capacity, location, equipment or description"));
            }
            Command::UpdateRoom { id, patch }
        }
        "bookings" => {
            if let Some(status) = set.take_with("status", parse_string_expr)? {
                let status: BookingStatus = status.parse().map_err(SqlError::InvalidValue)?;
                if status == BookingStatus::Requested {
                    return Err(SqlError::InvalidValue(
                        "status can only be set to approved, rejected or released".into(),
                    ));
                }
                Command::SetBookingStatus { id, status }
            } else {
                Command::Reschedule {
                    id,
                    start: set.required_i64("start")?,
                    end: set.required_i64("end")?,
                }
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    set.finish()?;
    filters.finish()?;
    Ok(cmd)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let mut f = Filters::from_selection(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "login" => Command::Login {
            username: f.required_eq("username", parse_string_expr)?,
            password: f.required_eq("password", parse_string_expr)?,
            admin_only: f.eq("admin", parse_bool_expr)?.unwrap_or(false),
        },
        "refresh" => Command::Refresh {
            refresh_token: f.required_eq("refresh_token", parse_string_expr)?,
        },
        "me" => Command::Me,
        "accounts" => Command::ListAccounts {
            username: f.eq("username", parse_string_expr)?,
            page: f.pagination()?,
        },
        "rooms" => match f.eq("id", parse_ulid_expr)? {
            Some(id) => Command::GetRoom { id },
            None => Command::ListRooms {
                name: f.eq("name", parse_string_expr)?,
                location: f.eq("location", parse_string_expr)?,
                page: f.pagination()?,
            },
        },
        "availability" => Command::Availability {
            room_id: f.required_eq("room_id", parse_ulid_expr)?,
            start: f
                .take("start", Op::GtEq)
                .map(parse_i64_expr)
                .transpose()?
                .ok_or(SqlError::MissingFilter("start"))?,
            end: f
                .take("end", Op::LtEq)
                .map(parse_i64_expr)
                .transpose()?
                .ok_or(SqlError::MissingFilter("end"))?,
        },
        "bookings" => {
            let status = f
                .eq("status", parse_string_expr)?
                .map(|s| s.parse::<BookingStatus>())
                .transpose()
                .map_err(SqlError::InvalidValue)?;
            Command::ListBookings {
                filter: BookingFilter {
                    room_id: f.eq("room_id", parse_ulid_expr)?,
                    room_name: f.eq("room_name", parse_string_expr)?,
                    location: f.eq("location", parse_string_expr)?,
                    account_id: f.eq("account_id", parse_ulid_expr)?,
                    status,
                    username: f.eq("username", parse_string_expr)?,
                    start_from: f.take("start", Op::GtEq).map(parse_i64_expr).transpose()?,
                    start_to: f.take("start", Op::LtEq).map(parse_i64_expr).transpose()?,
                },
                page: f.pagination()?,
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

/// Column layout a statement produces, decided from its verb and table
/// alone. Used to describe prepared statements before their parameters are
/// bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Empty,
    Tokens,
    Identity,
    Account,
    Room,
    Spans,
    Booking,
    Message,
}

pub fn result_shape(sql: &str) -> ResultShape {
    if matches!(parse_session_statement(sql), Ok(Some(_))) {
        return ResultShape::Empty;
    }
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::Empty;
    };
    let target = match stmts.first() {
        Some(Statement::Insert(insert)) => insert_table_name(insert).ok().map(|t| ("insert", t)),
        Some(Statement::Update { table, .. }) => table_factor_name(&table.relation).ok().map(|t| ("update", t)),
        Some(Statement::Query(query)) => match query.body.as_ref() {
            SetExpr::Select(s) => s
                .from
                .first()
                .and_then(|f| table_factor_name(&f.relation).ok())
                .map(|t| ("select", t)),
            _ => None,
        },
        _ => None,
    };
    let Some((verb, table)) = target else {
        return ResultShape::Empty;
    };
    match (verb, table.as_str()) {
        ("select", "login" | "refresh") => ResultShape::Tokens,
        ("select", "me") => ResultShape::Identity,
        ("select", "availability") => ResultShape::Spans,
        (_, "accounts") => ResultShape::Account,
        (_, "rooms") => ResultShape::Room,
        (_, "bookings") => ResultShape::Booking,
        ("insert", "urges") => ResultShape::Message,
        _ => ResultShape::Empty,
    }
}

// ── Column maps ───────────────────────────────────────────────

/// Column → value for one INSERT row or one UPDATE SET list. Every column
/// must be consumed; leftovers are reported by `finish`.
struct Row<'a> {
    values: BTreeMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(insert: &'a ast::Insert) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        }
        if insert.columns.is_empty() {
            return Err(SqlError::Parse("INSERT requires an explicit column list".into()));
        }
        let row = &rows[0];
        if row.len() != insert.columns.len() {
            return Err(SqlError::Parse(format!(
                "{} columns but {} values",
                insert.columns.len(),
                row.len()
            )));
        }
        let mut values = BTreeMap::new();
        for (col, expr) in insert.columns.iter().zip(row) {
            if values.insert(col.value.to_lowercase(), expr).is_some() {
                return Err(SqlError::Parse(format!("duplicate column {}", col.value)));
            }
        }
        Ok(Self { values })
    }

    fn from_assignments(assignments: &'a [ast::Assignment]) -> Result<Self, SqlError> {
        let mut values = BTreeMap::new();
        for a in assignments {
            let name = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            if values.insert(name.clone(), &a.value).is_some() {
                return Err(SqlError::Parse(format!("duplicate column {name}")));
            }
        }
        Ok(Self { values })
    }

    fn take_with<T>(
        &mut self,
        col: &'static str,
        parse: fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.values.remove(col).map(parse).transpose()
    }

    fn required<T>(&mut self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<T, SqlError> {
        self.take_with(col, parse)?.ok_or(SqlError::MissingColumn(col))
    }

    fn required_string(&mut self, col: &'static str) -> Result<String, SqlError> {
        self.required(col, parse_string_expr)
    }

    fn optional_string(&mut self, col: &'static str) -> Result<Option<String>, SqlError> {
        Ok(self.take_with(col, parse_optional_string_expr)?.flatten())
    }

    fn required_ulid(&mut self, col: &'static str) -> Result<Ulid, SqlError> {
        self.required(col, parse_ulid_expr)
    }

    fn optional_ulid(&mut self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        Ok(self.take_with(col, parse_ulid_or_null)?.flatten())
    }

    fn required_i64(&mut self, col: &'static str) -> Result<i64, SqlError> {
        self.required(col, parse_i64_expr)
    }

    fn required_u32(&mut self, col: &'static str) -> Result<u32, SqlError> {
        self.required(col, parse_u32_expr)
    }

    fn required_bool(&mut self, col: &'static str) -> Result<bool, SqlError> {
        self.required(col, parse_bool_expr)
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.values.into_keys().next() {
            Some(col) => Err(SqlError::UnknownColumn(col)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// AND-ed `column <op> value` predicates from a WHERE clause.
struct Filters<'a> {
    preds: Vec<(String, Op, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut preds = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut preds)?;
        }
        Ok(Self { preds })
    }

    fn take(&mut self, col: &str, op: Op) -> Option<&'a Expr> {
        let pos = self.preds.iter().position(|(c, o, _)| c == col && *o == op)?;
        Some(self.preds.remove(pos).2)
    }

    fn eq<T>(&mut self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        self.take(col, Op::Eq).map(parse).transpose()
    }

    fn required_eq<T>(&mut self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<T, SqlError> {
        self.eq(col, parse)?.ok_or(SqlError::MissingFilter(col))
    }

    fn pagination(&mut self) -> Result<Pagination, SqlError> {
        let mut page = Pagination::default();
        if let Some(expr) = self.take("page_no", Op::Eq) {
            page.page_no = parse_i64_expr(expr)
                .ok()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n >= 1)
                .ok_or_else(|| SqlError::InvalidValue("page_no must be a positive number".into()))?;
        }
        if let Some(expr) = self.take("page_size", Op::Eq) {
            page.page_size = parse_i64_expr(expr)
                .ok()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| (1..=MAX_PAGE_SIZE).contains(n))
                .ok_or_else(|| {
                    SqlError::InvalidValue(format!("page_size must be a number between 1 and {MAX_PAGE_SIZE}"))
                })?;
        }
        Ok(page)
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.preds.into_iter().next() {
            Some((col, _, _)) => Err(SqlError::UnknownColumn(col)),
            None => Ok(()),
        }
    }
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<(String, Op, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate on {left}")))?;
            out.push((col, op, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected value, got {expr}"))),
    }
}

fn parse_optional_string_expr(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::InvalidValue(format!("expected ULID, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64_expr(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::InvalidValue(format!("expected number, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected value, got {expr}"))),
    }
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_bool_expr(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::InvalidValue(format!("expected bool, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
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
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    /// Errors in the statement's shape rather than its values.
    pub fn is_syntax(&self) -> bool {
        matches!(self, SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_))
    }
}

impl From<SqlError> for AppError {
    fn from(err: SqlError) -> Self {
        AppError::Invalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_set_and_reset_access_token() {
        assert_eq!(
            parse_sql("SET access_token = 'eyJ.Ab.cD'").unwrap(),
            Command::SetAccessToken { token: "eyJ.Ab.cD".into() }
        );
        assert_eq!(
            parse_sql("set ACCESS_TOKEN to 'tok';").unwrap(),
            Command::SetAccessToken { token: "tok".into() }
        );
        assert_eq!(parse_sql("RESET access_token").unwrap(), Command::ResetAccessToken);
        assert!(matches!(parse_sql("SET access_token = ''"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_login() {
        let cmd = parse_sql("SELECT * FROM login WHERE username = 'alice' AND password = 's3cret'").unwrap();
        assert_eq!(
            cmd,
            Command::Login {
                username: "alice".into(),
                password: "s3cret".into(),
                admin_only: false
            }
        );
        let cmd = parse_sql("SELECT * FROM login WHERE username = 'root' AND password = 'x' AND admin = true").unwrap();
        assert!(matches!(cmd, Command::Login { admin_only: true, .. }));
    }

    #[test]
    fn parse_login_requires_password() {
        assert_eq!(
            parse_sql("SELECT * FROM login WHERE username = 'alice'"),
            Err(SqlError::MissingFilter("password"))
        );
    }

    #[test]
    fn parse_register() {
        let cmd = parse_sql("INSERT INTO accounts (username, password, email) VALUES ('bob', 'pw1234', 'bob@example.com')").unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                username: "bob".into(),
                password: "pw1234".into(),
                email: "bob@example.com".into()
            }
        );
    }

    #[test]
    fn parse_insert_room_by_column_name() {
        let sql = format!(
            "INSERT INTO rooms (capacity, name, id, location) VALUES (8, 'Aurora', '{ID}', '2F')"
        );
        match parse_sql(&sql).unwrap() {
            Command::CreateRoom { id: room_id, spec } => {
                assert_eq!(room_id, Some(id()));
                assert_eq!(spec.name, "Aurora");
                assert_eq!(spec.capacity, 8);
                assert_eq!(spec.location.as_deref(), Some("2F"));
                assert_eq!(spec.equipment, None);
            }
            other => panic!("expected CreateRoom, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_unknown_column_errors() {
        assert_eq!(
            parse_sql("INSERT INTO rooms (name, capacity, colour) VALUES ('A', 1, 'red')"),
            Err(SqlError::UnknownColumn("colour".into()))
        );
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (room_id, start, "end", note) VALUES ('{ID}', 1000, 2000, 'standup')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::RequestBooking {
                id: None,
                room_id: id(),
                start: 1000,
                end: 2000,
                note: Some("standup".into())
            }
        );
    }

    #[test]
    fn parse_update_room_patch() {
        let sql = format!("UPDATE rooms SET capacity = 12, equipment = NULL WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateRoom { id: room_id, patch } => {
                assert_eq!(room_id, id());
                assert_eq!(patch.capacity, Some(12));
                assert_eq!(patch.equipment, Some(None));
                assert_eq!(patch.name, None);
            }
            other => panic!("expected UpdateRoom, got {other:?}"),
        }
    }

    #[test]
    fn room_patch_applies_only_given_fields() {
        let spec = RoomSpec {
            name: "Aurora".into(),
            capacity: 4,
            location: Some("1F".into()),
            equipment: Some("tv".into()),
            description: None,
        };
        let patched = RoomPatch {
            capacity: Some(10),
            equipment: Some(None),
            ..Default::default()
        }
        .apply(spec);
        assert_eq!(patched.name, "Aurora");
        assert_eq!(patched.capacity, 10);
        assert_eq!(patched.location.as_deref(), Some("1F"));
        assert_eq!(patched.equipment, None);
    }

    #[test]
    fn parse_update_booking_status_and_reschedule() {
        let sql = format!("UPDATE bookings SET status = 'approved' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetBookingStatus { id: id(), status: BookingStatus::Approved }
        );

        let sql = format!(r#"UPDATE bookings SET start = 3000, "end" = 4000 WHERE id = '{ID}'"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Reschedule { id: id(), start: 3000, end: 4000 }
        );

        let sql = format!("UPDATE bookings SET status = 'requested' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));

        let sql = format!("UPDATE bookings SET status = 'approved', start = 1 WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownColumn("start".into())));
    }

    #[test]
    fn parse_freeze_account() {
        let sql = format!("UPDATE accounts SET is_frozen = true WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::FreezeAccount { id: id(), frozen: true });
        let sql = "UPDATE accounts SET is_frozen = true";
        assert_eq!(parse_sql(sql), Err(SqlError::MissingFilter("id")));
    }

    #[test]
    fn parse_delete_room() {
        let sql = format!("DELETE FROM rooms WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteRoom { id: id() });
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(r#"SELECT * FROM availability WHERE room_id = '{ID}' AND start >= 1000 AND "end" <= 2000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Availability { room_id: id(), start: 1000, end: 2000 }
        );
    }

    #[test]
    fn parse_list_bookings_filters() {
        let sql = format!(
            "SELECT * FROM bookings WHERE room_id = '{ID}' AND status = 'Requested' AND username = 'al' \
             AND start >= 100 AND start <= 900 AND page_no = 2 AND page_size = 5"
        );
        match parse_sql(&sql).unwrap() {
            Command::ListBookings { filter, page } => {
                assert_eq!(filter.room_id, Some(id()));
                assert_eq!(filter.status, Some(BookingStatus::Requested));
                assert_eq!(filter.username.as_deref(), Some("al"));
                assert_eq!((filter.start_from, filter.start_to), (Some(100), Some(900)));
                assert_eq!(page, Pagination { page_no: 2, page_size: 5 });
            }
            other => panic!("expected ListBookings, got {other:?}"),
        }
    }

    #[test]
    fn parse_room_lookup_and_booking_room_filters() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM rooms WHERE id = '{ID}'")).unwrap(),
            Command::GetRoom { id: id() }
        );
        assert!(parse_sql(&format!("SELECT * FROM rooms WHERE id = '{ID}' AND page_no = 2")).is_err());
        match parse_sql("SELECT * FROM bookings WHERE room_name = 'aur' AND location = '3f'").unwrap() {
            Command::ListBookings { filter, .. } => {
                assert_eq!(filter.room_name.as_deref(), Some("aur"));
                assert_eq!(filter.location.as_deref(), Some("3f"));
                assert_eq!(filter.room_id, None);
            }
            other => panic!("expected ListBookings, got {other:?}"),
        }
    }

    #[test]
    fn pagination_defaults_and_validation() {
        match parse_sql("SELECT * FROM rooms").unwrap() {
            Command::ListRooms { page, name, location } => {
                assert_eq!(page, Pagination::default());
                assert_eq!((name, location), (None, None));
            }
            other => panic!("expected ListRooms, got {other:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM rooms WHERE page_no = 'abc'"),
            Err(SqlError::InvalidValue(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM accounts WHERE page_size = 1000"),
            Err(SqlError::InvalidValue(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM accounts WHERE page_no = 0"),
            Err(SqlError::InvalidValue(_))
        ));
    }

    #[test]
    fn parse_urge_and_grant() {
        let sql = format!("INSERT INTO urges (booking_id) VALUES ('{ID}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::Urge { booking_id: id() });
        let sql = format!("INSERT INTO account_roles (account_id, role) VALUES ('{ID}', 'admin')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::GrantRole { account_id: id(), role: "admin".into() }
        );
    }

    #[test]
    fn parse_me() {
        assert_eq!(parse_sql("SELECT * FROM me").unwrap(), Command::Me);
    }

    #[test]
    fn result_shape_ignores_unbound_parameters() {
        assert_eq!(
            result_shape("SELECT * FROM login WHERE username = $1 AND password = $2"),
            ResultShape::Tokens
        );
        assert_eq!(result_shape("UPDATE bookings SET status = $1 WHERE id = $2"), ResultShape::Booking);
        assert_eq!(result_shape("INSERT INTO urges (booking_id) VALUES ($1)"), ResultShape::Message);
        assert_eq!(result_shape("DELETE FROM rooms WHERE id = $1"), ResultShape::Empty);
        assert_eq!(result_shape("SET access_token = 'x'"), ResultShape::Empty);
        assert_eq!(result_shape("garbage"), ResultShape::Empty);
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC nonsense"), Err(SqlError::Parse(_))));
        assert_eq!(
            parse_sql("SELECT * FROM foobar"),
            Err(SqlError::UnknownTable("foobar".into()))
        );
        assert!(matches!(
            parse_sql("SELECT * FROM rooms WHERE name LIKE 'A%'"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(parse_sql("SELEC nonsense").unwrap_err().is_syntax());
        assert!(!parse_sql("SELECT * FROM foobar").unwrap_err().is_syntax());
    }
}
