use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::app::{App, Outcome};
use crate::error::AppError;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, ResultShape, SqlError};

/// Connection metadata key holding the session's bearer token.
const ACCESS_TOKEN_KEY: &str = "access_token";

pub struct RoomBookHandler {
    app: Arc<App>,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// `format` is the client's requested result format; `None` means text.
    async fn execute<C: ClientInfo + Send + Sync>(
        &self,
        client: &mut C,
        query: &str,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
            sql_err(e)
        })?;
        let label = command_label(&cmd);
        let bearer = client.metadata().get(ACCESS_TOKEN_KEY).cloned();

        let started = Instant::now();
        let result = self.app.handle(cmd, bearer).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        match result {
            Ok(Outcome::Session(Some(token))) => {
                client.metadata_mut().insert(ACCESS_TOKEN_KEY.to_string(), token);
                Ok(Response::Execution(Tag::new("SET")))
            }
            Ok(Outcome::Session(None)) => {
                client.metadata_mut().remove(ACCESS_TOKEN_KEY);
                Ok(Response::Execution(Tag::new("RESET")))
            }
            Ok(outcome) => encode_outcome(outcome, format),
            Err(e) if e.is_soft() => encode_outcome(
                Outcome::Message {
                    status: "suppressed",
                    message: e.to_string(),
                },
                format,
            ),
            Err(e) => {
                tracing::debug!("{label} failed: {e}");
                Err(app_err(e))
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn shape_columns(shape: ResultShape) -> Vec<(&'static str, Type)> {
    match shape {
        ResultShape::Empty => vec![],
        ResultShape::Tokens => vec![
            ("access_token", Type::VARCHAR),
            ("refresh_token", Type::VARCHAR),
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("is_admin", Type::BOOL),
            ("roles", Type::VARCHAR),
            ("permissions", Type::VARCHAR),
        ],
        ResultShape::Identity => vec![
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("is_admin", Type::BOOL),
            ("roles", Type::VARCHAR),
            ("permissions", Type::VARCHAR),
        ],
        ResultShape::Account => vec![
            ("id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("is_admin", Type::BOOL),
            ("is_frozen", Type::BOOL),
            ("roles", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("total", Type::INT8),
        ],
        ResultShape::Room => vec![
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("capacity", Type::INT8),
            ("location", Type::VARCHAR),
            ("equipment", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("is_booked", Type::BOOL),
            ("total", Type::INT8),
        ],
        ResultShape::Spans => vec![
            ("room_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        ResultShape::Booking => vec![
            ("id", Type::VARCHAR),
            ("room_id", Type::VARCHAR),
            ("room_name", Type::VARCHAR),
            ("account_id", Type::VARCHAR),
            ("username", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("status", Type::VARCHAR),
            ("note", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("total", Type::INT8),
        ],
        ResultShape::Message => vec![("status", Type::VARCHAR), ("message", Type::VARCHAR)],
    }
}

/// Row description for `shape`. Extended-protocol clients may ask for
/// binary columns, so each field takes its format from the portal.
fn shape_schema(shape: ResultShape, format: Option<&Format>) -> Vec<FieldInfo> {
    shape_columns(shape)
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(idx));
            FieldInfo::new(name.into(), None, None, ty, field_format)
        })
        .collect()
}

fn permissions_json(permissions: &[PermissionGrant]) -> PgWireResult<String> {
    serde_json::to_string(permissions).map_err(|e| user_error("XX000", format!("cannot encode permissions: {e}")))
}

fn query_response<T>(
    shape: ResultShape,
    format: Option<&Format>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(shape_schema(shape, format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_account(enc: &mut DataRowEncoder, a: &AccountInfo, total: usize) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.username)?;
    enc.encode_field(&a.email)?;
    enc.encode_field(&a.is_admin)?;
    enc.encode_field(&a.is_frozen)?;
    enc.encode_field(&a.roles.join(","))?;
    enc.encode_field(&a.created_at)?;
    enc.encode_field(&(total as i64))
}

fn encode_room(enc: &mut DataRowEncoder, r: &RoomInfo, total: usize) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.name)?;
    enc.encode_field(&i64::from(r.capacity))?;
    enc.encode_field(&r.location)?;
    enc.encode_field(&r.equipment)?;
    enc.encode_field(&r.description)?;
    enc.encode_field(&r.is_booked)?;
    enc.encode_field(&(total as i64))
}

fn encode_booking(enc: &mut DataRowEncoder, b: &BookingInfo, total: usize) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.room_id.to_string())?;
    enc.encode_field(&b.room_name)?;
    enc.encode_field(&b.account_id.to_string())?;
    enc.encode_field(&b.username)?;
    enc.encode_field(&b.start)?;
    enc.encode_field(&b.end)?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.note)?;
    enc.encode_field(&b.created_at)?;
    enc.encode_field(&(total as i64))
}

fn encode_outcome(outcome: Outcome, format: Option<&Format>) -> PgWireResult<Response> {
    let response = match outcome {
        Outcome::Session(_) => Response::Execution(Tag::new("SET")),
        Outcome::Executed { tag, rows } => Response::Execution(Tag::new(tag).with_rows(rows)),
        Outcome::Tokens {
            pair,
            account,
            permissions,
        } => {
            let permissions = permissions_json(&permissions)?;
            query_response(ResultShape::Tokens, format, &[(pair, account)], |enc, (pair, a)| {
                enc.encode_field(&pair.access_token)?;
                enc.encode_field(&pair.refresh_token)?;
                enc.encode_field(&a.id.to_string())?;
                enc.encode_field(&a.username)?;
                enc.encode_field(&a.email)?;
                enc.encode_field(&a.is_admin)?;
                enc.encode_field(&a.roles.join(","))?;
                enc.encode_field(&permissions)
            })
        }
        Outcome::Identity(identity) => {
            let permissions = permissions_json(&identity.permissions)?;
            query_response(ResultShape::Identity, format, &[identity], |enc, who| {
                enc.encode_field(&who.id.to_string())?;
                enc.encode_field(&who.username)?;
                enc.encode_field(&who.email)?;
                enc.encode_field(&who.is_admin)?;
                enc.encode_field(&who.roles.join(","))?;
                enc.encode_field(&permissions)
            })
        }
        Outcome::Account(account) => {
            query_response(ResultShape::Account, format, &[account], |enc, a| encode_account(enc, a, 1))
        }
        Outcome::Accounts(page) => query_response(ResultShape::Account, format, &page.items, |enc, a| {
            encode_account(enc, a, page.total)
        }),
        Outcome::Room(room) => query_response(ResultShape::Room, format, &[room], |enc, r| encode_room(enc, r, 1)),
        Outcome::Rooms(page) => query_response(ResultShape::Room, format, &page.items, |enc, r| {
            encode_room(enc, r, page.total)
        }),
        Outcome::Spans { room_id, spans } => {
            let rid = room_id.to_string();
            query_response(ResultShape::Spans, format, &spans, |enc, span| {
                enc.encode_field(&rid)?;
                enc.encode_field(&span.start)?;
                enc.encode_field(&span.end)
            })
        }
        Outcome::Booking(booking) => {
            query_response(ResultShape::Booking, format, &[booking], |enc, b| encode_booking(enc, b, 1))
        }
        Outcome::Bookings(page) => query_response(ResultShape::Booking, format, &page.items, |enc, b| {
            encode_booking(enc, b, page.total)
        }),
        Outcome::Message { status, message } => query_response(
            ResultShape::Message,
            format,
            &[(status, message)],
            |enc, (status, message)| {
                enc.encode_field(&status.to_string())?;
                enc.encode_field(message)
            },
        ),
    };
    Ok(response)
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute(client, query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(shape_schema(sql::result_shape(stmt), column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = bind_params(&portal.statement.statement, &portal.parameters);
        self.execute(client, &sql, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let schema = shape_schema(sql::result_shape(&target.statement), None);
        Ok(DescribeStatementResponse::new(param_types, schema))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(shape_schema(
            sql::result_shape(&target.statement.statement),
            Some(&target.result_column_format),
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameter values (text format) in place of `$N`, in a
/// single pass over the statement. Inserted values are never rescanned and
/// placeholders inside string literals are left alone.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let digits = &sql[start..end];
        let bound = digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(digits);
            }
        }
    }
    out
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each service error.
pub fn sqlstate(e: &AppError) -> &'static str {
    match e {
        AppError::NotFound(_) => "P0002",
        AppError::Conflict(_) => "23P01",
        AppError::Unauthenticated(_) => "28000",
        AppError::Forbidden(_) => "42501",
        AppError::Invalid(_) => "22023",
        AppError::Upstream(_) => "58000",
        // Never raised: soft errors become result rows.
        AppError::Throttled(_) => "01000",
    }
}

fn app_err(e: AppError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = if e.is_syntax() { "42601" } else { "22023" };
    user_error(code, e.to_string())
}

// ── Factory ──────────────────────────────────────────────────────

/// Transport password shared by every connection. Application identity
/// comes from the session's access token instead.
#[derive(Debug)]
pub struct ConnectionPassword {
    password: String,
}

#[async_trait]
impl AuthSource for ConnectionPassword {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("connection login as {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ConnectionPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(app: Arc<App>, password: String) -> Self {
        let auth_source = ConnectionPassword { password };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RoomBookHandler::new(app)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    app: Arc<App>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = RoomBookFactory::new(app, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}
