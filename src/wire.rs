use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use ulid::Ulid;

use crate::auth::DirectoryAuthSource;
use crate::directory::{AuthError, PrincipalResolver, Profile};
use crate::engine::{page_from, Engine};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Paging, ResultShape};

pub struct SlotkeeperHandler {
    engine: Arc<Engine>,
    directory: Arc<dyn PrincipalResolver>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<dyn PrincipalResolver>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    /// The principal behind this session, re-read from the directory so a
    /// deactivation takes effect on the next statement.
    async fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        self.directory.resolve(&login).await.map_err(principal_err)
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let principal = self.resolve_principal(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&principal, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, principal: &Principal, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlot {
                id,
                draft,
                returning,
            } => {
                let slot = engine
                    .create_slot(principal, id.unwrap_or_else(Ulid::new), draft)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    slot_rows(vec![slot])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateSlot {
                id,
                patch,
                returning,
            } => {
                let slot = engine
                    .update_slot(principal, id, patch)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    slot_rows(vec![slot])
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteSlot { id } => {
                engine.delete_slot(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots {
                id: Some(id), ..
            } => {
                let slot = engine.get_slot(principal, id).await.map_err(engine_err)?;
                slot_rows(vec![slot])
            }
            Command::SelectSlots {
                id: None,
                filter,
                paging,
            } => {
                let page = page(paging)?;
                let slots = engine
                    .list_slots(principal, filter, page)
                    .await
                    .map_err(engine_err)?;
                slot_rows(slots)
            }
            Command::InsertBooking {
                id,
                slot_id,
                notes,
                returning,
            } => {
                let detail = engine
                    .book_slot_detail(principal, id.unwrap_or_else(Ulid::new), slot_id, notes)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    self.booking_rows(vec![detail]).await
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::CancelBooking { id } => {
                engine
                    .cancel_booking(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id: Some(id), .. } => {
                let detail = engine
                    .get_booking(principal, id)
                    .await
                    .map_err(engine_err)?;
                self.booking_rows(vec![detail]).await
            }
            Command::SelectBookings { id: None, paging } => {
                let page = page(paging)?;
                let details = engine
                    .list_all_bookings(principal, page)
                    .await
                    .map_err(engine_err)?;
                self.booking_rows(details).await
            }
            Command::SelectMyBookings { paging } => {
                let page = page(paging)?;
                let details = engine
                    .list_my_bookings(principal, page)
                    .await
                    .map_err(engine_err)?;
                self.booking_rows(details).await
            }
            Command::PurgeUser { user_id } => {
                let report = engine
                    .purge_user(principal, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(report.slots_removed + report.bookings_removed),
                ))
            }
        }
    }

    /// Booking rows joined with their slot and the booking user's profile.
    async fn booking_rows(&self, details: Vec<BookingDetail>) -> PgWireResult<Response> {
        let schema = Arc::new(booking_schema());
        let mut rows = Vec::with_capacity(details.len());
        for detail in details {
            let profile = self.directory.profile(detail.booking.user_id).await;
            rows.push(encode_booking(&schema, &detail, profile.as_ref()));
        }
        Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
    }
}

fn page(paging: Paging) -> PgWireResult<Page> {
    page_from(paging.skip, paging.take).map_err(engine_err)
}

fn slot_rows(slots: Vec<Slot>) -> PgWireResult<Response> {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.owner_id.to_string())?;
            encoder.encode_field(&slot.title)?;
            encoder.encode_field(&slot.description)?;
            encoder.encode_field(&slot.span.start)?;
            encoder.encode_field(&slot.span.end)?;
            encoder.encode_field(&(slot.max_participants as i32))?;
            encoder.encode_field(&(slot.current_participants as i32))?;
            encoder.encode_field(&(slot.available_spots() as i32))?;
            encoder.encode_field(&slot.is_available)?;
            encoder.encode_field(&slot.created_at)?;
            encoder.encode_field(&slot.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    detail: &BookingDetail,
    profile: Option<&Profile>,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let BookingDetail { booking, slot } = detail;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.slot_id.to_string())?;
    encoder.encode_field(&booking.user_id.to_string())?;
    encoder.encode_field(&booking.status.as_str())?;
    encoder.encode_field(&booking.notes)?;
    encoder.encode_field(&booking.booked_at)?;
    encoder.encode_field(&booking.cancelled_at)?;
    encoder.encode_field(&slot.title)?;
    encoder.encode_field(&slot.span.start)?;
    encoder.encode_field(&slot.span.end)?;
    encoder.encode_field(&profile.map(|p| p.login.clone()))?;
    encoder.encode_field(&profile.and_then(|p| p.display_name.clone()))?;
    encoder.encode_field(&profile.and_then(|p| p.email.clone()))?;
    Ok(encoder.take_row())
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("start_time", Type::INT8),
        field("end_time", Type::INT8),
        field("max_participants", Type::INT4),
        field("current_participants", Type::INT4),
        field("available_spots", Type::INT4),
        field("is_available", Type::BOOL),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("booked_at", Type::INT8),
        field("cancelled_at", Type::INT8),
        field("slot_title", Type::VARCHAR),
        field("slot_start_time", Type::INT8),
        field("slot_end_time", Type::INT8),
        field("user_login", Type::VARCHAR),
        field("user_display_name", Type::VARCHAR),
        field("user_email", Type::VARCHAR),
    ]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Slots => slot_schema(),
        ResultShape::Bookings => booking_schema(),
        ResultShape::None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::describe_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        let fields = schema_for(sql::describe_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = schema_for(sql::describe_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never matches the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => quote_literal(&String::from_utf8_lossy(bytes)),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<DirectoryAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<dyn PrincipalResolver>) -> Self {
        let auth_source = DirectoryAuthSource::new(directory.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotkeeperFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    user_error(e.code(), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error(e.code(), e.to_string())
}

fn principal_err(e: AuthError) -> PgWireError {
    user_error(e.code(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO slots (title, start_time, end_time) VALUES ($2, $1, $12)"),
            12
        );
        assert_eq!(count_params("SELECT '$' FROM slots"), 0);
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn schemas_match_shapes() {
        assert_eq!(schema_for(ResultShape::Slots).len(), 12);
        assert_eq!(schema_for(ResultShape::Bookings).len(), 13);
        assert!(schema_for(ResultShape::None).is_empty());
    }
}
