use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotkeeper::directory::StaticDirectory;
use slotkeeper::engine::Engine;
use slotkeeper::model::RebookPolicy;
use slotkeeper::wire::{self, SlotkeeperFactory};

const ALICE: &str = "01HZY4K6W3V4Q9D2J7X8M5N6PA";
const BOB: &str = "01HZY4K6W3V4Q9D2J7X8M5N6PB";
const DAVE: &str = "01HZY4K6W3V4Q9D2J7X8M5N6PD";

// ── Test infrastructure ──────────────────────────────────────

fn principals() -> String {
    format!(
        r#"[
            {{"id": "{ALICE}", "login": "alice", "password": "s3cret", "role": "admin"}},
            {{"id": "{BOB}", "login": "bob", "password": "hunter2", "role": "user",
              "display_name": "Bob", "email": "bob@example.com"}},
            {{"id": "{DAVE}", "login": "dave", "password": "pw", "role": "user"}},
            {{"id": "01HZY4K6W3V4Q9D2J7X8M5N6PC", "login": "carol", "password": "pw",
              "role": "user", "active": false}}
        ]"#
    )
}

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotkeeper.wal"), RebookPolicy::Never).unwrap());
    let directory = Arc::new(StaticDirectory::from_json(&principals()).unwrap());
    let factory = Arc::new(SlotkeeperFactory::new(engine.clone(), directory));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    (addr, engine)
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotkeeper")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str, password: &str) -> tokio_postgres::Client {
    try_connect(addr, user, password).await.unwrap()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("expected a database error").code().to_string()
}

async fn create_slot(client: &tokio_postgres::Client, max: u32, start: i64) -> Ulid {
    let row = rows(
        client,
        &format!(
            "INSERT INTO slots (title, start_time, end_time, max_participants) \
             VALUES ('Session', {start}, {}, {max}) RETURNING *",
            start + 3_600_000
        ),
    )
    .await;
    Ulid::from_string(row[0].get("id").unwrap()).unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn admin_creates_user_books() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;

    let created = rows(
        &alice,
        "INSERT INTO slots (title, description, start_time, end_time, max_participants) \
         VALUES ('Yoga', 'Bring a mat', '2026-03-01T09:00:00Z', '2026-03-01T10:00:00Z', 3) RETURNING *",
    )
    .await;
    assert_eq!(created.len(), 1);
    let slot = &created[0];
    assert_eq!(slot.get("title"), Some("Yoga"));
    assert_eq!(slot.get("owner_id"), Some(ALICE));
    assert_eq!(slot.get("start_time"), Some("1772355600000"));
    assert_eq!(slot.get("current_participants"), Some("0"));
    assert_eq!(slot.get("is_available"), Some("t"));
    let slot_id = slot.get("id").unwrap().to_string();

    let booked = rows(
        &bob,
        &format!("INSERT INTO bookings (slot_id, notes) VALUES ('{slot_id}', 'front row') RETURNING *"),
    )
    .await;
    let booking = &booked[0];
    assert_eq!(booking.get("status"), Some("active"));
    assert_eq!(booking.get("user_id"), Some(BOB));
    assert_eq!(booking.get("user_login"), Some("bob"));
    assert_eq!(booking.get("user_email"), Some("bob@example.com"));
    assert_eq!(booking.get("slot_title"), Some("Yoga"));
    assert_eq!(booking.get("cancelled_at"), None);

    let after = rows(&bob, &format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(after[0].get("current_participants"), Some("1"));
    assert_eq!(after[0].get("available_spots"), Some("2"));
}

#[tokio::test]
async fn capacity_and_duplicates_enforced() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;
    let dave = connect(addr, "dave", "pw").await;

    let slot_id = create_slot(&alice, 1, 1_000_000_000).await;
    let insert = format!("INSERT INTO bookings (slot_id) VALUES ('{slot_id}')");
    bob.batch_execute(&insert).await.unwrap();

    assert_eq!(error_code(&bob, &insert).await, "SL012");
    assert_eq!(error_code(&dave, &insert).await, "SL011");
}

#[tokio::test]
async fn users_cannot_manage_slots() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;

    let code = error_code(
        &bob,
        "INSERT INTO slots (title, start_time, end_time) VALUES ('Mine', 0, 1000)",
    )
    .await;
    assert_eq!(code, "42501");

    let slot_id = create_slot(&alice, 2, 1_000_000_000).await;
    let code = error_code(&bob, &format!("DELETE FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(code, "42501");
    assert_eq!(error_code(&bob, "SELECT * FROM bookings").await, "42501");
}

#[tokio::test]
async fn overlapping_slots_conflict() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;

    create_slot(&alice, 1, 1_000_000_000).await;
    let code = error_code(
        &alice,
        "INSERT INTO slots (title, start_time, end_time) VALUES ('Clash', 1001800000, 1005400000)",
    )
    .await;
    assert_eq!(code, "SL010");
    let code = error_code(
        &alice,
        "INSERT INTO slots (title, start_time, end_time) VALUES ('Backwards', 2000, 1000)",
    )
    .await;
    assert_eq!(code, "SL001");
}

#[tokio::test]
async fn cancel_and_list_my_bookings() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;
    let dave = connect(addr, "dave", "pw").await;

    let slot_id = create_slot(&alice, 5, 1_000_000_000).await;
    let booking_id = Ulid::new();
    bob.batch_execute(&format!(
        "INSERT INTO bookings (id, slot_id) VALUES ('{booking_id}', '{slot_id}')"
    ))
    .await
    .unwrap();

    let cancel = format!("DELETE FROM bookings WHERE id = '{booking_id}'");
    assert_eq!(error_code(&dave, &cancel).await, "42501");
    bob.batch_execute(&cancel).await.unwrap();
    assert_eq!(error_code(&bob, &cancel).await, "SL013");

    let mine = rows(&bob, "SELECT * FROM my_bookings").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(booking_id.to_string().as_str()));
    assert_eq!(mine[0].get("status"), Some("cancelled"));
    assert!(mine[0].get("cancelled_at").is_some());
    assert!(rows(&dave, "SELECT * FROM my_bookings").await.is_empty());

    let slot = rows(&bob, &format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(slot[0].get("current_participants"), Some("0"));
}

#[tokio::test]
async fn listing_filters_and_pages() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;

    let hour = 3_600_000i64;
    for i in 0..4 {
        create_slot(&alice, 1, 1_000_000_000 + i * hour).await;
    }

    let all = rows(&bob, "SELECT * FROM slots").await;
    let starts: Vec<_> = all.iter().map(|r| r.get("start_time").unwrap().to_string()).collect();
    assert_eq!(starts.len(), 4);
    let mut sorted = starts.clone();
    sorted.sort();
    assert_eq!(starts, sorted);

    let page = rows(&bob, "SELECT * FROM slots WHERE skip = 1 AND take = 2").await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].get("start_time"), Some(starts[1].as_str()));

    let window = rows(
        &bob,
        &format!(
            "SELECT * FROM slots WHERE start_time >= {} AND end_time <= {}",
            1_000_000_000 + hour,
            1_000_000_000 + 3 * hour
        ),
    )
    .await;
    assert_eq!(window.len(), 2);

    assert_eq!(error_code(&bob, "SELECT * FROM slots WHERE take = 0").await, "SL004");
    assert_eq!(error_code(&bob, "SELECT * FROM my_bookings WHERE skip = -1").await, "SL004");
}

#[tokio::test]
async fn purge_user_removes_bookings() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;

    let slot_id = create_slot(&alice, 3, 1_000_000_000).await;
    bob.batch_execute(&format!("INSERT INTO bookings (slot_id) VALUES ('{slot_id}')"))
        .await
        .unwrap();

    alice
        .batch_execute(&format!("DELETE FROM users WHERE id = '{BOB}'"))
        .await
        .unwrap();

    assert!(rows(&bob, "SELECT * FROM my_bookings").await.is_empty());
    let slot = rows(&alice, &format!("SELECT * FROM slots WHERE id = '{slot_id}'")).await;
    assert_eq!(slot[0].get("current_participants"), Some("0"));
}

#[tokio::test]
async fn bad_credentials_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(try_connect(addr, "alice", "wrong").await.is_err());
    assert!(try_connect(addr, "mallory", "pw").await.is_err());
    assert!(try_connect(addr, "carol", "pw").await.is_err());
}

#[tokio::test]
async fn sql_errors_carry_codes() {
    let (addr, _engine) = start_test_server().await;
    let bob = connect(addr, "bob", "hunter2").await;

    assert_eq!(error_code(&bob, "SELECT * FROM nowhere").await, "42P01");
    assert_eq!(error_code(&bob, "SELECT * FROM slots WHERE id = 'nope'").await, "22P02");
    assert_eq!(
        error_code(&bob, &format!("SELECT * FROM slots WHERE id = '{}'", Ulid::new())).await,
        "SL020"
    );
}

#[tokio::test]
async fn extended_protocol_binds_params() {
    let (addr, _engine) = start_test_server().await;
    let alice = connect(addr, "alice", "s3cret").await;
    let bob = connect(addr, "bob", "hunter2").await;

    let slot_id = create_slot(&alice, 2, 1_000_000_000).await.to_string();

    let slots = bob
        .query("SELECT * FROM slots WHERE id = $1", &[&slot_id.as_str()])
        .await
        .unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].get::<_, &str>("title"), "Session");

    let notes = "it's fine";
    let booked = bob
        .query(
            "INSERT INTO bookings (slot_id, notes) VALUES ($1, $2) RETURNING *",
            &[&slot_id.as_str(), &notes],
        )
        .await
        .unwrap();
    assert_eq!(booked[0].get::<_, &str>("notes"), notes);
    assert_eq!(booked[0].get::<_, &str>("status"), "active");
}
