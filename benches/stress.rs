//! Stress benchmark against a running server with an empty data dir.
//!
//! `SLOTKEEPER_BENCH_ADMIN` is `login:password` of an admin account,
//! `SLOTKEEPER_BENCH_USERS` a comma-separated list of user accounts in the
//! same form.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
}

#[derive(Clone)]
struct Account {
    login: String,
    password: String,
}

fn parse_account(raw: &str) -> Account {
    let (login, password) = raw.split_once(':').expect("account must be login:password");
    Account {
        login: login.to_string(),
        password: password.to_string(),
    }
}

async fn connect(target: &Target, account: &Account) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("slotkeeper")
        .user(&account.login)
        .password(&account.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_slot(client: &tokio_postgres::Client, index: i64, capacity: u32) -> Ulid {
    let id = Ulid::new();
    let start = BASE + index * HOUR;
    client
        .batch_execute(&format!(
            "INSERT INTO slots (id, title, start_time, end_time, max_participants) \
             VALUES ('{id}', 'bench {index}', {start}, {}, {capacity})",
            start + HOUR
        ))
        .await
        .unwrap();
    id
}

/// Sequential slot creation; every insert runs the owner conflict check.
async fn phase1_sequential(target: &Target, admin: &Account, n: i64) -> Vec<Ulid> {
    let client = connect(target, admin).await;
    let mut latencies = Vec::with_capacity(n as usize);
    let mut slots = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        slots.push(create_slot(&client, i, 1).await);
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} slots in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
    slots
}

/// Every user races for every single-seat slot; exactly one booking per slot
/// may win.
async fn phase2_booking_race(target: &Target, users: &[Account], slots: &[Ulid]) {
    let wins = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for user in users {
        let target = target.clone();
        let user = user.clone();
        let slots = slots.to_vec();
        let wins = wins.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &user).await;
            let mut latencies = Vec::with_capacity(slots.len());
            for slot_id in slots {
                let t = Instant::now();
                let result = client
                    .batch_execute(&format!("INSERT INTO bookings (slot_id) VALUES ('{slot_id}')"))
                    .await;
                latencies.push(t.elapsed());
                if result.is_ok() {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {} users x {} slots in {:.2}s: {won} bookings won (expected {})",
        users.len(),
        slots.len(),
        elapsed.as_secs_f64(),
        slots.len()
    );
    assert_eq!(won, slots.len(), "overbooking or lost booking detected");
    print_latency("reserve latency", &mut latencies);
}

/// Listing latency while writers keep updating a slot.
async fn phase3_read_under_load(target: &Target, admin: &Account, users: &[Account]) {
    let setup = connect(target, admin).await;
    let busy = create_slot(&setup, 1_000_000, 100).await;
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let admin = admin.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target, &admin).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&format!(
                        "UPDATE slots SET title = 'busy {i}' WHERE id = '{busy}'"
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        let user = users[r % users.len()].clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target, &user).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let messages = client
                    .simple_query("SELECT * FROM slots WHERE is_available = true AND take = 50")
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
                let rows = messages
                    .iter()
                    .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
                    .count();
                assert!(rows <= 50);
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("list_slots query", &mut all_latencies);
}

async fn phase4_connection_storm(target: &Target, users: &[Account]) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let target = target.clone();
        let user = users[c % users.len()].clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &user).await;
            for _ in 0..ops_per_conn {
                client.simple_query("SELECT * FROM my_bookings").await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("SLOTKEEPER_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("SLOTKEEPER_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid SLOTKEEPER_PORT"),
    };
    let admin = parse_account(
        &std::env::var("SLOTKEEPER_BENCH_ADMIN").unwrap_or_else(|_| "admin:admin".into()),
    );
    let users: Vec<Account> = std::env::var("SLOTKEEPER_BENCH_USERS")
        .unwrap_or_else(|_| "user1:user1,user2:user2,user3:user3,user4:user4".into())
        .split(',')
        .map(parse_account)
        .collect();

    println!("=== slotkeeper stress benchmark ===");
    println!("target: {}:{} ({} users)\n", target.host, target.port, users.len());

    println!("[phase 1] sequential slot creation");
    let slots = phase1_sequential(&target, &admin, 500).await;

    println!("\n[phase 2] concurrent booking race");
    phase2_booking_race(&target, &users, &slots).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&target, &admin, &users).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target, &users).await;

    println!("\n=== benchmark complete ===");
}
