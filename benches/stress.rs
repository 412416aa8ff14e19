use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// Monday 2024-01-01 00:00 UTC.
const MONDAY: i64 = 1_704_067_200_000;
/// Window the readers scan: two weeks of hourly slots.
const READ_WINDOW: i64 = 14 * 24 * HOUR;

const ALL_DAY: &str = r#"{"mon": [{"start": "00:00", "end": "24:00"}], "tue": [{"start": "00:00", "end": "24:00"}], "wed": [{"start": "00:00", "end": "24:00"}], "thu": [{"start": "00:00", "end": "24:00"}], "fri": [{"start": "00:00", "end": "24:00"}], "sat": [{"start": "00:00", "end": "24:00"}], "sun": [{"start": "00:00", "end": "24:00"}]}"#;

async fn connect(host: &str, port: u16, password: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("courtbook")
        .user("courtbook")
        .password(password);

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

/// Open around the clock with hourly slots.
async fn create_court(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, category, timezone, slot_minutes, max_concurrent, open_hours) \
             VALUES ('{rid}', 'bench-{rid}', 'bench', 'UTC', 60, {capacity}, '{ALL_DAY}')"
        ))
        .await
        .unwrap();
    rid
}

async fn book(client: &tokio_postgres::Client, rid: Ulid, start: i64) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, resource_id, requester_id, start) VALUES ('{}', '{rid}', 'bench', {start})",
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let rid = create_court(&client, 10).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, rid, MONDAY + (i as i64) * HOUR).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16, password: &str) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let password = password.to_string();
        handles.push(tokio::spawn(async move {
            // Each task books its own court so writes never contend on capacity.
            let client = connect(&host, port, &password).await;
            let rid = create_court(&client, 1).await;
            for j in 0..n_per_task {
                book(&client, rid, MONDAY + (j as i64) * HOUR).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16, password: &str) {
    let setup_client = connect(host, port, password).await;
    let rid = create_court(&setup_client, 5).await;
    for i in 0..200 {
        book(&setup_client, rid, MONDAY + (i as i64) * HOUR).await.unwrap();
    }
    drop(setup_client);

    // Writers keep booking and cancelling on the court the readers scan.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let password = password.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let id = Ulid::new();
                let start = MONDAY + ((w * 37 + i) % (READ_WINDOW / HOUR)) * HOUR;
                let placed = client
                    .batch_execute(&format!(
                        "INSERT INTO reservations (id, resource_id, requester_id, start) VALUES ('{id}', '{rid}', 'writer', {start})"
                    ))
                    .await;
                if placed.is_ok() {
                    let _ = client
                        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{id}'"))
                        .await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        let password = password.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        r#"SELECT * FROM slots WHERE resource_id = '{rid}' AND start >= {MONDAY} AND "end" <= {} AND available = true"#,
                        MONDAY + READ_WINDOW
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
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

    print_latency("available-slot query", &mut all_latencies);
}

/// Many clients race for the same few seats; exactly `capacity` may win.
async fn phase4_booking_storm(host: &str, port: u16, password: &str) {
    let n_conns = 50;
    let capacity = 4;

    let setup_client = connect(host, port, password).await;
    let rid = create_court(&setup_client, capacity).await;
    drop(setup_client);

    let start = Instant::now();
    let placed = Arc::new(AtomicUsize::new(0));
    let full = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_conns {
        let host = host.to_string();
        let password = password.to_string();
        let placed = placed.clone();
        let full = full.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            match book(&client, rid, MONDAY + 9 * HOUR).await {
                Ok(()) => placed.fetch_add(1, Ordering::Relaxed),
                Err(_) => full.fetch_add(1, Ordering::Relaxed),
            };
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let placed = placed.load(Ordering::Relaxed);
    let full = full.load(Ordering::Relaxed);
    println!(
        "  {n_conns} clients for {capacity} seats: {placed} placed, {full} refused in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(placed, capacity as usize, "capacity violated");
}

#[tokio::main]
async fn main() {
    let host = std::env::var("COURTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("COURTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid COURTBOOK_PORT");
    let password = std::env::var("COURTBOOK_PASSWORD").unwrap_or_else(|_| "courtbook".into());

    println!("=== courtbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Every phase creates its own courts so phases never share capacity.

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port, &password).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port, &password).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, &password).await;

    println!("\n[phase 4] booking storm");
    phase4_booking_storm(&host, port, &password).await;

    println!("\n=== benchmark complete ===");
}
