use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use roomkeeper::auth::{Principal, Role};
use roomkeeper::engine::{BookingRequest, Engine, EngineError, RoomStore};
use roomkeeper::model::*;
use roomkeeper::notify::NotifyHub;

const HOUR: Ms = 3_600_000; // 1 hour in ms
/// 2026-03-02T00:00:00Z
const DAY0: Ms = 1_772_323_200_000;

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

fn staff() -> Principal {
    Principal::new("bench", Role::Staff)
}

fn request(size: RoomSize, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        size,
        window: Window::closed(start, end),
        rooms: 1,
        contact: Contact {
            name: "bench".into(),
            phone: None,
        },
        note: None,
        convert_now: false,
    }
}

/// A venue of 10 small, 5 medium and 3 large rooms, ranked in size order.
async fn venue(wal: Option<&std::path::Path>) -> Arc<Engine> {
    let store = match wal {
        Some(path) => Arc::new(RoomStore::open(path, Duration::from_secs(2)).expect("open WAL")),
        None => Arc::new(RoomStore::in_memory(Duration::from_secs(2))),
    };
    let engine = Arc::new(Engine::new(store, Arc::new(NotifyHub::new())));
    let by = staff();
    let sizes = std::iter::repeat_n(RoomSize::Small, 10)
        .chain(std::iter::repeat_n(RoomSize::Medium, 5))
        .chain(std::iter::repeat_n(RoomSize::Large, 3));
    let mut rooms = Vec::new();
    for (i, size) in sizes.enumerate() {
        let id = i as u32 + 1;
        engine
            .put_physical_room(PhysicalRoom { id, name: format!("Room {id}") }, &by)
            .await
            .expect("physical room");
        rooms.push(VirtualRoom {
            id,
            name: format!("{size}-{id}"),
            size,
            physical_room: id,
            priority: id,
            active: true,
        });
    }
    engine.put_virtual_rooms(rooms, &by).await.expect("virtual rooms");
    engine
}

async fn phase1_sequential(engine: &Engine) {
    let n = 2000;
    let by = staff();
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        // One-hour slots; every 18th booking lands on a new hour.
        let s = DAY0 + (i as Ms / 18) * HOUR;
        let t = Instant::now();
        let b = engine
            .create_booking(request(RoomSize::Small, s, s + HOUR), &by)
            .await
            .expect("create");
        let _ = engine.convert_booking(b.id, &by).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} create+convert in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create+convert latency", &mut latencies);
}

async fn phase2_contended(engine: Arc<Engine>) {
    // 200 small requests for the same evening against 18 rooms.
    let n_tasks = 200;
    let evening = DAY0 + 400 * HOUR;
    let confirmed = Arc::new(AtomicUsize::new(0));
    let exhausted = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = engine.clone();
        let confirmed = confirmed.clone();
        let exhausted = exhausted.clone();
        handles.push(tokio::spawn(async move {
            let by = staff();
            let s = evening + (i as Ms % 4) * HOUR / 4;
            let b = engine
                .create_booking(request(RoomSize::Small, s, s + 2 * HOUR), &by)
                .await
                .expect("create");
            let t = Instant::now();
            match engine.convert_booking(b.id, &by).await {
                Ok(_) => {
                    confirmed.fetch_add(1, Ordering::Relaxed);
                }
                Err(EngineError::NoRoomAvailable { .. }) => {
                    exhausted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => eprintln!("  unexpected: {e}"),
            }
            t.elapsed()
        }));
    }

    let mut latencies = Vec::with_capacity(n_tasks);
    for h in handles {
        if let Ok(d) = h.await {
            latencies.push(d);
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} concurrent conversions in {:.2}s: {} confirmed, {} no room",
        elapsed.as_secs_f64(),
        confirmed.load(Ordering::Relaxed),
        exhausted.load(Ordering::Relaxed),
    );
    print_latency("convert latency under contention", &mut latencies);
}

async fn phase3_preview_under_load(engine: Arc<Engine>) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4 {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let by = staff();
            let mut i: Ms = 0;
            while !stop.load(Ordering::Relaxed) {
                let s = DAY0 + (1000 + w * 10_000 + i) * HOUR;
                if let Ok(b) = engine.create_booking(request(RoomSize::Medium, s, s + HOUR), &by).await {
                    let _ = engine.convert_booking(b.id, &by).await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let s = DAY0 + ((r * reads_per_reader + i) as Ms % 200) * HOUR;
                let t = Instant::now();
                let _ = engine.preview_allocation(RoomSize::Small, Window::closed(s, s + HOUR)).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        if let Ok(l) = h.await {
            all.extend(l);
        }
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("allocation preview", &mut all);
}

#[tokio::main]
async fn main() {
    let wal = std::env::var("ROOMKEEPER_BENCH_WAL").ok().map(std::path::PathBuf::from);
    if let Some(path) = &wal {
        let _ = std::fs::remove_file(path);
    }

    println!("=== roomkeeper contention benchmark ===");
    println!(
        "store: {}\n",
        wal.as_ref().map_or("in-memory".to_string(), |p| format!("WAL at {}", p.display()))
    );

    println!("[phase 1] sequential create+convert");
    let engine = venue(wal.as_deref()).await;
    phase1_sequential(&engine).await;

    println!("\n[phase 2] many requests, one evening");
    phase2_contended(engine.clone()).await;

    println!("\n[phase 3] allocation preview under write load");
    phase3_preview_under_load(engine).await;

    if let Some(path) = &wal {
        let _ = std::fs::remove_file(path);
    }
}
