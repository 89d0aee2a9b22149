//! Basic usage: circuit breaker, adaptive bulkhead and retry

use resilience_machines::{
    AdaptiveBulkhead, AdaptiveBulkheadConfig, AdaptiveBulkheadEvent, CallError, CircuitBreaker,
    Retry, RetryConfig, WindowType,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilience_machines=debug".into()),
        )
        .init();

    circuit_breaker()?;
    adaptive_bulkhead()?;
    retry()?;
    Ok(())
}

fn circuit_breaker() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Circuit Breaker ===\n");

    let circuit = CircuitBreaker::builder("payment_api")
        .sliding_window(WindowType::CountBased, 10, 4)
        .failure_rate_threshold(50.0)
        .wait_duration_in_open_state(Duration::from_millis(200))
        .permitted_number_of_calls_in_half_open_state(2)
        .on_open(|name| println!("🔴 Circuit '{name}' opened!"))
        .on_close(|name| println!("🟢 Circuit '{name}' closed!"))
        .on_half_open(|name| println!("🟡 Circuit '{name}' half-open, testing..."))
        .build()?;

    for i in 1..=4 {
        let result = circuit.call(move || {
            if i % 2 == 0 {
                Err::<String, _>("gateway timeout")
            } else {
                Ok(format!("payment {i}"))
            }
        });
        match result {
            Ok(value) => println!("✓ {value}"),
            Err(e) => println!("✗ {e}"),
        }
    }
    println!("State: {}\n", circuit.state());

    if let Err(CallError::CallNotPermitted { state, .. }) =
        circuit.call(|| Ok::<_, &str>("never runs"))
    {
        println!("Rejected while {state}");
    }

    std::thread::sleep(Duration::from_millis(250));
    for _ in 0..2 {
        let _ = circuit.call(|| Ok::<_, &str>("recovered"));
    }
    println!("State: {}\n", circuit.state());
    Ok(())
}

fn adaptive_bulkhead() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Adaptive Bulkhead ===\n");

    let config = AdaptiveBulkheadConfig::builder()
        .min_concurrent_calls(2)
        .max_concurrent_calls(50)
        .initial_concurrent_calls(2)
        .sliding_window(WindowType::CountBased, 10)
        .minimum_number_of_calls(5)
        .build()?;
    let bulkhead = AdaptiveBulkhead::new("search", config)?;
    bulkhead.events().subscribe(|event| {
        if let AdaptiveBulkheadEvent::LimitChanged { change, .. } = event {
            println!("↕ limit {} → {}", change.old, change.new);
        }
    });

    for _ in 0..10 {
        bulkhead.call(|| Ok::<_, io::Error>(()))?;
    }
    println!("After successes: limit {} ({})", bulkhead.limit(), bulkhead.state());

    for _ in 0..10 {
        let _ = bulkhead.call(|| Err::<(), _>("overloaded"));
    }
    println!("After failures: limit {} ({})\n", bulkhead.limit(), bulkhead.state());
    Ok(())
}

fn retry() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Retry ===\n");

    let retry = Retry::new(
        "inventory",
        RetryConfig::builder()
            .max_attempts(3)
            .wait_duration(Duration::from_millis(20))
            .build()?,
    )?;
    retry.events().subscribe(|event| println!("↻ {event:?}"));

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let stock = retry.call(move || {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(io::Error::other("connection reset"))
        } else {
            Ok(42)
        }
    })?;
    println!(
        "Stock level {stock} after {} attempts",
        attempts.load(Ordering::SeqCst)
    );
    println!("Metrics: {:?}", retry.metrics());
    Ok(())
}
