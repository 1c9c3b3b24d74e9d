//! Basic Example
//!
//! Single operations, a quiet multi-get, a pipeline, a streaming query and a
//! range scan against the in-memory loopback transport.
//!
//! Usage:
//!   cargo run --example basic

use docbridge_sdk::{
    Client, ClientConfig, LoopbackTransport, MultiOptions, ScanParams, StreamRequest, logging,
};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::default();
    let mut log_config = config.logging.clone();
    log_config.format = "compact".to_string();
    logging::init(&log_config)?;

    let transport = Arc::new(LoopbackTransport::new()?);
    let client = Client::new(transport, config)?;

    println!("docbridge - Basic Example\n");

    // 1. Store and read back a document
    println!("1. Upserting 'greeting'");
    client.upsert("greeting", r#"{"text":"Hello, docbridge!"}"#)?;
    let greeting = client.get("greeting")?.into_result()?;
    println!("   Value: {:?}\n", greeting.document().and_then(|d| d.as_str()));

    // 2. Counters
    println!("2. Incrementing 'counter'");
    client.counter("counter", 1, Some(0))?;
    let counter = client.counter("counter", 5, None)?.into_result()?;
    println!("   Counter: {:?}\n", counter.document().and_then(|d| d.as_str()));

    // 3. Multi-get in quiet mode
    println!("3. Multi-get with a missing key");
    let result = client.get_multi(["greeting", "counter", "missing"], MultiOptions::quiet())?;
    for (key, entry) in result.iter() {
        println!("   {} -> found: {}", key, entry.is_value());
    }
    println!();

    // 4. Pipeline
    println!("4. Pipelining three upserts");
    client.pipeline_begin()?;
    for i in 1..=3 {
        client.upsert(format!("user:{}", i), format!(r#"{{"id":{}}}"#, i))?;
    }
    let results = client.pipeline_end()?;
    println!("   Pipeline returned {} results\n", results.len());

    // 5. Streaming query over document ids
    println!("5. Streaming 'user:' documents");
    for row in client.execute_streaming(StreamRequest::query("user:"), None)? {
        println!("   Row: {:?}", row?);
    }
    println!();

    // 6. Range scan
    println!("6. Prefix scan over 'user:'");
    let rows = client
        .scan_create(ScanParams::prefix("user:").ids_only(true))?
        .collect_rows()?;
    println!("   Scanned {} ids\n", rows.len());

    println!("Example completed successfully!");

    Ok(())
}
