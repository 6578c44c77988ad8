//! Command-line client: issues one query against a leader and streams the
//! merged result back, printing per-chunk progress and a final summary.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fq_distributed::grpc::{v1, FireQueryClient};
use tracing_subscriber::EnvFilter;

struct QueryArgs {
    leader: String,
    date_start: String,
    date_end: String,
    pollutant: String,
    max_records: i32,
    chunk_size: i32,
}

fn print_usage(program: &str) {
    println!("Usage: {program} <leader_host:port> [options]");
    println!();
    println!("Options:");
    println!("  --start <date>       Start date (YYYYMMDD), default: 20200810");
    println!("  --end <date>         End date (YYYYMMDD), default: 20200815");
    println!("  --pollutant <type>   Pollutant type (PM2.5, PM10, OZONE), default: all");
    println!("  --max <n>            Maximum records, default: unlimited");
    println!("  --chunk <n>          Chunk size, default: 500");
    println!();
    println!("Examples:");
    println!("  {program} localhost:50051");
    println!("  {program} localhost:50051 --pollutant PM2.5 --max 5000");
    println!("  {program} localhost:50051 --start 20200901 --end 20200910");
}

fn parse_args() -> Result<QueryArgs, i32> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("fq-client");
    if args.len() < 2 {
        print_usage(program);
        return Err(1);
    }
    if args[1] == "--help" || args[1] == "-h" {
        print_usage(program);
        return Err(0);
    }

    let mut parsed = QueryArgs {
        leader: args[1].clone(),
        date_start: "20200810".to_string(),
        date_end: "20200815".to_string(),
        pollutant: String::new(),
        max_records: -1,
        chunk_size: 500,
    };

    let mut i = 2;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => {
                print_usage(program);
                return Err(0);
            }
            "--start" | "--end" | "--pollutant" | "--max" | "--chunk" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Missing value for {flag}");
                    return Err(1);
                };
                match flag {
                    "--start" => parsed.date_start = value.clone(),
                    "--end" => parsed.date_end = value.clone(),
                    "--pollutant" => parsed.pollutant = value.clone(),
                    "--max" => {
                        parsed.max_records = value.parse().map_err(|_| {
                            eprintln!("Invalid --max value: {value}");
                            1
                        })?;
                    }
                    "--chunk" => {
                        parsed.chunk_size = value.parse().map_err(|_| {
                            eprintln!("Invalid --chunk value: {value}");
                            1
                        })?;
                    }
                    _ => unreachable!(),
                }
                i += 2;
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage(program);
                return Err(1);
            }
        }
    }

    Ok(parsed)
}

fn print_request_banner(request: &v1::QueryRequest) {
    println!();
    println!("========================================");
    println!("FIRE QUERY REQUEST");
    println!("========================================");
    println!("Request ID:    {}", request.request_id);
    println!("Date Range:    {} to {}", request.date_start, request.date_end);
    println!(
        "Pollutant:     {}",
        if request.pollutant_type.is_empty() {
            "ALL"
        } else {
            &request.pollutant_type
        }
    );
    println!(
        "Max Records:   {}",
        if request.max_records < 0 {
            "UNLIMITED".to_string()
        } else {
            request.max_records.to_string()
        }
    );
    println!("Chunk Size:    {}", request.chunk_size);
    println!("========================================");
    println!();
}

async fn run_query(args: QueryArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to leader at {}...", args.leader);
    let mut client = FireQueryClient::connect(format!("http://{}", args.leader)).await?;

    let epoch_secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let request = v1::QueryRequest {
        request_id: format!("req_{epoch_secs}"),
        date_start: args.date_start,
        date_end: args.date_end,
        pollutant_type: args.pollutant,
        latitude_min: -90.0,
        latitude_max: 90.0,
        longitude_min: -180.0,
        longitude_max: 180.0,
        max_records: args.max_records,
        chunk_size: args.chunk_size,
    };
    print_request_banner(&request);

    let started = Instant::now();
    let mut stream = client.query(request).await?.into_inner();

    let mut chunks_received = 0u64;
    let mut total_records = 0u64;
    let mut records_by_process: BTreeMap<String, u64> = BTreeMap::new();

    loop {
        let chunk = match stream.message().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(status) => {
                println!();
                println!("========================================");
                println!("QUERY FAILED");
                println!("========================================");
                println!("Error Code:    {:?}", status.code());
                println!("Error Message: {}", status.message());
                println!("========================================");
                return Err(status.into());
            }
        };

        chunks_received += 1;
        let chunk_records = chunk.records.len() as u64;
        total_records += chunk_records;
        *records_by_process.entry(chunk.source_process.clone()).or_default() += chunk_records;

        print!(
            "Chunk {:>3} | Source: {} | Records: {:>4} | Total so far: {:>6}",
            chunk.chunk_number, chunk.source_process, chunk_records, total_records
        );
        if chunk.is_final {
            print!(" | FINAL");
        }
        println!();

        if chunks_received == 1 && chunk_records > 0 {
            println!();
            println!("--- Sample Records from Chunk 0 ---");
            for (i, record) in chunk.records.iter().take(3).enumerate() {
                println!(
                    "  [{i}] {} {} {} at ({}, {}) {} - {}",
                    record.pollutant,
                    record.concentration,
                    record.unit,
                    record.latitude,
                    record.longitude,
                    record.timestamp,
                    record.site_name
                );
            }
            println!("-----------------------------------");
            println!();
        }

        if chunk.is_final {
            println!();
            println!("Received final chunk indicator.");
            break;
        }
    }

    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis().max(1);

    println!();
    println!("========================================");
    println!("QUERY COMPLETE");
    println!("========================================");
    println!("Total Chunks:  {chunks_received}");
    println!("Total Records: {total_records}");
    println!("Duration:      {elapsed_ms} ms");
    println!(
        "Throughput:    {} records/sec",
        total_records as u128 * 1000 / elapsed_ms
    );
    println!();
    println!("Records by Process:");
    for (process, count) in &records_by_process {
        println!("  {process}: {count} records");
    }
    println!("========================================");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(code) => std::process::exit(code),
    };

    if let Err(e) = run_query(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
