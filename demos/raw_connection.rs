//! Low-level connection example.
//!
//! Uses `StreamConnection` directly instead of the session wrapper: the
//! caller sees the raw event order and handles termination itself. Reads a
//! fixed number of samples, then cancels the stream.

use std::error::Error;

use omnia_sdk::stream::client::{ConnectionConfig, OcpClient, StreamEvent};

const SAMPLE_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => ConnectionConfig::default().port,
    };

    let client = OcpClient::new(ConnectionConfig::new(host, port));
    let mut connection = client.connect().await?;

    let mut samples = 0usize;
    while let Some(event) = connection.recv().await {
        match event {
            StreamEvent::HandshakeAck(bytes) => {
                println!("device ack ({} bytes)", bytes.len());
            }
            StreamEvent::Telemetry(record) => {
                println!("sample {samples}: {record:?}");
                samples += 1;
                if samples == SAMPLE_LIMIT {
                    connection.close();
                }
            }
            StreamEvent::Warning(warning) => {
                eprintln!("skipped frame: {warning}");
            }
            StreamEvent::Terminated(reason) => {
                println!("stream ended: {reason}");
            }
        }
    }

    Ok(())
}
