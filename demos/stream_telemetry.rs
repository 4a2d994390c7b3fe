//! Realtime telemetry stream example.
//!
//! Connects to an OMNIA device, enables the real-time push, and prints each
//! decoded sample until the device closes the connection.
//!
//! Usage: `stream_telemetry [host] [port]` (defaults to `127.0.0.1:1234`,
//! the endpoint the OMNIA demo configuration uses).

use std::error::Error;

use omnia_sdk::stream::client::{ConnectionConfig, OcpClient, StreamEvent};
use omnia_sdk::stream::session::StreamSession;

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => ConnectionConfig::default().port,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = OcpClient::new(ConnectionConfig::new(host, port));
        let mut session = StreamSession::connect(&client).await?;

        while let Some(event) = session.recv().await {
            match event {
                StreamEvent::HandshakeAck(bytes) => {
                    println!("device ack: {}", String::from_utf8_lossy(&bytes));
                }
                StreamEvent::Telemetry(record) => {
                    println!(
                        "{} phase={} vo2={} vco2={} ve={} hr={}",
                        record.timestamp,
                        record.phase,
                        record.vo2,
                        record.vco2,
                        record.ve,
                        record.hr
                    );
                }
                StreamEvent::Warning(warning) => {
                    eprintln!("skipped frame: {warning}");
                }
                StreamEvent::Terminated(reason) => {
                    println!("stream ended: {reason}");
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
