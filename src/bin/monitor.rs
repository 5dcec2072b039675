use clap::{Arg, Command};
use dali_master as dali;
use futures_util::StreamExt;

use dali::bus::DaliBus;
use dali::drivers::driver::{DaliBusEventType, OpenError};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = dali::drivers::init() {
        println!("Failed to initialize DALI drivers: {}", e);
    }
    let matches = Command::new("dali_monitor")
        .about("Print traffic from other controllers on a DALI bus")
        .arg(
            Arg::new("DEVICE")
                .short('d')
                .long("device")
                .default_value("default")
                .help("Select DALI-device"),
        )
        .get_matches();

    let device_name = matches.get_one::<String>("DEVICE").unwrap();
    let bus = match DaliBus::open(device_name) {
        Ok(bus) => bus,
        Err(e) => {
            println!("Failed to open DALI device: {}", e);
            if let OpenError::NotFound = e {
                println!("Available drivers:");
                for name in dali::drivers::driver_names() {
                    println!("  {}", name);
                }
            }
            return;
        }
    };

    let started = std::time::Instant::now();
    let (_handle, mut events) = bus.add_message_callback();
    while let Some(event) = events.next().await {
        let at = event.timestamp.duration_since(started);
        match event.event_type {
            DaliBusEventType::Frame8(b) => {
                println!("{:10.3}s  backward {:02x}", at.as_secs_f64(), b)
            }
            DaliBusEventType::Frame16(b) => println!(
                "{:10.3}s  forward {:02x} {:02x}",
                at.as_secs_f64(),
                b[0],
                b[1]
            ),
            DaliBusEventType::Frame24(b) => println!(
                "{:10.3}s  forward {:02x} {:02x} {:02x}",
                at.as_secs_f64(),
                b[0],
                b[1],
                b[2]
            ),
            DaliBusEventType::FramingError => {
                println!("{:10.3}s  framing error", at.as_secs_f64())
            }
        }
    }
}
