use clap::{Arg, Command};
use dali_master as dali;

use dali::bus::DaliBus;
use dali::drivers::driver::OpenError;
use dali::utils::discover::ScanOptions;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = dali::drivers::init() {
        println!("Failed to initialize DALI drivers: {}", e);
    }
    let matches = Command::new("dali_discover")
        .about("Discover all gear on a DALI bus and assign short addresses")
        .arg(
            Arg::new("DEVICE")
                .short('d')
                .long("device")
                .default_value("default")
                .help("Select DALI-device"),
        )
        .arg(
            Arg::new("full")
                .long("full")
                .action(clap::ArgAction::SetTrue)
                .help("Wipe all short addresses and readdress every device"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(clap::ArgAction::SetTrue)
                .help("Print the confirmed devices as JSON"),
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

    let options = ScanOptions {
        full: *matches.get_one::<bool>("full").unwrap(),
    };
    let report = match bus.scan_for_gear(options).await {
        Ok(report) => report,
        Err(e) => {
            println!("Scan failed: {}", e);
            bus.close().await;
            return;
        }
    };

    if *matches.get_one::<bool>("json").unwrap() {
        match serde_json::to_string_pretty(&report.devices) {
            Ok(json) => println!("{}", json),
            Err(e) => println!("Failed to encode report: {}", e),
        }
    } else {
        for device in &report.devices {
            let short = device
                .short_address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{}  {}", short, device.unique_id);
        }
        for failure in &report.failures {
            println!("{}  identity read failed: {}", failure.short, failure.error);
        }
    }
    bus.close().await;
}
