use clap::{Arg, Command};
use dali_master as dali;

use dali::bus::DaliBus;
use dali::common::address::Address;
use dali::drivers::driver::OpenError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = dali::drivers::init() {
        println!("Failed to initialize DALI drivers: {}", e);
    }
    let matches = Command::new("dali_set_level")
        .about("Send a direct arc power level to an address, group or broadcast")
        .arg(
            Arg::new("DEVICE")
                .short('d')
                .long("device")
                .default_value("default")
                .help("Select DALI-device"),
        )
        .arg(
            Arg::new("ADDR")
                .required(true)
                .help("Target: 0-63, A5, G3, all or unaddressed"),
        )
        .arg(
            Arg::new("LEVEL")
                .required(true)
                .help("Arc power level, 0-254"),
        )
        .get_matches();

    let addr = match matches.get_one::<String>("ADDR").unwrap().parse::<Address>() {
        Ok(addr) => addr,
        Err(e) => {
            println!("Invalid address: {}", e);
            return;
        }
    };
    let level = match matches.get_one::<String>("LEVEL").unwrap().parse::<u8>() {
        Ok(level) => level,
        Err(e) => {
            println!("Invalid level: {}", e);
            return;
        }
    };

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

    if let Err(e) = bus.send_level(addr, level).await {
        println!("Send failed: {}", e);
    }
    bus.close().await;
}
