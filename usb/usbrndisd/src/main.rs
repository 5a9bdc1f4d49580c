use std::env;
use std::thread;
use std::time::Duration;

use driver_usb_host::{HostPort, SchemePort, TransferError};

mod host;
mod logger;
mod rndis;
mod scanner;
mod usb;

use host::{InterfaceConfig, PipeConfig, RndisError, RndisHost};

/// Largest Ethernet frame accepted on the data pipes.
const MTU: usize = 1514;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn is_detached(err: &RndisError) -> bool {
    matches!(err, RndisError::Transfer(TransferError::Detached))
}

fn main() {
    let mut args = env::args().skip(1);

    const USAGE: &'static str = "usbrndisd <scheme> <port>";

    let scheme = args.next().expect(USAGE);
    let port = args.next().expect(USAGE).parse::<usize>().expect("port has to be a number");

    logger::init(log::LevelFilter::Info);

    log::info!(
        "USB RNDIS driver spawned with scheme `{}`, port {}",
        scheme,
        port
    );

    let mut port = SchemePort::new(scheme, port);
    let config_descriptor = port
        .config_descriptor()
        .expect("failed to read configuration descriptor");

    let mut host = RndisHost::new(
        port,
        InterfaceConfig {
            data_in: PipeConfig {
                number: 1,
                double_banked: true,
            },
            data_out: PipeConfig {
                number: 2,
                double_banked: true,
            },
            notification: PipeConfig {
                number: 3,
                double_banked: false,
            },
            host_max_packet_size: MTU as u32,
        },
    );

    host.configure(&config_descriptor)
        .expect("failed to configure RNDIS interface");
    host.initialize().expect("failed to initialize RNDIS session");

    let mut mac = [0u8; 6];
    match host.query_property(rndis::OID_802_3_CURRENT_ADDRESS, &mut mac) {
        Ok(6) => log::info!(
            "usbrndisd: MAC address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0],
            mac[1],
            mac[2],
            mac[3],
            mac[4],
            mac[5]
        ),
        Ok(len) => log::warn!("usbrndisd: device returned a {} byte MAC address", len),
        Err(err) => log::warn!("usbrndisd: failed to query MAC address: {}", err),
    }

    let filter = rndis::NDIS_PACKET_TYPE_DIRECTED
        | rndis::NDIS_PACKET_TYPE_MULTICAST
        | rndis::NDIS_PACKET_TYPE_BROADCAST;
    host.set_property(rndis::OID_GEN_CURRENT_PACKET_FILTER, &filter.to_le_bytes())
        .expect("failed to set packet filter");

    let mut frame = [0u8; MTU];
    'driver: loop {
        if let Err(err) = host.task() {
            if is_detached(&err) {
                break 'driver;
            }
            log::warn!("usbrndisd: management task failed: {}", err);
        }

        while host.is_packet_received() {
            match host.read_packet(&mut frame) {
                Ok(Some(len)) => log::debug!("usbrndisd: received {} byte frame", len),
                Ok(None) => break,
                Err(err) if is_detached(&err) => break 'driver,
                Err(err) => {
                    log::warn!("usbrndisd: failed to read packet: {}", err);
                    break;
                }
            }
        }

        thread::sleep(POLL_INTERVAL);
    }

    host.reset();
    log::info!("usbrndisd: device detached, shutting down");
}
