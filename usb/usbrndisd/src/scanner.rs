//! Configuration-descriptor walk that locates the RNDIS control and data
//! interfaces and classifies their endpoints.

use std::mem;

use bitflags::bitflags;
use thiserror::Error;

use crate::usb::{
    ConfigDescriptor, EndpointDescriptor, InterfaceDescriptor, DESC_TY_CONFIGURATION,
    DESC_TY_ENDPOINT, DESC_TY_INTERFACE,
};

// The RNDIS control interface advertises itself as a vendor-specific CDC
// communications interface; the data interface is plain CDC data.
pub const RNDIS_CONTROL_CLASS: u8 = 0x02;
pub const RNDIS_CONTROL_SUBCLASS: u8 = 0x02;
pub const RNDIS_CONTROL_PROTOCOL: u8 = 0xFF;
pub const RNDIS_DATA_CLASS: u8 = 0x0A;
pub const RNDIS_DATA_SUBCLASS: u8 = 0x00;
pub const RNDIS_DATA_PROTOCOL: u8 = 0x00;

bitflags! {
    /// Which of the three required endpoints the scan has located.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FoundEndpoints: u8 {
        const DATA_IN = 1 << 0;
        const DATA_OUT = 1 << 1;
        const NOTIFICATION_IN = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EnumerationError {
    #[error("invalid configuration descriptor")]
    InvalidConfigDescriptor,

    #[error("no compatible RNDIS interface found")]
    NoRndisInterfaceFound,

    #[error("compatible RNDIS endpoints not found")]
    EndpointsNotFound,
}

/// Successful scan result: the control interface number and the three
/// classified endpoints. `found` always has all three bits set on success;
/// it is kept so callers can log what was discovered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RndisInterface {
    pub control_interface: u8,
    pub notification: EndpointDescriptor,
    pub data_in: EndpointDescriptor,
    pub data_out: EndpointDescriptor,
    pub found: FoundEndpoints,
}

/// Forward-only walk over the descriptor entries of a configuration
/// descriptor buffer. Every entry starts with (bLength, bDescriptorType).
struct DescriptorCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorCursor<'a> {
    fn new(buf: &'a [u8]) -> Result<Self, EnumerationError> {
        let config: &ConfigDescriptor = plain::from_bytes(buf)
            .map_err(|_| EnumerationError::InvalidConfigDescriptor)?;
        if config.kind != DESC_TY_CONFIGURATION
            || usize::from(config.length) < mem::size_of::<ConfigDescriptor>()
        {
            return Err(EnumerationError::InvalidConfigDescriptor);
        }
        let total_length = usize::from(config.total_length);
        // A buffer shorter than the claimed total length was truncated in
        // transit; required fields may be missing.
        if total_length > buf.len() || total_length < usize::from(config.length) {
            return Err(EnumerationError::InvalidConfigDescriptor);
        }
        Ok(Self {
            buf: &buf[..total_length],
            offset: usize::from(config.length),
        })
    }

    /// Advances to the next descriptor entry satisfying `pred`, without
    /// consuming it. Entries are validated as they are passed over.
    fn find_next(
        &mut self,
        pred: impl Fn(u8, &[u8]) -> bool,
    ) -> Result<Option<&'a [u8]>, EnumerationError> {
        while let Some(entry) = self.peek()? {
            if pred(entry[1], entry) {
                return Ok(Some(entry));
            }
            self.advance()?;
        }
        Ok(None)
    }

    fn peek(&self) -> Result<Option<&'a [u8]>, EnumerationError> {
        if self.offset == self.buf.len() {
            return Ok(None);
        }
        if self.offset + 2 > self.buf.len() {
            return Err(EnumerationError::InvalidConfigDescriptor);
        }
        let length = usize::from(self.buf[self.offset]);
        if length < 2 || self.offset + length > self.buf.len() {
            return Err(EnumerationError::InvalidConfigDescriptor);
        }
        Ok(Some(&self.buf[self.offset..self.offset + length]))
    }

    fn advance(&mut self) -> Result<(), EnumerationError> {
        if let Some(entry) = self.peek()? {
            self.offset += entry.len();
        }
        Ok(())
    }
}

fn parse_interface(entry: &[u8]) -> Result<InterfaceDescriptor, EnumerationError> {
    plain::from_bytes::<InterfaceDescriptor>(entry)
        .map(|desc| *desc)
        .map_err(|_| EnumerationError::InvalidConfigDescriptor)
}

fn parse_endpoint(entry: &[u8]) -> Result<EndpointDescriptor, EnumerationError> {
    plain::from_bytes::<EndpointDescriptor>(entry)
        .map(|desc| *desc)
        .map_err(|_| EnumerationError::InvalidConfigDescriptor)
}

fn is_control_interface(kind: u8, entry: &[u8]) -> bool {
    kind == DESC_TY_INTERFACE
        && entry.len() >= mem::size_of::<InterfaceDescriptor>()
        && entry[5] == RNDIS_CONTROL_CLASS
        && entry[6] == RNDIS_CONTROL_SUBCLASS
        && entry[7] == RNDIS_CONTROL_PROTOCOL
}

fn is_data_interface(kind: u8, entry: &[u8]) -> bool {
    kind == DESC_TY_INTERFACE
        && entry.len() >= mem::size_of::<InterfaceDescriptor>()
        && entry[5] == RNDIS_DATA_CLASS
        && entry[6] == RNDIS_DATA_SUBCLASS
        && entry[7] == RNDIS_DATA_PROTOCOL
}

/// Walks `config_descriptor` looking for the RNDIS control interface, its
/// interrupt notification endpoint, and the bulk IN/OUT endpoints of the
/// paired data interface.
pub fn scan(config_descriptor: &[u8]) -> Result<RndisInterface, EnumerationError> {
    let mut cursor = DescriptorCursor::new(config_descriptor)?;

    let control_entry = cursor
        .find_next(is_control_interface)?
        .ok_or(EnumerationError::NoRndisInterfaceFound)?;
    let control = parse_interface(control_entry)?;
    cursor.advance()?;

    let mut found = FoundEndpoints::empty();
    let mut notification = None;
    let mut data_in = None;
    let mut data_out = None;

    // Notification endpoint lives in the control interface's extent; stop at
    // the next interface descriptor.
    while let Some(entry) = cursor.find_next(|kind, _| {
        kind == DESC_TY_ENDPOINT || kind == DESC_TY_INTERFACE
    })? {
        if entry[1] == DESC_TY_INTERFACE {
            break;
        }
        let endpoint = parse_endpoint(entry)?;
        if endpoint.is_interrupt() && endpoint.is_in() {
            found |= FoundEndpoints::NOTIFICATION_IN;
            notification = Some(endpoint);
        }
        cursor.advance()?;
    }

    // The data interface follows the control interface; the device's bulk
    // pipes hang off it.
    if cursor.find_next(is_data_interface)?.is_none() {
        return Err(EnumerationError::EndpointsNotFound);
    }
    cursor.advance()?;

    while let Some(entry) = cursor.find_next(|kind, _| {
        kind == DESC_TY_ENDPOINT || kind == DESC_TY_INTERFACE
    })? {
        if entry[1] == DESC_TY_INTERFACE {
            break;
        }
        let endpoint = parse_endpoint(entry)?;
        if endpoint.is_bulk() {
            if endpoint.is_in() {
                found |= FoundEndpoints::DATA_IN;
                data_in = Some(endpoint);
            } else {
                found |= FoundEndpoints::DATA_OUT;
                data_out = Some(endpoint);
            }
        }
        cursor.advance()?;
    }

    if !found.is_all() {
        return Err(EnumerationError::EndpointsNotFound);
    }

    Ok(RndisInterface {
        control_interface: control.number,
        notification: notification.ok_or(EnumerationError::EndpointsNotFound)?,
        data_in: data_in.ok_or(EnumerationError::EndpointsNotFound)?,
        data_out: data_out.ok_or(EnumerationError::EndpointsNotFound)?,
        found,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn config_header(total_length: u16, interfaces: u8) -> Vec<u8> {
        vec![
            9,
            DESC_TY_CONFIGURATION,
            total_length as u8,
            (total_length >> 8) as u8,
            interfaces,
            1,
            0,
            0x80,
            50,
        ]
    }

    fn interface(number: u8, class: u8, sub_class: u8, protocol: u8) -> Vec<u8> {
        vec![9, DESC_TY_INTERFACE, number, 0, 0, class, sub_class, protocol, 0]
    }

    fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Vec<u8> {
        vec![
            7,
            DESC_TY_ENDPOINT,
            address,
            attributes,
            max_packet_size as u8,
            (max_packet_size >> 8) as u8,
            interval,
        ]
    }

    fn rndis_config(with_notification: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(interface(0, RNDIS_CONTROL_CLASS, RNDIS_CONTROL_SUBCLASS, RNDIS_CONTROL_PROTOCOL));
        if with_notification {
            body.extend(endpoint(0x83, 3, 8, 8));
        }
        body.extend(interface(1, RNDIS_DATA_CLASS, RNDIS_DATA_SUBCLASS, RNDIS_DATA_PROTOCOL));
        body.extend(endpoint(0x81, 2, 512, 0));
        body.extend(endpoint(0x02, 2, 512, 0));

        let mut buf = config_header((9 + body.len()) as u16, 2);
        buf.extend(body);
        buf
    }

    #[test]
    fn scan_well_formed() {
        let desc = rndis_config(true);
        let iface = scan(&desc).unwrap();
        assert!(iface.found.is_all());
        assert_eq!(iface.control_interface, 0);
        assert_eq!(iface.notification.address, 0x83);
        assert_eq!(iface.data_in.address, 0x81);
        assert_eq!(iface.data_out.address, 0x02);
        assert_eq!({ iface.data_in.max_packet_size }, 512);
    }

    #[test]
    fn scan_skips_preceding_interfaces() {
        let mut body = Vec::new();
        body.extend(interface(0, 0xFF, 0x42, 0x01));
        body.extend(endpoint(0x84, 2, 64, 0));
        body.extend(interface(1, RNDIS_CONTROL_CLASS, RNDIS_CONTROL_SUBCLASS, RNDIS_CONTROL_PROTOCOL));
        body.extend(endpoint(0x83, 3, 8, 8));
        body.extend(interface(2, RNDIS_DATA_CLASS, RNDIS_DATA_SUBCLASS, RNDIS_DATA_PROTOCOL));
        body.extend(endpoint(0x81, 2, 512, 0));
        body.extend(endpoint(0x02, 2, 512, 0));
        let mut desc = config_header((9 + body.len()) as u16, 3);
        desc.extend(body);

        let iface = scan(&desc).unwrap();
        assert_eq!(iface.control_interface, 1);
        assert!(iface.found.is_all());
    }

    #[test]
    fn scan_is_deterministic() {
        let desc = rndis_config(true);
        assert_eq!(scan(&desc), scan(&desc));
    }

    #[test]
    fn scan_missing_notification_endpoint() {
        let desc = rndis_config(false);
        assert_eq!(scan(&desc), Err(EnumerationError::EndpointsNotFound));
    }

    #[test]
    fn scan_missing_data_interface() {
        let mut desc = config_header(9 + 9 + 7, 1);
        desc.extend(interface(0, RNDIS_CONTROL_CLASS, RNDIS_CONTROL_SUBCLASS, RNDIS_CONTROL_PROTOCOL));
        desc.extend(endpoint(0x83, 3, 8, 8));
        assert_eq!(scan(&desc), Err(EnumerationError::EndpointsNotFound));
    }

    #[test]
    fn scan_no_matching_interface() {
        let mut desc = config_header(9 + 9 + 7, 1);
        desc.extend(interface(0, 0x03, 0x01, 0x02));
        desc.extend(endpoint(0x81, 3, 8, 8));
        assert_eq!(scan(&desc), Err(EnumerationError::NoRndisInterfaceFound));
    }

    #[test]
    fn scan_truncated_buffer() {
        let desc = rndis_config(true);
        // wTotalLength claims more bytes than the buffer holds.
        assert_eq!(
            scan(&desc[..desc.len() - 5]),
            Err(EnumerationError::InvalidConfigDescriptor)
        );
    }

    #[test]
    fn scan_zero_length_entry() {
        let mut desc = rndis_config(true);
        // Corrupt the control interface descriptor's bLength.
        desc[9] = 0;
        assert_eq!(scan(&desc), Err(EnumerationError::InvalidConfigDescriptor));
    }

    #[test]
    fn scan_entry_overruns_total_length() {
        let mut desc = rndis_config(true);
        let last_endpoint = desc.len() - 7;
        desc[last_endpoint] = 60;
        assert_eq!(scan(&desc), Err(EnumerationError::InvalidConfigDescriptor));
    }

    #[test]
    fn scan_rejects_non_config_buffer() {
        let desc = interface(0, RNDIS_CONTROL_CLASS, RNDIS_CONTROL_SUBCLASS, RNDIS_CONTROL_PROTOCOL);
        assert_eq!(scan(&desc), Err(EnumerationError::InvalidConfigDescriptor));
    }
}
