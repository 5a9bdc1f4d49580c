//! Host-side USB pipe abstraction consumed by USB class drivers.
//!
//! A class driver talks to an attached device through a port handle: control
//! transfers go through [`ControlPort::device_request`], and bulk/interrupt
//! endpoints are bound to stream pipes with [`HostPort::open_pipe`]. The
//! concrete [`SchemePort`] backend speaks to the host controller daemon
//! through its scheme files; drivers stay generic over the traits so they can
//! be exercised against a simulated device.

pub extern crate serde;

use std::convert::TryFrom;
use std::fs::File;
use std::io;
use std::io::prelude::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bit 7 of `bEndpointAddress` set means device-to-host.
pub const ENDP_ADDR_DIRECTION_BIT: u8 = 0x80;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum PortReqTy {
    Class,
    Vendor,
    Standard,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum PortReqRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PortReqDirection {
    HostToDevice,
    DeviceToHost,
}

/// The standard-request envelope of a control transfer, as handed to the host
/// controller daemon.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PortReq {
    pub direction: PortReqDirection,
    pub req_type: PortReqTy,
    pub req_recipient: PortReqRecipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub transfers_data: bool,
}

pub enum DeviceReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}

impl DeviceReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn direction(&self) -> PortReqDirection {
        match self {
            DeviceReqData::In(_) => PortReqDirection::DeviceToHost,
            DeviceReqData::Out(_) => PortReqDirection::HostToDevice,
            DeviceReqData::NoData => PortReqDirection::HostToDevice,
        }
    }
}

/// Errors reported by the underlying transfer primitives. Class drivers are
/// expected to pass these through to their callers unchanged; retry policy
/// lives above the driver.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transfer buffer too large ({0} > 65536)")]
    BufTooLarge(usize),

    #[error("endpoint stalled")]
    Stalled,

    #[error("transfer timed out")]
    TimedOut,

    #[error("pipe busy")]
    Busy,

    #[error("device detached")]
    Detached,

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointStatus {
    Disabled,
    Enabled,
    Halted,
    Stopped,
    Error,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TransferStatusKind {
    Success,
    ShortPacket,
    Stalled,
    TimedOut,
    Unknown,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TransferStatus {
    pub kind: TransferStatusKind,
    pub bytes_transferred: u32,
}

impl TransferStatus {
    /// Folds a completed transfer into the byte count actually moved, mapping
    /// failed completions onto [`TransferError`].
    pub fn into_result(self) -> Result<usize, TransferError> {
        match self.kind {
            TransferStatusKind::Success | TransferStatusKind::ShortPacket => {
                Ok(self.bytes_transferred as usize)
            }
            TransferStatusKind::Stalled => Err(TransferError::Stalled),
            TransferStatusKind::TimedOut => Err(TransferError::TimedOut),
            TransferStatusKind::Unknown => {
                Err(TransferError::InvalidResponse("unknown transfer status"))
            }
        }
    }
}

/// A request to an endpoint Ctl interface file. Currently serialized with JSON.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum PipeCtlReq {
    /// Announces that `count` bytes are about to be moved through the Data
    /// interface file, in the given direction.
    Transfer {
        direction: PortReqDirection,
        count: u32,
    },
    /// Asks for the endpoint state without starting a transfer.
    Status,
}

/// A response from an endpoint Ctl interface file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum PipeCtlRes {
    Status {
        state: EndpointStatus,
        /// Whether the endpoint has buffered data the host has not read yet.
        data_pending: bool,
    },
    TransferResult(TransferStatus),
    Pending,
    Idle,
}

/// Blocking control-transfer primitive of a port.
pub trait ControlPort {
    /// Issues one control transfer and returns the number of data-stage bytes
    /// moved. Blocks until the transfer completes or fails.
    fn device_request(
        &mut self,
        req_type: PortReqTy,
        req_recipient: PortReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransferError>;
}

/// A bound bulk or interrupt pipe.
pub trait StreamPipe {
    /// Non-blocking check for buffered inbound data. Never transfers.
    fn data_ready(&mut self) -> Result<bool, TransferError>;

    /// Blocking stream read; returns the byte count of the received packet.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;

    /// Blocking stream write of one packet.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransferError>;
}

/// A port with an addressed device behind it, ready for class-driver setup.
pub trait HostPort: ControlPort {
    type Pipe: StreamPipe;

    /// The device's raw configuration descriptor, as fetched during
    /// enumeration.
    fn config_descriptor(&mut self) -> Result<Vec<u8>, TransferError>;

    /// Binds a host pipe to the endpoint with the given `bEndpointAddress`.
    fn open_pipe(
        &mut self,
        endpoint_address: u8,
        double_buffered: bool,
    ) -> Result<Self::Pipe, TransferError>;
}

/// Port handle backed by the host controller daemon's scheme files.
#[derive(Debug)]
pub struct SchemePort {
    scheme: String,
    port: usize,
}

impl SchemePort {
    pub fn new(scheme: String, port: usize) -> Self {
        Self { scheme, port }
    }

    fn port_path(&self, sub: &str) -> String {
        format!("/scheme/{}/port{}/{}", self.scheme, self.port, sub)
    }
}

impl ControlPort for SchemePort {
    fn device_request(
        &mut self,
        req_type: PortReqTy,
        req_recipient: PortReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        data: DeviceReqData<'_>,
    ) -> Result<usize, TransferError> {
        let length =
            u16::try_from(data.len()).map_err(|_| TransferError::BufTooLarge(data.len()))?;

        let req = PortReq {
            direction: data.direction(),
            req_type,
            req_recipient,
            request,
            value,
            index,
            length,
            transfers_data: !matches!(data, DeviceReqData::NoData),
        };
        let json = serde_json::to_vec(&req)?;

        let mut file = File::open(self.port_path("request"))?;

        let json_bytes_written = file.write(&json)?;
        if json_bytes_written != json.len() {
            return Err(TransferError::InvalidResponse(
                "request file did not accept the whole envelope",
            ));
        }

        match data {
            DeviceReqData::In(buf) => Ok(file.read(buf)?),
            DeviceReqData::Out(buf) => {
                let bytes_written = file.write(buf)?;
                if bytes_written != buf.len() {
                    return Err(TransferError::InvalidResponse(
                        "request file did not transfer all data-stage bytes",
                    ));
                }
                Ok(bytes_written)
            }
            DeviceReqData::NoData => Ok(0),
        }
    }
}

impl HostPort for SchemePort {
    type Pipe = SchemePipe;

    fn config_descriptor(&mut self) -> Result<Vec<u8>, TransferError> {
        Ok(std::fs::read(self.port_path("descriptors/config"))?)
    }

    // The scheme backend's transfer rings are managed by the controller
    // daemon, so the double-banking hint has nothing to configure here.
    fn open_pipe(
        &mut self,
        endpoint_address: u8,
        _double_buffered: bool,
    ) -> Result<SchemePipe, TransferError> {
        let num = endpoint_address & !ENDP_ADDR_DIRECTION_BIT;
        let ctl = File::open(self.port_path(&format!("endpoints/{}/ctl", num)))?;
        let data = File::open(self.port_path(&format!("endpoints/{}/data", num)))?;
        Ok(SchemePipe { ctl, data })
    }
}

/// Stream pipe backed by an endpoint's ctl/data scheme file pair.
#[derive(Debug)]
pub struct SchemePipe {
    ctl: File,
    data: File,
}

impl SchemePipe {
    fn ctl_req(&mut self, ctl_req: &PipeCtlReq) -> Result<(), TransferError> {
        let ctl_buffer = serde_json::to_vec(ctl_req)?;

        let ctl_bytes_written = self.ctl.write(&ctl_buffer)?;
        if ctl_bytes_written != ctl_buffer.len() {
            return Err(TransferError::InvalidResponse(
                "ctl file did not process the whole request",
            ));
        }

        Ok(())
    }
    fn ctl_res(&mut self) -> Result<PipeCtlRes, TransferError> {
        // a response must never exceed 256 bytes
        let mut ctl_buffer = [0u8; 256];
        let ctl_bytes_read = self.ctl.read(&mut ctl_buffer)?;

        Ok(serde_json::from_slice(&ctl_buffer[..ctl_bytes_read])?)
    }
    fn finish_transfer(&mut self) -> Result<usize, TransferError> {
        match self.ctl_res()? {
            PipeCtlRes::TransferResult(status) => status.into_result(),
            PipeCtlRes::Pending => Err(TransferError::Busy),
            _ => Err(TransferError::InvalidResponse("expected transfer result")),
        }
    }
}

impl StreamPipe for SchemePipe {
    fn data_ready(&mut self) -> Result<bool, TransferError> {
        self.ctl_req(&PipeCtlReq::Status)?;
        match self.ctl_res()? {
            PipeCtlRes::Status { data_pending, .. } => Ok(data_pending),
            _ => Err(TransferError::InvalidResponse("expected status response")),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.ctl_req(&PipeCtlReq::Transfer {
            direction: PortReqDirection::DeviceToHost,
            count: buf.len() as u32,
        })?;
        let _bytes_read = self.data.read(buf)?;
        self.finish_transfer()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransferError> {
        self.ctl_req(&PipeCtlReq::Transfer {
            direction: PortReqDirection::HostToDevice,
            count: buf.len() as u32,
        })?;
        let bytes_written = self.data.write(buf)?;
        if bytes_written != buf.len() {
            return Err(TransferError::InvalidResponse(
                "data file did not accept the whole packet",
            ));
        }
        self.finish_transfer()
    }
}
