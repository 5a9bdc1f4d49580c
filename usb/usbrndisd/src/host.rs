//! The RNDIS host interface: pipe configuration, the encapsulated
//! command/response transport, session management and packet framing.

use std::mem;
use std::time::{Duration, Instant};

use driver_usb_host::{
    ControlPort, DeviceReqData, HostPort, PortReqRecipient, PortReqTy, StreamPipe, TransferError,
};
use thiserror::Error;

use crate::rndis::{
    self, InitializeCmplt, InitializeMsg, KeepAliveCmplt, KeepAliveMsg, MessageHeader, PacketMsg,
    QueryCmplt, QueryMsg, SetCmplt, SetMsg, INFO_BUFFER_OFFSET_BASE,
};
use crate::scanner::{self, EnumerationError};

/// How often [`RndisHost::task`] refreshes the session to keep the device out
/// of standby.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How many times to re-issue GET_ENCAPSULATED_RESPONSE before giving up on a
/// response that never arrives.
const RESPONSE_POLL_ATTEMPTS: usize = 8;

/// One host pipe of the interface configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipeConfig {
    /// Host pipe slot; zero means unassigned.
    pub number: u8,
    pub double_banked: bool,
}

/// Caller-supplied interface configuration. Must be fully populated before
/// [`RndisHost::configure`] runs.
#[derive(Clone, Copy, Debug)]
pub struct InterfaceConfig {
    pub data_in: PipeConfig,
    pub data_out: PipeConfig,
    pub notification: PipeConfig,
    /// Largest packet payload the host accepts per inbound packet message;
    /// also advertised as the maximum transfer size during INITIALIZE.
    pub host_max_packet_size: u32,
}

impl InterfaceConfig {
    fn is_complete(&self) -> bool {
        self.data_in.number != 0
            && self.data_out.number != 0
            && self.notification.number != 0
            && self.host_max_packet_size != 0
    }
}

/// Live interface state, owned by one [`RndisHost`] instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceState {
    /// True only after a successful configuration pass; every data-plane
    /// operation fails fast while this is false.
    pub is_active: bool,
    pub control_interface: u8,
    pub data_in_pipe_size: u16,
    pub data_out_pipe_size: u16,
    pub notification_pipe_size: u16,
    /// Largest transfer the device reported during INITIALIZE, as opposed to
    /// the host-side limit in [`InterfaceConfig`].
    pub device_max_packet_size: u32,
    /// Correlation counter; incremented exactly once per control exchange.
    pub request_id: u32,
}

#[derive(Debug, Error)]
pub enum RndisError {
    #[error("interface is not active")]
    Inactive,

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("device rejected command (status {status:#010x})")]
    CommandFailed { status: u32 },

    #[error("response carries request id {got}, expected {sent}")]
    RequestIdMismatch { sent: u32, got: u32 },

    #[error("no encapsulated response after {0} polls")]
    NoResponse(usize),

    #[error("malformed control response: {0}")]
    MalformedResponse(&'static str),

    #[error("property value of {len} bytes exceeds the {max} byte buffer")]
    ResponseTooLarge { len: usize, max: usize },

    #[error("packet payload of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge { len: usize, max: usize },
}

struct Pipes<P> {
    data_in: P,
    data_out: P,
    notification: P,
}

/// Host-side driver instance for one attached RNDIS device. Owns its port and
/// pipes exclusively; all operations are synchronous.
pub struct RndisHost<P: HostPort> {
    port: P,
    config: InterfaceConfig,
    state: InterfaceState,
    pipes: Option<Pipes<P::Pipe>>,
    initialized: bool,
    last_keepalive: Option<Instant>,
}

impl<P: HostPort> RndisHost<P> {
    pub fn new(port: P, config: InterfaceConfig) -> Self {
        Self {
            port,
            config,
            state: InterfaceState::default(),
            pipes: None,
            initialized: false,
            last_keepalive: None,
        }
    }

    pub fn state(&self) -> &InterfaceState {
        &self.state
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Scans `config_descriptor` for the RNDIS interfaces and binds the three
    /// pipes. Idempotent: a re-run drops previously bound pipes first. On any
    /// failure the interface stays inactive.
    pub fn configure(&mut self, config_descriptor: &[u8]) -> Result<(), EnumerationError> {
        self.pipes = None;
        self.state = InterfaceState::default();
        self.initialized = false;
        self.last_keepalive = None;

        if !self.config.is_complete() {
            log::error!("usbrndisd: interface configuration is incomplete");
            return Err(EnumerationError::EndpointsNotFound);
        }

        let iface = scanner::scan(config_descriptor)?;
        log::debug!(
            "usbrndisd: interface {} endpoints {:?}",
            iface.control_interface,
            iface.found
        );

        let config = self.config;
        let mut open = |address: u8, double_banked: bool| {
            self.port.open_pipe(address, double_banked).map_err(|err| {
                log::error!("usbrndisd: failed to bind pipe to endpoint {:#04x}: {}", address, err);
                EnumerationError::EndpointsNotFound
            })
        };
        let data_in = open(iface.data_in.address, config.data_in.double_banked)?;
        let data_out = open(iface.data_out.address, config.data_out.double_banked)?;
        let notification = open(iface.notification.address, config.notification.double_banked)?;

        self.state.control_interface = iface.control_interface;
        self.state.data_in_pipe_size = iface.data_in.max_packet_size;
        self.state.data_out_pipe_size = iface.data_out.max_packet_size;
        self.state.notification_pipe_size = iface.notification.max_packet_size;
        self.pipes = Some(Pipes {
            data_in,
            data_out,
            notification,
        });
        self.state.is_active = true;
        Ok(())
    }

    /// Drops the pipes and resets the interface state, e.g. after the device
    /// detached. A fresh `configure` pass is needed before further use.
    pub fn reset(&mut self) {
        self.pipes = None;
        self.state = InterfaceState::default();
        self.initialized = false;
        self.last_keepalive = None;
    }

    fn send_encapsulated_command(&mut self, buf: &[u8]) -> Result<usize, TransferError> {
        self.port.device_request(
            PortReqTy::Class,
            PortReqRecipient::Interface,
            rndis::SEND_ENCAPSULATED_COMMAND,
            0,
            self.state.control_interface.into(),
            DeviceReqData::Out(buf),
        )
    }

    fn get_encapsulated_response(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.port.device_request(
            PortReqTy::Class,
            PortReqRecipient::Interface,
            rndis::GET_ENCAPSULATED_RESPONSE,
            0,
            self.state.control_interface.into(),
            DeviceReqData::In(buf),
        )
    }

    /// One full control-plane round trip: send the command, then poll for a
    /// response until the device produces one. A device with nothing queued
    /// answers with less than a message header.
    fn exchange(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, RndisError> {
        self.send_encapsulated_command(command)?;

        for _ in 0..RESPONSE_POLL_ATTEMPTS {
            let len = self.get_encapsulated_response(response)?;
            if len < mem::size_of::<MessageHeader>() {
                continue;
            }
            let header: &MessageHeader = plain::from_bytes(&response[..len])
                .map_err(|_| RndisError::MalformedResponse("response shorter than a header"))?;
            if header.message_type != 0 {
                return Ok(len);
            }
        }
        Err(RndisError::NoResponse(RESPONSE_POLL_ATTEMPTS))
    }

    /// Correlates a `*_CMPLT` response with the request that was just sent.
    /// A wrong request id is a protocol violation, never matched
    /// heuristically; the status field is checked separately because its
    /// offset varies by message.
    fn verify_complete(
        expected_type: u32,
        sent_id: u32,
        message_type: u32,
        request_id: u32,
        status: u32,
    ) -> Result<(), RndisError> {
        if message_type != expected_type {
            return Err(RndisError::MalformedResponse("unexpected message type"));
        }
        if request_id != sent_id {
            return Err(RndisError::RequestIdMismatch {
                sent: sent_id,
                got: request_id,
            });
        }
        if status != rndis::RNDIS_STATUS_SUCCESS {
            return Err(RndisError::CommandFailed { status });
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u32 {
        self.state.request_id = self.state.request_id.wrapping_add(1);
        self.state.request_id
    }

    fn ensure_active(&self) -> Result<(), RndisError> {
        if self.state.is_active {
            Ok(())
        } else {
            Err(RndisError::Inactive)
        }
    }

    /// Establishes the RNDIS session and records the device's maximum
    /// transfer size.
    pub fn initialize(&mut self) -> Result<(), RndisError> {
        self.ensure_active()?;
        let id = self.next_request_id();

        let msg = InitializeMsg {
            message_type: rndis::REMOTE_NDIS_INITIALIZE_MSG,
            message_length: mem::size_of::<InitializeMsg>() as u32,
            request_id: id,
            major_version: rndis::RNDIS_MAJOR_VERSION,
            minor_version: rndis::RNDIS_MINOR_VERSION,
            max_transfer_size: self.config.host_max_packet_size,
        };

        let mut response = [0u8; mem::size_of::<InitializeCmplt>()];
        let len = self.exchange(unsafe { plain::as_bytes(&msg) }, &mut response)?;
        if len < mem::size_of::<InitializeCmplt>() {
            return Err(RndisError::MalformedResponse("short INITIALIZE_CMPLT"));
        }
        let cmplt: &InitializeCmplt = plain::from_bytes(&response)
            .map_err(|_| RndisError::MalformedResponse("short INITIALIZE_CMPLT"))?;

        Self::verify_complete(
            rndis::REMOTE_NDIS_INITIALIZE_CMPLT,
            id,
            cmplt.message_type,
            cmplt.request_id,
            cmplt.status,
        )?;

        self.state.device_max_packet_size = cmplt.max_transfer_size;
        self.initialized = true;
        self.last_keepalive = Some(Instant::now());
        log::info!(
            "usbrndisd: session up, device max packet size {}",
            self.state.device_max_packet_size
        );
        Ok(())
    }

    /// Reads the device property identified by `oid` into `buf`, returning the
    /// value's length. A value larger than `buf` is an error, not a
    /// truncation.
    pub fn query_property(&mut self, oid: u32, buf: &mut [u8]) -> Result<usize, RndisError> {
        self.ensure_active()?;
        let id = self.next_request_id();

        let msg = QueryMsg {
            message_type: rndis::REMOTE_NDIS_QUERY_MSG,
            message_length: mem::size_of::<QueryMsg>() as u32,
            request_id: id,
            oid,
            information_buffer_length: 0,
            information_buffer_offset: 0,
            device_vc_handle: 0,
        };

        let mut response = vec![0u8; mem::size_of::<QueryCmplt>() + buf.len()];
        let len = self.exchange(unsafe { plain::as_bytes(&msg) }, &mut response)?;
        if len < mem::size_of::<QueryCmplt>() {
            return Err(RndisError::MalformedResponse("short QUERY_CMPLT"));
        }
        let cmplt: &QueryCmplt = plain::from_bytes(&response[..mem::size_of::<QueryCmplt>()])
            .map_err(|_| RndisError::MalformedResponse("short QUERY_CMPLT"))?;

        Self::verify_complete(
            rndis::REMOTE_NDIS_QUERY_CMPLT,
            id,
            cmplt.message_type,
            cmplt.request_id,
            cmplt.status,
        )?;

        let value_len = cmplt.information_buffer_length as usize;
        let value_offset = cmplt.information_buffer_offset as usize;
        if value_len > buf.len() {
            return Err(RndisError::ResponseTooLarge {
                len: value_len,
                max: buf.len(),
            });
        }
        if value_len == 0 {
            return Ok(0);
        }
        let start = INFO_BUFFER_OFFSET_BASE + value_offset;
        let end = start
            .checked_add(value_len)
            .filter(|&end| end <= len)
            .ok_or(RndisError::MalformedResponse("information buffer out of bounds"))?;
        buf[..value_len].copy_from_slice(&response[start..end]);
        Ok(value_len)
    }

    /// Writes the device property identified by `oid`.
    pub fn set_property(&mut self, oid: u32, value: &[u8]) -> Result<(), RndisError> {
        self.ensure_active()?;
        let id = self.next_request_id();

        let header = SetMsg {
            message_type: rndis::REMOTE_NDIS_SET_MSG,
            message_length: (mem::size_of::<SetMsg>() + value.len()) as u32,
            request_id: id,
            oid,
            information_buffer_length: value.len() as u32,
            information_buffer_offset: (mem::size_of::<SetMsg>() - INFO_BUFFER_OFFSET_BASE) as u32,
            device_vc_handle: 0,
        };

        let mut command = Vec::with_capacity(mem::size_of::<SetMsg>() + value.len());
        command.extend_from_slice(unsafe { plain::as_bytes(&header) });
        command.extend_from_slice(value);

        let mut response = [0u8; mem::size_of::<SetCmplt>()];
        let len = self.exchange(&command, &mut response)?;
        if len < mem::size_of::<SetCmplt>() {
            return Err(RndisError::MalformedResponse("short SET_CMPLT"));
        }
        let cmplt: &SetCmplt = plain::from_bytes(&response)
            .map_err(|_| RndisError::MalformedResponse("short SET_CMPLT"))?;

        Self::verify_complete(
            rndis::REMOTE_NDIS_SET_CMPLT,
            id,
            cmplt.message_type,
            cmplt.request_id,
            cmplt.status,
        )
    }

    /// Empty-payload exchange that keeps the device from entering standby.
    pub fn send_keep_alive(&mut self) -> Result<(), RndisError> {
        self.ensure_active()?;
        let id = self.next_request_id();

        let msg = KeepAliveMsg {
            message_type: rndis::REMOTE_NDIS_KEEPALIVE_MSG,
            message_length: mem::size_of::<KeepAliveMsg>() as u32,
            request_id: id,
        };

        let mut response = [0u8; mem::size_of::<KeepAliveCmplt>()];
        let len = self.exchange(unsafe { plain::as_bytes(&msg) }, &mut response)?;
        if len < mem::size_of::<KeepAliveCmplt>() {
            return Err(RndisError::MalformedResponse("short KEEPALIVE_CMPLT"));
        }
        let cmplt: &KeepAliveCmplt = plain::from_bytes(&response)
            .map_err(|_| RndisError::MalformedResponse("short KEEPALIVE_CMPLT"))?;

        Self::verify_complete(
            rndis::REMOTE_NDIS_KEEPALIVE_CMPLT,
            id,
            cmplt.message_type,
            cmplt.request_id,
            cmplt.status,
        )
    }

    /// Recurring management hook, meant to be called from the owner's main
    /// loop. Drains response-available notifications and refreshes the
    /// keepalive once per [`KEEPALIVE_INTERVAL`].
    pub fn task(&mut self) -> Result<(), RndisError> {
        if !self.state.is_active || !self.initialized {
            return Ok(());
        }

        if let Some(pipes) = self.pipes.as_mut() {
            if pipes.notification.data_ready()? {
                let mut notification = [0u8; 8];
                let len = pipes.notification.read(&mut notification)?;
                log::trace!("usbrndisd: {} byte notification from device", len);
            }
        }

        if self
            .last_keepalive
            .is_some_and(|at| at.elapsed() >= KEEPALIVE_INTERVAL)
        {
            self.send_keep_alive()?;
            self.last_keepalive = Some(Instant::now());
        }
        Ok(())
    }

    /// Non-blocking check for a pending inbound packet. Never touches a pipe
    /// while the interface is inactive.
    pub fn is_packet_received(&mut self) -> bool {
        if !self.state.is_active {
            return false;
        }
        let Some(pipes) = self.pipes.as_mut() else {
            return false;
        };
        match pipes.data_in.data_ready() {
            Ok(ready) => ready,
            Err(err) => {
                log::debug!("usbrndisd: data-in status check failed: {}", err);
                false
            }
        }
    }

    /// Reads the next pending packet message, strips the framing header and
    /// copies the Ethernet payload into `buf`. Returns `Ok(None)` when no
    /// packet is pending.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RndisError> {
        self.ensure_active()?;
        let host_max = self.config.host_max_packet_size as usize;
        let pipes = self.pipes.as_mut().ok_or(RndisError::Inactive)?;

        if !pipes.data_in.data_ready()? {
            return Ok(None);
        }

        let mut message = vec![0u8; mem::size_of::<PacketMsg>() + host_max];
        let len = pipes.data_in.read(&mut message)?;
        if len < mem::size_of::<PacketMsg>() {
            return Err(RndisError::MalformedResponse("short packet message"));
        }
        let header: &PacketMsg = plain::from_bytes(&message[..mem::size_of::<PacketMsg>()])
            .map_err(|_| RndisError::MalformedResponse("short packet message"))?;
        if header.message_type != rndis::REMOTE_NDIS_PACKET_MSG {
            return Err(RndisError::MalformedResponse("not a packet message"));
        }

        let data_offset = header.data_offset as usize;
        let data_length = header.data_length as usize;
        let start = INFO_BUFFER_OFFSET_BASE + data_offset;
        let end = start
            .checked_add(data_length)
            .filter(|&end| end <= len)
            .ok_or(RndisError::MalformedResponse("packet data out of bounds"))?;
        if data_length > buf.len() {
            return Err(RndisError::PacketTooLarge {
                len: data_length,
                max: buf.len(),
            });
        }
        buf[..data_length].copy_from_slice(&message[start..end]);
        Ok(Some(data_length))
    }

    /// Wraps `buf` in a packet message header and writes it to the bulk OUT
    /// pipe. An empty payload sends a header-only message.
    pub fn send_packet(&mut self, buf: &[u8]) -> Result<(), RndisError> {
        self.ensure_active()?;

        let total = mem::size_of::<PacketMsg>() + buf.len();
        let device_max = self.state.device_max_packet_size as usize;
        // A device may report a max_transfer_size smaller than the framing
        // header; no payload fits such a limit.
        if self.initialized && device_max != 0 && total > device_max {
            return Err(RndisError::PacketTooLarge {
                len: buf.len(),
                max: device_max.saturating_sub(mem::size_of::<PacketMsg>()),
            });
        }

        let header = PacketMsg {
            message_type: rndis::REMOTE_NDIS_PACKET_MSG,
            message_length: total as u32,
            data_offset: (mem::size_of::<PacketMsg>() - INFO_BUFFER_OFFSET_BASE) as u32,
            data_length: buf.len() as u32,
            ..PacketMsg::default()
        };

        let mut message = Vec::with_capacity(total);
        message.extend_from_slice(unsafe { plain::as_bytes(&header) });
        message.extend_from_slice(buf);

        let pipes = self.pipes.as_mut().ok_or(RndisError::Inactive)?;
        pipes.data_out.write(&message)?;
        Ok(())
    }
}
