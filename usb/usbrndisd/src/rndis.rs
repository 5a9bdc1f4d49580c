//! RNDIS wire formats: the encapsulated control messages, the data-plane
//! packet message, and the protocol's message-type/status/OID constants.
//!
//! All messages are little-endian sequences of 32-bit fields. Buffer offsets
//! inside control messages are relative to the `request_id` field, i.e. to
//! byte 8 of the message.

use plain::Plain;

/// Class-specific interface request carrying an RNDIS control message to the
/// device.
pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
/// Class-specific interface request retrieving the device's response.
pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;

pub const REMOTE_NDIS_PACKET_MSG: u32 = 0x0000_0001;
pub const REMOTE_NDIS_INITIALIZE_MSG: u32 = 0x0000_0002;
pub const REMOTE_NDIS_HALT_MSG: u32 = 0x0000_0003;
pub const REMOTE_NDIS_QUERY_MSG: u32 = 0x0000_0004;
pub const REMOTE_NDIS_SET_MSG: u32 = 0x0000_0005;
pub const REMOTE_NDIS_RESET_MSG: u32 = 0x0000_0006;
pub const REMOTE_NDIS_INDICATE_STATUS_MSG: u32 = 0x0000_0007;
pub const REMOTE_NDIS_KEEPALIVE_MSG: u32 = 0x0000_0008;

pub const REMOTE_NDIS_INITIALIZE_CMPLT: u32 = 0x8000_0002;
pub const REMOTE_NDIS_QUERY_CMPLT: u32 = 0x8000_0004;
pub const REMOTE_NDIS_SET_CMPLT: u32 = 0x8000_0005;
pub const REMOTE_NDIS_RESET_CMPLT: u32 = 0x8000_0006;
pub const REMOTE_NDIS_KEEPALIVE_CMPLT: u32 = 0x8000_0008;

pub const RNDIS_STATUS_SUCCESS: u32 = 0x0000_0000;
pub const RNDIS_STATUS_FAILURE: u32 = 0xC000_0001;
pub const RNDIS_STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
pub const RNDIS_STATUS_INVALID_DATA: u32 = 0xC001_0015;
pub const RNDIS_STATUS_MEDIA_CONNECT: u32 = 0x4001_000B;
pub const RNDIS_STATUS_MEDIA_DISCONNECT: u32 = 0x4001_000C;

pub const RNDIS_MAJOR_VERSION: u32 = 1;
pub const RNDIS_MINOR_VERSION: u32 = 0;

/// Buffer offsets in control messages count from the `request_id` field.
pub const INFO_BUFFER_OFFSET_BASE: usize = 8;

/* General OIDs */
pub const OID_GEN_SUPPORTED_LIST: u32 = 0x0001_0101;
pub const OID_GEN_HARDWARE_STATUS: u32 = 0x0001_0102;
pub const OID_GEN_MEDIA_SUPPORTED: u32 = 0x0001_0103;
pub const OID_GEN_MEDIA_IN_USE: u32 = 0x0001_0104;
pub const OID_GEN_MAXIMUM_FRAME_SIZE: u32 = 0x0001_0106;
pub const OID_GEN_LINK_SPEED: u32 = 0x0001_0107;
pub const OID_GEN_TRANSMIT_BLOCK_SIZE: u32 = 0x0001_010A;
pub const OID_GEN_RECEIVE_BLOCK_SIZE: u32 = 0x0001_010B;
pub const OID_GEN_VENDOR_ID: u32 = 0x0001_010C;
pub const OID_GEN_VENDOR_DESCRIPTION: u32 = 0x0001_010D;
pub const OID_GEN_CURRENT_PACKET_FILTER: u32 = 0x0001_010E;
pub const OID_GEN_MAXIMUM_TOTAL_SIZE: u32 = 0x0001_0111;
pub const OID_GEN_MEDIA_CONNECT_STATUS: u32 = 0x0001_0114;
pub const OID_GEN_PHYSICAL_MEDIUM: u32 = 0x0001_0202;

/* IEEE 802.3 (Ethernet) OIDs */
pub const OID_802_3_PERMANENT_ADDRESS: u32 = 0x0101_0101;
pub const OID_802_3_CURRENT_ADDRESS: u32 = 0x0101_0102;
pub const OID_802_3_MULTICAST_LIST: u32 = 0x0101_0103;
pub const OID_802_3_MAXIMUM_LIST_SIZE: u32 = 0x0101_0104;
pub const OID_802_3_MAC_OPTIONS: u32 = 0x0101_0105;
pub const OID_802_3_RCV_ERROR_ALIGNMENT: u32 = 0x0102_0101;
pub const OID_802_3_XMIT_ONE_COLLISION: u32 = 0x0102_0102;
pub const OID_802_3_XMIT_MORE_COLLISIONS: u32 = 0x0102_0103;

/* OID_GEN_CURRENT_PACKET_FILTER bits */
pub const NDIS_PACKET_TYPE_DIRECTED: u32 = 0x0001;
pub const NDIS_PACKET_TYPE_MULTICAST: u32 = 0x0002;
pub const NDIS_PACKET_TYPE_ALL_MULTICAST: u32 = 0x0004;
pub const NDIS_PACKET_TYPE_BROADCAST: u32 = 0x0008;
pub const NDIS_PACKET_TYPE_PROMISCUOUS: u32 = 0x0020;

/// Common prefix of every RNDIS control message and response.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageHeader {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
}

unsafe impl Plain for MessageHeader {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InitializeMsg {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub max_transfer_size: u32,
}

unsafe impl Plain for InitializeMsg {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InitializeCmplt {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub status: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub device_flags: u32,
    pub medium: u32,
    pub max_packets_per_message: u32,
    pub max_transfer_size: u32,
    pub packet_alignment_factor: u32,
    pub af_list_offset: u32,
    pub af_list_size: u32,
}

unsafe impl Plain for InitializeCmplt {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryMsg {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub oid: u32,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
    pub device_vc_handle: u32,
}

unsafe impl Plain for QueryMsg {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryCmplt {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub status: u32,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
}

unsafe impl Plain for QueryCmplt {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetMsg {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub oid: u32,
    pub information_buffer_length: u32,
    pub information_buffer_offset: u32,
    pub device_vc_handle: u32,
}

unsafe impl Plain for SetMsg {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SetCmplt {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub status: u32,
}

unsafe impl Plain for SetCmplt {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepAliveMsg {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
}

unsafe impl Plain for KeepAliveMsg {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepAliveCmplt {
    pub message_type: u32,
    pub message_length: u32,
    pub request_id: u32,
    pub status: u32,
}

unsafe impl Plain for KeepAliveCmplt {}

/// Data-plane framing: this header immediately precedes each Ethernet frame
/// on the bulk pipes. The out-of-band and per-packet-info fields stay zero;
/// this driver does not use them.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketMsg {
    pub message_type: u32,
    pub message_length: u32,
    pub data_offset: u32,
    pub data_length: u32,
    pub oob_data_offset: u32,
    pub oob_data_length: u32,
    pub num_oob_data_elements: u32,
    pub per_packet_info_offset: u32,
    pub per_packet_info_length: u32,
    pub vc_handle: u32,
    pub reserved: u32,
}

unsafe impl Plain for PacketMsg {}
