use std::fmt;

/// Size of the fixed message header: type, total length, sender.
pub const HEADER_LEN: usize = 3;

/// Largest encodable frame; `total_length` is a single byte.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Largest body a single frame can carry.
pub const MAX_BODY_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Identifier of a participant, assigned by the allocator at registration.
///
/// Worker nodes are numbered from 0 in connection order. `0xFF` is reserved
/// for the allocator itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u8);

impl NodeId {
    /// Sender id used on every allocator-originated message.
    pub const ALLOCATOR: NodeId = NodeId(0xFF);

    /// Upper bound on worker nodes in one run (ids `0..=254`).
    pub const MAX_NODES: usize = 0xFF;

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_allocator(self) -> bool {
        self == Self::ALLOCATOR
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_allocator() {
            write!(f, "allocator")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Message type byte (first header byte).
///
/// Ids 0-13 are the request/reply pairs exchanged with worker code; 14-18
/// carry page contents, invalidations and failure replies.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Init = 0,
    InitReply = 1,
    Exit = 2,
    ExitReply = 3,
    Barrier = 4,
    BarrierReply = 5,
    Alloc = 6,
    AllocReply = 7,
    Cast = 8,
    CastReply = 9,
    ReadFault = 10,
    ReadFaultReply = 11,
    WriteFault = 12,
    WriteFaultReply = 13,
    PageRequest = 14,
    PageData = 15,
    Invalidate = 16,
    InvalidateReply = 17,
    Fail = 18,
}

impl MessageType {
    /// Convert from the wire byte.
    /// Returns None if the value doesn't match a known message type.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => MessageType::Init,
            1 => MessageType::InitReply,
            2 => MessageType::Exit,
            3 => MessageType::ExitReply,
            4 => MessageType::Barrier,
            5 => MessageType::BarrierReply,
            6 => MessageType::Alloc,
            7 => MessageType::AllocReply,
            8 => MessageType::Cast,
            9 => MessageType::CastReply,
            10 => MessageType::ReadFault,
            11 => MessageType::ReadFaultReply,
            12 => MessageType::WriteFault,
            13 => MessageType::WriteFaultReply,
            14 => MessageType::PageRequest,
            15 => MessageType::PageData,
            16 => MessageType::Invalidate,
            17 => MessageType::InvalidateReply,
            18 => MessageType::Fail,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short protocol name, as it appears in logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Init => "INIT",
            MessageType::InitReply => "INIT_REPLY",
            MessageType::Exit => "EXIT",
            MessageType::ExitReply => "EXIT_REPLY",
            MessageType::Barrier => "BARR",
            MessageType::BarrierReply => "BARR_REPLY",
            MessageType::Alloc => "ALOC",
            MessageType::AllocReply => "ALOC_REPLY",
            MessageType::Cast => "CAST",
            MessageType::CastReply => "CAST_REPLY",
            MessageType::ReadFault => "READ_FAULT",
            MessageType::ReadFaultReply => "READ_FAULT_REPLY",
            MessageType::WriteFault => "WRITE_FAULT",
            MessageType::WriteFaultReply => "WRITE_FAULT_REPLY",
            MessageType::PageRequest => "PAGE_REQUEST",
            MessageType::PageData => "PAGE_DATA",
            MessageType::Invalidate => "INVALIDATE",
            MessageType::InvalidateReply => "INVALIDATE_REPLY",
            MessageType::Fail => "FAIL",
        }
    }

    /// Whether a worker may send this type to the allocator.
    pub fn is_worker_originated(self) -> bool {
        matches!(
            self,
            MessageType::Init
                | MessageType::Exit
                | MessageType::Barrier
                | MessageType::Alloc
                | MessageType::Cast
                | MessageType::ReadFault
                | MessageType::WriteFault
                | MessageType::PageData
                | MessageType::InvalidateReply
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        MessageType::from_u8(val).ok_or(UnknownMessageType(val))
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind.as_u8()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error when converting from an unknown type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageType(pub u8);

impl fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message type: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_values_match_protocol() {
        assert_eq!(MessageType::Init as u8, 0);
        assert_eq!(MessageType::InitReply as u8, 1);
        assert_eq!(MessageType::Exit as u8, 2);
        assert_eq!(MessageType::Barrier as u8, 4);
        assert_eq!(MessageType::Alloc as u8, 6);
        assert_eq!(MessageType::Cast as u8, 8);
        assert_eq!(MessageType::ReadFault as u8, 10);
        assert_eq!(MessageType::WriteFault as u8, 12);
        assert_eq!(MessageType::WriteFaultReply as u8, 13);
        assert_eq!(MessageType::Fail as u8, 18);
    }

    #[test]
    fn message_type_try_from() {
        assert_eq!(MessageType::try_from(5), Ok(MessageType::BarrierReply));
        assert_eq!(MessageType::try_from(15), Ok(MessageType::PageData));
        assert_eq!(MessageType::try_from(19), Err(UnknownMessageType(19)));
        assert_eq!(MessageType::try_from(0xFF), Err(UnknownMessageType(0xFF)));
    }

    #[test]
    fn every_known_byte_maps_back() {
        for byte in 0..=18u8 {
            let kind = MessageType::from_u8(byte).expect("known type");
            assert_eq!(u8::from(kind), byte);
        }
    }

    #[test]
    fn worker_originated_types() {
        assert!(MessageType::Alloc.is_worker_originated());
        assert!(MessageType::PageData.is_worker_originated());
        assert!(!MessageType::AllocReply.is_worker_originated());
        assert!(!MessageType::PageRequest.is_worker_originated());
    }

    #[test]
    fn node_id_display() {
        assert_eq!(NodeId(3).to_string(), "3");
        assert_eq!(NodeId::ALLOCATOR.to_string(), "allocator");
        assert!(NodeId(0xFF).is_allocator());
    }
}
