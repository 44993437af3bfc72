use bitflags::bitflags;

bitflags! {
    /// The leading byte of every frame. Bit 7 is reserved: it is never set by the encoder and
    ///  ignored by the decoder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        const RELIABLE_SYN             = 0b0000_0001;
        const RELIABLE_SYN_SUCCESS     = 0b0000_0010;
        const RELIABLE_SYN_FAILURE     = 0b0000_0100;
        const RELIABLE_SYN_ACK_SUCCESS = 0b0000_1000;
        const RELIABLE_ACK             = 0b0001_0000;
        const IGNORE_TIMESTAMP         = 0b0010_0000;
        const DOUBLE_CONTENT_COUNT     = 0b0100_0000;

        /// any of these flags means that the frame carries a message id
        const RELIABLE = Self::RELIABLE_SYN.bits()
            | Self::RELIABLE_SYN_SUCCESS.bits()
            | Self::RELIABLE_SYN_FAILURE.bits()
            | Self::RELIABLE_SYN_ACK_SUCCESS.bits()
            | Self::RELIABLE_ACK.bits();

        /// handshake acknowledgements: flags and message id only, no checksum or body
        const CONTROL = Self::RELIABLE_SYN_SUCCESS.bits()
            | Self::RELIABLE_SYN_FAILURE.bits()
            | Self::RELIABLE_SYN_ACK_SUCCESS.bits()
            | Self::RELIABLE_ACK.bits();
    }
}

impl FrameFlags {
    pub fn is_reliable(&self) -> bool {
        self.intersects(Self::RELIABLE)
    }

    pub fn is_control(&self) -> bool {
        self.intersects(Self::CONTROL)
    }
}

/// The handshake role of a frame, derived from its flags. At most one reliable flag may be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Plain,
    Syn,
    SynSuccess,
    SynFailure,
    /// the sender's acknowledgement of `SynSuccess`
    SynAckSuccess,
    /// the receiver's final acknowledgement, closing the handshake
    Ack,
}

impl FrameKind {
    pub fn from_flags(flags: FrameFlags) -> Option<FrameKind> {
        let reliable = flags & FrameFlags::RELIABLE;
        if reliable.is_empty() {
            return Some(FrameKind::Plain);
        }
        if reliable.bits().count_ones() > 1 {
            return None;
        }

        let kind = if reliable == FrameFlags::RELIABLE_SYN {
            FrameKind::Syn
        }
        else if reliable == FrameFlags::RELIABLE_SYN_SUCCESS {
            FrameKind::SynSuccess
        }
        else if reliable == FrameFlags::RELIABLE_SYN_FAILURE {
            FrameKind::SynFailure
        }
        else if reliable == FrameFlags::RELIABLE_SYN_ACK_SUCCESS {
            FrameKind::SynAckSuccess
        }
        else {
            FrameKind::Ack
        };
        Some(kind)
    }

    /// The flag identifying this kind on the wire (empty for plain frames)
    pub fn flag(&self) -> FrameFlags {
        match self {
            FrameKind::Plain => FrameFlags::empty(),
            FrameKind::Syn => FrameFlags::RELIABLE_SYN,
            FrameKind::SynSuccess => FrameFlags::RELIABLE_SYN_SUCCESS,
            FrameKind::SynFailure => FrameFlags::RELIABLE_SYN_FAILURE,
            FrameKind::SynAckSuccess => FrameFlags::RELIABLE_SYN_ACK_SUCCESS,
            FrameKind::Ack => FrameFlags::RELIABLE_ACK,
        }
    }

    pub fn is_control(&self) -> bool {
        self.flag().is_control()
    }
}
