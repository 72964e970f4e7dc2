//! Card protocol states and the status register.

use bitflags::bitflags;

/// Card family selected by a [`crate::spec::CardSpec`] template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFamily {
    Mmc,
    Sd,
    /// MMC with the 4.x sector-addressed extensions.
    MmcPlus,
}

/// Transport/framing mode. A card starts in native mode and may be switched
/// to SPI exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Native,
    Spi,
}

/// The card state machine as defined by the MMC/SD specifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardState {
    /// Partially powered, waiting for the initialization command.
    #[default]
    Idle,
    /// Power-up sequence complete, waiting for identification.
    Ready,
    /// Identified itself, waiting for an address.
    Ident,
    /// Addressed but unselected.
    Standby,
    /// Selected and ready for data commands.
    Transfer,
    /// Sending data to the host.
    Data,
    /// Receiving data from the host.
    Receive,
    /// Writing to the storage backend (or erasing) while selected.
    Program,
    /// Deselected while a program operation is still pending.
    Disconnect,
    /// Terminal: the card no longer responds to anything.
    Inactive,
}

impl CardState {
    /// The CURRENT_STATE field value reported in bits 12:9 of the status
    /// register.
    pub fn status_code(self) -> u32 {
        match self {
            CardState::Idle => 0,
            CardState::Ready => 1,
            CardState::Ident => 2,
            CardState::Standby => 3,
            CardState::Transfer => 4,
            CardState::Data => 5,
            CardState::Receive => 6,
            CardState::Program => 7,
            CardState::Disconnect => 8,
            // Never observable: inactive cards do not respond.
            CardState::Inactive => 9,
        }
    }

    /// True for states reached after RCA assignment, where addressed
    /// commands (CMD13, CMD15, ...) are legal.
    pub fn is_addressed(self) -> bool {
        matches!(
            self,
            CardState::Standby
                | CardState::Transfer
                | CardState::Data
                | CardState::Receive
                | CardState::Program
                | CardState::Disconnect
        )
    }
}

bitflags! {
    /// Error and event bits of the 32-bit card status register. Bits 12:9
    /// carry [`CardState::status_code`] and are merged in separately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        const APP_CMD            = 1 << 5;
        const READY_FOR_DATA     = 1 << 8;
        const ERASE_RESET        = 1 << 13;
        const WP_ERASE_SKIP      = 1 << 15;
        const CSD_OVERWRITE      = 1 << 16;
        const ERROR              = 1 << 19;
        const CC_ERROR           = 1 << 20;
        const CARD_ECC_FAILED    = 1 << 21;
        const ILLEGAL_COMMAND    = 1 << 22;
        const COM_CRC_ERROR      = 1 << 23;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const CARD_IS_LOCKED     = 1 << 25;
        const WP_VIOLATION       = 1 << 26;
        const ERASE_PARAM        = 1 << 27;
        const ERASE_SEQ_ERROR    = 1 << 28;
        const BLOCK_LEN_ERROR    = 1 << 29;
        const ADDRESS_ERROR      = 1 << 30;
        const OUT_OF_RANGE       = 1 << 31;
    }
}

impl StatusFlags {
    /// Bits cleared by reading the status register (table 4-42 "clear
    /// condition C" of the SD physical layer specification, approximately).
    pub const STICKY: StatusFlags = StatusFlags::APP_CMD
        .union(StatusFlags::ERASE_RESET)
        .union(StatusFlags::WP_ERASE_SKIP)
        .union(StatusFlags::CSD_OVERWRITE)
        .union(StatusFlags::ERROR)
        .union(StatusFlags::CC_ERROR)
        .union(StatusFlags::CARD_ECC_FAILED)
        .union(StatusFlags::ILLEGAL_COMMAND)
        .union(StatusFlags::COM_CRC_ERROR)
        .union(StatusFlags::LOCK_UNLOCK_FAILED)
        .union(StatusFlags::WP_VIOLATION)
        .union(StatusFlags::ERASE_PARAM)
        .union(StatusFlags::ERASE_SEQ_ERROR)
        .union(StatusFlags::BLOCK_LEN_ERROR)
        .union(StatusFlags::ADDRESS_ERROR)
        .union(StatusFlags::OUT_OF_RANGE);
}

#[test]
fn test_status_codes_are_contiguous() {
    let states = [
        CardState::Idle,
        CardState::Ready,
        CardState::Ident,
        CardState::Standby,
        CardState::Transfer,
        CardState::Data,
        CardState::Receive,
        CardState::Program,
        CardState::Disconnect,
    ];
    for (i, state) in states.iter().enumerate() {
        assert_eq!(state.status_code(), i as u32);
    }
}
