//! Constants from the SD Specifications.
//!
//! The command values are the raw command indices; the transmission bit
//! (0x40) is OR'd in when the frame is built. CRC generation is not
//! implemented: in SPI mode cards only check the CRC of CMD0 and CMD8, whose
//! values are fixed, and every other command carries the placeholder byte.

// ****************************************************************************
//
// Commands
//
// ****************************************************************************

/// GO_IDLE_STATE - init card in SPI mode if CS low
pub const CMD0: u8 = 0;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 8;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 9;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 12;
/// SET_BLOCKLEN - force the block length for byte-addressed cards
pub const CMD16: u8 = 16;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 17;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card
pub const CMD18: u8 = 18;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 24;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 25;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 55;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 58;
/// SD_SEND_OP_COND - sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 41;

// ****************************************************************************
//
// Fixed CRC bytes and command arguments
//
// ****************************************************************************

/// Valid CRC for CMD0 with argument zero
pub const CRC_CMD0: u8 = 0x95;
/// Valid CRC for CMD8 with the voltage-check argument
pub const CRC_CMD8: u8 = 0x87;
/// Placeholder CRC for every other command; ignored by the card in SPI mode
pub const CRC_DEFAULT: u8 = 0xFF;

/// CMD8 argument: 2.7-3.6V range plus the 0xAA check pattern, echoed back
/// in the low bits of a valid R7 response
pub const IF_COND_ARG: u32 = 0x1AA;
/// ACMD41 argument bit announcing host support for high-capacity cards
pub const ACMD41_HCS: u32 = 0x4000_0000;
/// Card-capacity-status bit of the OCR; set for block-addressed cards
pub const OCR_CCS: u32 = 0x4000_0000;

// ****************************************************************************
//
// Responses and tokens
//
// ****************************************************************************

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;
/// write data rejected: CRC mismatch
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
/// write data rejected: write error
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

// ****************************************************************************
//
// Card Specific Data
//
// ****************************************************************************

/// Card Specific Data, version 1 (byte-addressed cards)
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

impl CsdV1 {
    fn c_size(&self) -> u32 {
        (u32::from(self.data[6] & 0x03) << 10)
            | (u32::from(self.data[7]) << 2)
            | (u32::from(self.data[8]) >> 6)
    }

    fn c_size_mult(&self) -> u32 {
        (u32::from(self.data[9] & 0x03) << 1) | (u32::from(self.data[10]) >> 7)
    }

    fn read_bl_len(&self) -> u32 {
        u32::from(self.data[5] & 0x0F)
    }

    /// Card capacity in 512-byte blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        let block_count = (self.c_size() + 1) << (self.c_size_mult() + 2);
        let capacity_bytes = u64::from(block_count) << self.read_bl_len();
        (capacity_bytes / crate::Block::LEN as u64) as u32
    }
}

/// Card Specific Data, version 2 (block-addressed cards)
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

impl CsdV2 {
    fn c_size(&self) -> u32 {
        (u32::from(self.data[7] & 0x3F) << 16)
            | (u32::from(self.data[8]) << 8)
            | u32::from(self.data[9])
    }

    /// Card capacity in 512-byte blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.c_size() + 1) * 1024
    }
}

/// Card capacity in 512-byte blocks from a raw CSD, or zero when the
/// structure version is unknown.
pub fn csd_capacity_blocks(data: &[u8; 16]) -> u32 {
    match data[0] >> 6 {
        0 => CsdV1 { data: *data }.card_capacity_blocks(),
        1 => CsdV2 { data: *data }.card_capacity_blocks(),
        _ => 0,
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
