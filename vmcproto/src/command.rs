//! Command registry and payload layouts.
//!
//! Payloads here are the frame data *after* the sequence byte; multi-byte
//! integers are big-endian on the wire.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every command code the upper computer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    /// UC → VMC: query whether a selection can vend.
    CheckSelection = 0x01,
    /// VMC → UC: response to [`Command::CheckSelection`].
    SelectionStatus = 0x02,
    /// UC → VMC: authorize a vend through the normal motor path.
    SelectToBuy = 0x03,
    /// VMC → UC: dispensing outcome report.
    DispensingStatus = 0x04,
    /// Keypad selection (`selection != 0`) or cancel (`selection == 0`).
    SelectCancel = 0x05,
    /// UC → VMC: force-dispense a selection.
    DirectDrive = 0x06,
    /// VMC → UC: one catalogue row (price, stock, capacity, product).
    SelectionInfo = 0x11,
    SetPrice = 0x12,
    SetInventory = 0x13,
    SetCapacity = 0x14,
    /// UC → VMC: request a full catalogue dump.
    SyncInfo = 0x31,
    /// VMC heartbeat; answered within 100 ms.
    Poll = 0x41,
    Ack = 0x42,
}

/// Outcome byte of a [`Command::DispensingStatus`] report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DispenseStatus {
    Success = 0x00,
    InProgress = 0x01,
    Dispensed = 0x02,
    Jammed = 0x03,
    MotorFault = 0x04,
    MotorMissing = 0x06,
    ElevatorFault = 0x07,
    Terminated = 0xFF,
}

impl DispenseStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::Dispensed)
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::InProgress)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Success | Self::Dispensed => "dispensed",
            Self::InProgress => "dispensing in progress",
            Self::Jammed => "selection jammed",
            Self::MotorFault => "motor did not stop normally",
            Self::MotorMissing => "motor does not exist",
            Self::ElevatorFault => "elevator error",
            Self::Terminated => "purchase terminated",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown dispense status {0:#04x}")]
    UnknownStatus(u8),
}

fn need(data: &[u8], n: usize) -> Result<(), PayloadError> {
    if data.len() < n {
        return Err(PayloadError::Truncated {
            need: n,
            got: data.len(),
        });
    }
    Ok(())
}

fn be16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn be32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Where a configuration write lands: one cell, a whole tray, or every cell.
///
/// On the wire a tray is addressed as `1000 + tray` and a broadcast as
/// selection `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Selection(u16),
    Tray(u8),
    All,
}

impl Target {
    pub fn wire_selection(self) -> u16 {
        match self {
            Self::Selection(s) => s,
            Self::Tray(t) => 1000 + t as u16,
            Self::All => 0,
        }
    }
}

/// Payload of a keypad [`Command::SelectCancel`] frame.
pub fn parse_selection(data: &[u8]) -> Result<u16, PayloadError> {
    need(data, 2)?;
    Ok(be16(data))
}

/// One row of the VMC's own selection table ([`Command::SelectionInfo`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionInfo {
    pub selection: u16,
    pub price_minor: u32,
    pub inventory: u8,
    pub capacity: u8,
    pub product_id: u16,
    pub status: u8,
}

impl SelectionInfo {
    pub fn parse(data: &[u8]) -> Result<Self, PayloadError> {
        need(data, 11)?;
        Ok(Self {
            selection: be16(&data[0..2]),
            price_minor: be32(&data[2..6]),
            inventory: data[6],
            capacity: data[7],
            product_id: be16(&data[8..10]),
            status: data[10],
        })
    }
}

/// A decoded [`Command::DispensingStatus`] report. Older VMC firmware omits
/// the selection echo, so it stays optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispenseReport {
    pub status: DispenseStatus,
    pub selection: Option<u16>,
}

impl DispenseReport {
    pub fn parse(data: &[u8]) -> Result<Self, PayloadError> {
        need(data, 1)?;
        let status =
            DispenseStatus::try_from(data[0]).map_err(|_| PayloadError::UnknownStatus(data[0]))?;
        let selection = (data.len() >= 3).then(|| be16(&data[1..3]));
        Ok(Self { status, selection })
    }
}

/// Payload of a [`Command::DirectDrive`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectDrive {
    pub drop_sensor: bool,
    pub elevator: bool,
    pub selection: u16,
}

impl DirectDrive {
    pub fn encode(self) -> [u8; 4] {
        let sel = self.selection.to_be_bytes();
        [self.drop_sensor as u8, self.elevator as u8, sel[0], sel[1]]
    }
}

pub fn check_selection(selection: u16) -> Vec<u8> {
    selection.to_be_bytes().to_vec()
}

pub fn select_to_buy(selection: u16) -> Vec<u8> {
    selection.to_be_bytes().to_vec()
}

/// UC-originated cancel; `selection` 0 clears whatever is pending.
pub fn select_cancel(selection: u16) -> Vec<u8> {
    selection.to_be_bytes().to_vec()
}

pub fn set_price(target: Target, price_minor: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&target.wire_selection().to_be_bytes());
    out.extend_from_slice(&price_minor.to_be_bytes());
    out
}

pub fn set_inventory(target: Target, inventory: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.extend_from_slice(&target.wire_selection().to_be_bytes());
    out.push(inventory);
    out
}

pub fn set_capacity(target: Target, capacity: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.extend_from_slice(&target.wire_selection().to_be_bytes());
    out.push(capacity);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for code in [
            0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11, 0x12, 0x13, 0x14, 0x31, 0x41, 0x42,
        ] {
            let cmd = Command::try_from(code).unwrap();
            assert_eq!(u8::from(cmd), code);
        }
        assert!(Command::try_from(0x99).is_err());
    }

    #[test]
    fn dispense_status_classes() {
        assert!(DispenseStatus::Success.is_success());
        assert!(DispenseStatus::Dispensed.is_success());
        assert!(!DispenseStatus::InProgress.is_final());
        for code in [0x03u8, 0x04, 0x06, 0x07, 0xFF] {
            let status = DispenseStatus::try_from(code).unwrap();
            assert!(status.is_final());
            assert!(!status.is_success());
        }
    }

    #[test]
    fn parse_keypad_selection() {
        assert_eq!(parse_selection(&[0x00, 0x07]), Ok(7));
        assert_eq!(parse_selection(&[0x00, 0x00]), Ok(0));
        assert!(matches!(
            parse_selection(&[0x00]),
            Err(PayloadError::Truncated { .. })
        ));
    }

    #[test]
    fn selection_info_layout() {
        let data = [
            0x00, 0x07, // selection
            0x00, 0x00, 0x00, 0x96, // price 150
            0x03, // inventory
            0x05, // capacity
            0x12, 0x34, // product id
            0x00, // status
        ];
        let info = SelectionInfo::parse(&data).unwrap();
        assert_eq!(
            info,
            SelectionInfo {
                selection: 7,
                price_minor: 150,
                inventory: 3,
                capacity: 5,
                product_id: 0x1234,
                status: 0,
            }
        );
    }

    #[test]
    fn dispense_report_with_and_without_selection() {
        let full = DispenseReport::parse(&[0x02, 0x00, 0x07]).unwrap();
        assert_eq!(full.status, DispenseStatus::Dispensed);
        assert_eq!(full.selection, Some(7));

        let bare = DispenseReport::parse(&[0x03]).unwrap();
        assert_eq!(bare.status, DispenseStatus::Jammed);
        assert_eq!(bare.selection, None);

        assert_eq!(
            DispenseReport::parse(&[0x55]),
            Err(PayloadError::UnknownStatus(0x55))
        );
    }

    #[test]
    fn direct_drive_layout() {
        let payload = DirectDrive {
            drop_sensor: true,
            elevator: true,
            selection: 7,
        }
        .encode();
        assert_eq!(payload, [0x01, 0x01, 0x00, 0x07]);
    }

    #[test]
    fn target_wire_encoding() {
        assert_eq!(Target::Selection(42).wire_selection(), 42);
        assert_eq!(Target::Tray(3).wire_selection(), 1003);
        assert_eq!(Target::All.wire_selection(), 0);
    }

    #[test]
    fn config_write_payloads() {
        // tray 3 broadcast: 1000 + 3 = 0x03EB, price 200 = 0x000000C8
        assert_eq!(
            set_price(Target::Tray(3), 200),
            vec![0x03, 0xEB, 0x00, 0x00, 0x00, 0xC8]
        );
        assert_eq!(
            set_inventory(Target::Selection(7), 2),
            vec![0x00, 0x07, 0x02]
        );
        assert_eq!(set_capacity(Target::All, 5), vec![0x00, 0x00, 0x05]);
    }
}
