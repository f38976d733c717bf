//! The controller box's command bytes and the trial timing sequence.
//!
//! The names follow the routines in the controller box firmware.

use std::fmt;

/// A single-byte command understood by the controller box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Two reaction-timeout bytes follow.
    MailTout = 0x01,
    /// Arm the external interrupt; the audio cue then starts the trial.
    EnableExtInt0 = 0x02,
    /// Firmware source name.
    GetSource = 0x07,
    /// Firmware version.
    GetVersion = 0x08,
    /// Firmware build date.
    GetCreated = 0x09,
    /// Date of the last firmware change.
    GetModified = 0x0A,
    /// Number of response boxes.
    GetBoxes = 0x0B,
    /// Keys per response box.
    GetKeys = 0x0C,
    /// Turn the participants' monitors off.
    AdjustOff = 0x0F,
    /// Flash the LEDs on every response box.
    FlashLed = 0x10,
    /// Turn the participants' monitors on.
    AdjustOn = 0x12,
    /// Monitor-on and monitor-off times follow, two bytes each.
    CrossModel = 0x20,
}

impl Command {
    /// The contiguous range of information queries, `GetSource..=GetKeys`,
    /// in the order the box expects them.
    pub const INFO_QUERIES: [Command; 6] = [
        Command::GetSource,
        Command::GetVersion,
        Command::GetCreated,
        Command::GetModified,
        Command::GetBoxes,
        Command::GetKeys,
    ];

    /// The byte on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Looks up the command for a byte, if there is one.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use Command::*;
        let cmd = match byte {
            0x01 => MailTout,
            0x02 => EnableExtInt0,
            0x07 => GetSource,
            0x08 => GetVersion,
            0x09 => GetCreated,
            0x0A => GetModified,
            0x0B => GetBoxes,
            0x0C => GetKeys,
            0x0F => AdjustOff,
            0x10 => FlashLed,
            0x12 => AdjustOn,
            0x20 => CrossModel,
            _ => return None,
        };
        Some(cmd)
    }

    /// True for the information queries, which are answered with text.
    pub fn is_info_query(self) -> bool {
        Command::INFO_QUERIES.contains(&self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.byte())
    }
}

/// One byte of an outgoing sequence. Commands discard whatever is pending
/// on the line before they go out; data bytes must not, or they would throw
/// away the command they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireByte {
    /// A command byte.
    Command(Command),
    /// An argument to the preceding command.
    Data(u8),
}

impl WireByte {
    /// The byte on the wire.
    pub fn byte(self) -> u8 {
        match self {
            WireByte::Command(cmd) => cmd.byte(),
            WireByte::Data(b) => b,
        }
    }
}

/// Which value of a trial timing was out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TimingField {
    ReactionTimeout,
    MonitorOn,
    MonitorOff,
}

impl fmt::Display for TimingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimingField::ReactionTimeout => "reaction timeout",
            TimingField::MonitorOn => "monitor on",
            TimingField::MonitorOff => "monitor off",
        };
        write!(f, "{}", name)
    }
}

/// Splits a millisecond value into its low and high byte (`value % 256`,
/// `value / 256`). The box only has 16-bit timers.
pub fn split_millis(field: TimingField, value: i32) -> Result<(u8, u8), (TimingField, i32)> {
    let v = u16::try_from(value).map_err(|_| (field, value))?;
    Ok(((v % 256) as u8, (v / 256) as u8))
}

/// The nine bytes that configure the box for the next trial and arm the
/// external interrupt:
///
/// `MAIL_TOUT, tout lo, tout hi, CROSSMODEL, on lo, on hi, off lo, off hi, ENABLE_EXT_INT0`
pub fn trial_timing_sequence(
    reaction_timeout_ms: i32,
    monitor_on_ms: i32,
    monitor_off_ms: i32,
) -> Result<[WireByte; 9], (TimingField, i32)> {
    let (tout_lo, tout_hi) = split_millis(TimingField::ReactionTimeout, reaction_timeout_ms)?;
    let (on_lo, on_hi) = split_millis(TimingField::MonitorOn, monitor_on_ms)?;
    let (off_lo, off_hi) = split_millis(TimingField::MonitorOff, monitor_off_ms)?;

    Ok([
        WireByte::Command(Command::MailTout),
        WireByte::Data(tout_lo),
        WireByte::Data(tout_hi),
        WireByte::Command(Command::CrossModel),
        WireByte::Data(on_lo),
        WireByte::Data(on_hi),
        WireByte::Data(off_lo),
        WireByte::Data(off_hi),
        WireByte::Command(Command::EnableExtInt0),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table() {
        assert_eq!(Command::MailTout.byte(), 0x01);
        assert_eq!(Command::EnableExtInt0.byte(), 0x02);
        assert_eq!(Command::AdjustOff.byte(), 0x0F);
        assert_eq!(Command::FlashLed.byte(), 0x10);
        assert_eq!(Command::AdjustOn.byte(), 0x12);
        assert_eq!(Command::CrossModel.byte(), 0x20);

        let info: Vec<u8> = Command::INFO_QUERIES.iter().map(|c| c.byte()).collect();
        assert_eq!(info, (0x07..=0x0C).collect::<Vec<u8>>());
    }

    #[test]
    fn from_byte_inverts_byte() {
        for b in 0..=u8::MAX {
            if let Some(cmd) = Command::from_byte(b) {
                assert_eq!(cmd.byte(), b);
            }
        }
        assert_eq!(Command::from_byte(0x03), None);
        assert!(Command::GetBoxes.is_info_query());
        assert!(!Command::FlashLed.is_info_query());
    }

    #[test]
    fn timing_sequence_layout() {
        let seq = trial_timing_sequence(2100, 300, 1234).unwrap();
        let bytes: Vec<u8> = seq.iter().map(|b| b.byte()).collect();

        assert_eq!(
            bytes,
            vec![0x01, 2100 % 256, 2100 / 256, 0x20, 44, 1, 1234 % 256, 1234 / 256, 0x02]
                .into_iter()
                .map(|v| v as u8)
                .collect::<Vec<u8>>()
        );
        assert!(matches!(seq[0], WireByte::Command(Command::MailTout)));
        assert!(matches!(seq[1], WireByte::Data(_)));
        assert!(matches!(seq[3], WireByte::Command(Command::CrossModel)));
        assert!(matches!(seq[8], WireByte::Command(Command::EnableExtInt0)));
    }

    #[test]
    fn out_of_range_timings() {
        assert_eq!(
            trial_timing_sequence(-1, 0, 0),
            Err((TimingField::ReactionTimeout, -1))
        );
        assert_eq!(
            trial_timing_sequence(0, 70000, 0),
            Err((TimingField::MonitorOn, 70000))
        );
        assert_eq!(split_millis(TimingField::MonitorOff, 65535), Ok((255, 255)));
        assert_eq!(split_millis(TimingField::MonitorOff, 0), Ok((0, 0)));
    }
}
