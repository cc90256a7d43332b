use crate::bridge::TaskId;
use crate::packet::{CmdPacket, PacketError, ServicePort};

/// Subservice codes understood by the general command interpreter. The set
/// is closed: anything else is an illegal subservice, never a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Subservice {
    Reboot = 0,
    SetTaskDelay = 1,
    GetTaskDelay = 2,
    GetTaskList = 3,
    GetTaskWatermark = 4,
}

impl Subservice {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Subservice::Reboot),
            1 => Some(Subservice::SetTaskDelay),
            2 => Some(Subservice::GetTaskDelay),
            3 => Some(Subservice::GetTaskList),
            4 => Some(Subservice::GetTaskWatermark),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Valid reboot targets. The selector byte on the wire is the ASCII
/// letter; everything outside this set is rejected before any action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPartition {
    Application,
    Bootloader,
    Golden,
}

impl RebootPartition {
    pub const fn selector(self) -> u8 {
        match self {
            RebootPartition::Application => b'A',
            RebootPartition::Bootloader => b'B',
            RebootPartition::Golden => b'G',
        }
    }

    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            b'A' => Some(RebootPartition::Application),
            b'B' => Some(RebootPartition::Bootloader),
            b'G' => Some(RebootPartition::Golden),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    EmptyPacket,
    IllegalSubservice(u8),
    ShortPayload { subservice: Subservice, need: usize, got: usize },
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::EmptyPacket => write!(f, "Empty command packet"),
            DecodeError::IllegalSubservice(code) => {
                write!(f, "No such subservice: {}", code)
            }
            DecodeError::ShortPayload { subservice, need, got } => write!(
                f,
                "Short payload for {:?}: need {} bytes, got {}",
                subservice, need, got
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decoded general command. One variant per subservice; decoding is the
/// only place raw payload offsets are touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralCommand {
    Reboot { selector: u8 },
    SetTaskDelay { task: TaskId, delay_ms: u32 },
    GetTaskDelay { task: TaskId },
    GetTaskList,
    GetTaskWatermark { task: TaskId },
}

impl GeneralCommand {
    pub fn decode(packet: &CmdPacket) -> Result<Self, DecodeError> {
        let code = packet.subservice().ok_or(DecodeError::EmptyPacket)?;
        let subservice = Subservice::from_code(code).ok_or(DecodeError::IllegalSubservice(code))?;
        let input = packet.in_data();

        let short = |need: usize| DecodeError::ShortPayload {
            subservice,
            need,
            got: input.len(),
        };

        match subservice {
            Subservice::Reboot => {
                let selector = *input.first().ok_or_else(|| short(1))?;
                Ok(GeneralCommand::Reboot { selector })
            }
            Subservice::SetTaskDelay => {
                let task = read_u32_le(input, 0).ok_or_else(|| short(8))?;
                let delay_ms = read_u32_le(input, 4).ok_or_else(|| short(8))?;
                Ok(GeneralCommand::SetTaskDelay {
                    task: TaskId(task),
                    delay_ms,
                })
            }
            Subservice::GetTaskDelay => {
                let task = read_u32_le(input, 0).ok_or_else(|| short(4))?;
                Ok(GeneralCommand::GetTaskDelay { task: TaskId(task) })
            }
            Subservice::GetTaskList => Ok(GeneralCommand::GetTaskList),
            Subservice::GetTaskWatermark => {
                let task = read_u32_le(input, 0).ok_or_else(|| short(4))?;
                Ok(GeneralCommand::GetTaskWatermark { task: TaskId(task) })
            }
        }
    }

    pub fn subservice(&self) -> Subservice {
        match self {
            GeneralCommand::Reboot { .. } => Subservice::Reboot,
            GeneralCommand::SetTaskDelay { .. } => Subservice::SetTaskDelay,
            GeneralCommand::GetTaskDelay { .. } => Subservice::GetTaskDelay,
            GeneralCommand::GetTaskList => Subservice::GetTaskList,
            GeneralCommand::GetTaskWatermark { .. } => Subservice::GetTaskWatermark,
        }
    }

    /// Encode this command as a request packet for the general port.
    /// Used by the ground client and by tests; the node never builds one.
    pub fn to_request(&self) -> Result<CmdPacket, PacketError> {
        let mut payload = [0u8; 8];
        let payload: &[u8] = match *self {
            GeneralCommand::Reboot { selector } => {
                payload[0] = selector;
                &payload[..1]
            }
            GeneralCommand::SetTaskDelay { task, delay_ms } => {
                payload[..4].copy_from_slice(&task.0.to_le_bytes());
                payload[4..8].copy_from_slice(&delay_ms.to_le_bytes());
                &payload[..8]
            }
            GeneralCommand::GetTaskDelay { task } | GeneralCommand::GetTaskWatermark { task } => {
                payload[..4].copy_from_slice(&task.0.to_le_bytes());
                &payload[..4]
            }
            GeneralCommand::GetTaskList => &[],
        };
        CmdPacket::request(
            ServicePort::General.number(),
            self.subservice().code(),
            payload,
        )
    }
}

fn read_u32_le(input: &[u8], at: usize) -> Option<u32> {
    let bytes = input.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
