use crate::bridge::{TaskBridge, MAX_TASK_NAME_LEN};
use crate::link::PacketListener;
use crate::packet::{CmdPacket, PacketError};
use crate::subservice::{DecodeError, GeneralCommand, RebootPartition};
use arrayvec::ArrayString;
use core::fmt::Write as _;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

// One task-list line: 10-digit zero-padded handle, space, name, CRLF.
const TASK_LIST_LINE_MAX: usize = 10 + 1 + MAX_TASK_NAME_LEN + 2;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    #[error("command rejected: {0}")]
    Decode(#[from] DecodeError),
    #[error("reply encoding failed: {0}")]
    Encode(#[from] PacketError),
}

/// What the session loop must do with an executed packet. Reboot is split
/// out so the acknowledgement is on the wire before the bridge call fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply,
    ReplyThenReboot(RebootPartition),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GeneralStats {
    pub commands_ok: u32,
    pub command_failures: u32,
    pub illegal_packets: u32,
    pub list_truncations: u32,
    pub reboots_requested: u32,
}

/// The general command interpreter: decodes one subservice per packet,
/// performs the privileged operation through the task bridge, and encodes
/// the reply in place in the request buffer.
#[derive(Debug)]
pub struct GeneralService<B> {
    bridge: B,
    stats: GeneralStats,
}

impl<B: TaskBridge> GeneralService<B> {
    pub fn new(bridge: B) -> Self {
        Self {
            bridge,
            stats: GeneralStats::default(),
        }
    }

    pub fn stats(&self) -> GeneralStats {
        self.stats
    }

    /// Counters as one JSON object, for the per-connection stats line.
    pub fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats).unwrap_or_default()
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Execute one command, mutating `packet` into the reply. Per-command
    /// failures become a negative status byte; only an undecodable packet
    /// is an error, and such a packet must be dropped, never echoed back.
    pub fn execute(&mut self, packet: &mut CmdPacket) -> Result<CommandOutcome, ServiceError> {
        let command = match GeneralCommand::decode(packet) {
            Ok(command) => command,
            Err(e) => {
                self.stats.illegal_packets += 1;
                return Err(e.into());
            }
        };

        match command {
            GeneralCommand::Reboot { selector } => {
                // Validation strictly precedes the irreversible action,
                // and the action itself is deferred until the caller has
                // sent the acknowledgement.
                match RebootPartition::from_selector(selector) {
                    Some(partition) => {
                        packet.finish_reply(0, 0)?;
                        self.stats.commands_ok += 1;
                        Ok(CommandOutcome::ReplyThenReboot(partition))
                    }
                    None => {
                        debug!(selector, "invalid reboot selector");
                        packet.finish_reply(-1, 0)?;
                        self.stats.command_failures += 1;
                        Ok(CommandOutcome::Reply)
                    }
                }
            }

            GeneralCommand::SetTaskDelay { task, delay_ms } => {
                if self.bridge.set_task_delay(task, delay_ms) {
                    packet.finish_reply(0, 0)?;
                    self.stats.commands_ok += 1;
                } else {
                    packet.finish_reply(-1, 0)?;
                    self.stats.command_failures += 1;
                }
                Ok(CommandOutcome::Reply)
            }

            GeneralCommand::GetTaskDelay { task } => {
                // The bridge reports a zero sentinel for unknown handles;
                // this path never fails.
                let delay_ms = self.bridge.task_delay(task);
                packet.write_out(&delay_ms.to_le_bytes())?;
                packet.finish_reply(0, 4)?;
                self.stats.commands_ok += 1;
                Ok(CommandOutcome::Reply)
            }

            GeneralCommand::GetTaskList => {
                let snapshot = self.bridge.task_snapshot();
                let total = snapshot.len();
                let mut serialized = 0usize;
                let written = {
                    let mut writer = packet.reply_writer();
                    for task in &snapshot {
                        let mut line = ArrayString::<TASK_LIST_LINE_MAX>::new();
                        // Line length is bounded by construction.
                        let _ = write!(
                            line,
                            "{:010} {:.prec$}\r\n",
                            task.id.0,
                            task.name.as_str(),
                            prec = MAX_TASK_NAME_LEN
                        );
                        if writer.write_all(line.as_bytes()).is_err() {
                            // Out of capacity: end the enumeration at the
                            // entry boundary, never emit a partial line.
                            break;
                        }
                        serialized += 1;
                    }
                    writer.written()
                };
                if serialized < total {
                    self.stats.list_truncations += 1;
                    warn!(serialized, total, "task list truncated to packet capacity");
                }
                packet.finish_reply(0, written)?;
                self.stats.commands_ok += 1;
                Ok(CommandOutcome::Reply)
            }

            GeneralCommand::GetTaskWatermark { task } => {
                let watermark = self.bridge.task_watermark(task);
                packet.write_out(&watermark.to_le_bytes())?;
                packet.finish_reply(0, 4)?;
                self.stats.commands_ok += 1;
                Ok(CommandOutcome::Reply)
            }
        }
    }

    /// Accept loop on the general command port. Session states:
    /// listening -> connected -> (processing -> connected)* -> closed,
    /// then back to listening. An accept timeout stays in listening;
    /// exhausting reads closes the connection.
    pub async fn run(mut self, listener: PacketListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "general command service listening");
        }
        loop {
            let mut conn = match listener.accept().await {
                Ok(Some(conn)) => conn,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "general service accept failed");
                    continue;
                }
            };
            debug!(peer = %conn.peer_addr(), "general service connection up");

            while let Some(mut packet) = conn.read_packet().await {
                match self.execute(&mut packet) {
                    Ok(outcome) => {
                        let reboot = match outcome {
                            CommandOutcome::ReplyThenReboot(partition) => Some(partition),
                            CommandOutcome::Reply => None,
                        };
                        if let Err(e) = conn.send_packet(packet).await {
                            warn!(error = %e, "reply send failed, packet released");
                            if reboot.is_some() {
                                // Invariant: no reboot without a delivered
                                // acknowledgement.
                                warn!("reboot acknowledgement undelivered, reboot withheld");
                            }
                            continue;
                        }
                        if let Some(partition) = reboot {
                            info!(?partition, "reboot acknowledged, handing off to scheduler");
                            self.stats.reboots_requested += 1;
                            self.bridge.reboot(partition);
                        }
                    }
                    Err(e) => {
                        // Dropped without a reply; the release happens
                        // here, exactly once.
                        warn!(peer = %conn.peer_addr(), error = %e, "packet dropped");
                    }
                }
            }
            info!(peer = %conn.peer_addr(), stats = %self.stats_json(), "general service connection exhausted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{SimScheduler, TaskId};
    use crate::packet::{OUT_DATA_BYTE, PACKET_DATA_SIZE, REPLY_OVERHEAD};
    use crate::subservice::Subservice;

    fn service() -> GeneralService<SimScheduler> {
        GeneralService::new(SimScheduler::with_flight_tasks())
    }

    #[test]
    fn test_reboot_valid_selector_defers_action() {
        let mut svc = service();
        let mut packet = GeneralCommand::Reboot { selector: b'A' }.to_request().unwrap();

        let outcome = svc.execute(&mut packet).unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::ReplyThenReboot(RebootPartition::Application)
        );
        assert_eq!(packet.status(), Some(0));
        assert_eq!(packet.len(), REPLY_OVERHEAD);
        // The acknowledgement exists but nothing has rebooted yet.
        assert_eq!(svc.bridge().reboot_target(), None);
    }

    #[test]
    fn test_reboot_invalid_selector_rejected() {
        let mut svc = service();
        let mut packet = GeneralCommand::Reboot { selector: b'Z' }.to_request().unwrap();

        let outcome = svc.execute(&mut packet).unwrap();
        assert_eq!(outcome, CommandOutcome::Reply);
        assert_eq!(packet.status(), Some(-1));
        assert_eq!(svc.bridge().reboot_target(), None);
        assert_eq!(svc.stats().command_failures, 1);
    }

    #[test]
    fn test_set_then_get_task_delay_roundtrip() {
        let mut svc = service();

        let mut set = GeneralCommand::SetTaskDelay {
            task: TaskId(3),
            delay_ms: 7500,
        }
        .to_request()
        .unwrap();
        assert_eq!(svc.execute(&mut set).unwrap(), CommandOutcome::Reply);
        assert_eq!(set.status(), Some(0));
        assert_eq!(set.len(), REPLY_OVERHEAD);

        let mut get = GeneralCommand::GetTaskDelay { task: TaskId(3) }.to_request().unwrap();
        assert_eq!(svc.execute(&mut get).unwrap(), CommandOutcome::Reply);
        assert_eq!(get.status(), Some(0));
        assert_eq!(get.len(), REPLY_OVERHEAD + 4);
        assert_eq!(get.out_data(), &7500u32.to_le_bytes());
    }

    #[test]
    fn test_set_task_delay_unknown_handle() {
        let mut svc = service();
        let mut packet = GeneralCommand::SetTaskDelay {
            task: TaskId(404),
            delay_ms: 10,
        }
        .to_request()
        .unwrap();
        svc.execute(&mut packet).unwrap();
        assert_eq!(packet.status(), Some(-1));
    }

    #[test]
    fn test_get_task_delay_unknown_handle_still_succeeds() {
        // Heritage behavior: the read path does not validate the handle,
        // it just reports the bridge's sentinel.
        let mut svc = service();
        let mut packet = GeneralCommand::GetTaskDelay { task: TaskId(404) }.to_request().unwrap();
        svc.execute(&mut packet).unwrap();
        assert_eq!(packet.status(), Some(0));
        assert_eq!(packet.out_data(), &0u32.to_le_bytes());
    }

    #[test]
    fn test_get_task_watermark() {
        let mut svc = service();
        let mut packet = GeneralCommand::GetTaskWatermark { task: TaskId(5) }.to_request().unwrap();
        svc.execute(&mut packet).unwrap();
        assert_eq!(packet.status(), Some(0));
        assert_eq!(packet.out_data(), &300u32.to_le_bytes());
    }

    #[test]
    fn test_task_list_lines_parse_back() {
        let mut svc = service();
        let expected = svc.bridge().task_count();
        let mut packet = GeneralCommand::GetTaskList.to_request().unwrap();
        svc.execute(&mut packet).unwrap();
        assert_eq!(packet.status(), Some(0));

        let text = core::str::from_utf8(packet.out_data()).unwrap();
        assert!(text.ends_with("\r\n"));
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), expected);

        for line in lines {
            let (handle, name) = line.split_once(' ').unwrap();
            assert_eq!(handle.len(), 10);
            let id: u32 = handle.parse().unwrap();
            assert!(id >= 1 && id <= expected as u32);
            assert!(!name.is_empty() && name.len() <= MAX_TASK_NAME_LEN);
        }
        assert_eq!(svc.stats().list_truncations, 0);
    }

    #[test]
    fn test_task_list_truncates_at_entry_boundary() {
        let mut sched = SimScheduler::new();
        for i in 0..32u32 {
            // 7-char names make every line exactly 20 bytes.
            assert!(sched.spawn_task(TaskId(i + 1), &format!("task_{:02}", i), 100, 64));
        }
        let mut svc = GeneralService::new(sched);

        let line_len = 10 + 1 + 7 + 2;
        let fits = (PACKET_DATA_SIZE - OUT_DATA_BYTE) / line_len;
        assert!(fits < 32, "straddle case requires overflow");

        let mut packet = GeneralCommand::GetTaskList.to_request().unwrap();
        svc.execute(&mut packet).unwrap();

        assert_eq!(packet.status(), Some(0));
        assert_eq!(packet.out_data().len(), fits * line_len);
        let text = core::str::from_utf8(packet.out_data()).unwrap();
        assert!(text.ends_with("\r\n"), "no partial trailing line");
        assert_eq!(text.matches("\r\n").count(), fits);
        assert_eq!(svc.stats().list_truncations, 1);
    }

    #[test]
    fn test_illegal_subservice_mutates_nothing() {
        let mut svc = service();
        let before = svc.bridge().task_delay(TaskId(2));

        let mut packet = CmdPacket::request(11, 77, &[1, 2, 3, 4]).unwrap();
        let err = svc.execute(&mut packet).unwrap_err();
        assert_eq!(err, ServiceError::Decode(DecodeError::IllegalSubservice(77)));

        // The request is untouched and the scheduler unchanged.
        assert_eq!(packet.subservice(), Some(77));
        assert_eq!(packet.in_data(), &[1, 2, 3, 4]);
        assert_eq!(svc.bridge().task_delay(TaskId(2)), before);
        assert_eq!(svc.stats().illegal_packets, 1);
    }

    #[test]
    fn test_stats_line_reflects_command_outcomes() {
        let mut svc = service();

        let mut ok = GeneralCommand::GetTaskList.to_request().unwrap();
        svc.execute(&mut ok).unwrap();
        let mut bad = CmdPacket::request(11, 99, &[]).unwrap();
        svc.execute(&mut bad).unwrap_err();

        // The emitted per-connection stats line carries the counters.
        let line = svc.stats_json();
        assert!(line.contains("\"commands_ok\":1"), "line: {line}");
        assert!(line.contains("\"illegal_packets\":1"), "line: {line}");
        assert!(line.contains("\"reboots_requested\":0"), "line: {line}");
    }

    #[test]
    fn test_short_payload_rejected() {
        let mut svc = service();
        let mut packet =
            CmdPacket::request(11, Subservice::SetTaskDelay.code(), &[1, 2, 3]).unwrap();
        assert!(matches!(
            svc.execute(&mut packet).unwrap_err(),
            ServiceError::Decode(DecodeError::ShortPayload { .. })
        ));
    }
}
