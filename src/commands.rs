//! Command identifiers, the static command registry, and the in-flight
//! `Command` object with its reply accumulation and completion predicate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use semver::Version;
use tokio::sync::watch;
use tracing::warn;

use crate::codec;

/// Size of the wire uid space (6 bits in the arbitration identifier).
pub const UID_POOL_SIZE: usize = 64;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Command identifiers understood by the positioner firmware.
///
/// The numeric values travel on the wire and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandID {
    GetId = 1,
    GetFirmwareVersion = 2,
    GetStatus = 3,
    SendNewTrajectory = 10,
    SendTrajectoryData = 11,
    TrajectoryTransmissionAbort = 12,
    StartTrajectory = 13,
    StopTrajectory = 14,
    SendTrajectoryAbort = 15,
    GoToDatums = 20,
    GoToDatumAlpha = 21,
    GoToDatumBeta = 22,
    GotoAlpha = 30,
    GotoBeta = 31,
    GotoRelativeAlpha = 32,
    GotoRelativeBeta = 33,
    GetActualPosition = 34,
    SetActualPosition = 35,
    SetSpeed = 40,
    AlphaClosedLoopCollisionDetection = 50,
    AlphaClosedLoopWithoutCollisionDetection = 51,
    BetaClosedLoopCollisionDetection = 52,
    BetaClosedLoopWithoutCollisionDetection = 53,
    AlphaOpenLoopWithoutCollisionDetection = 54,
    BetaOpenLoopWithoutCollisionDetection = 55,
    SwitchOnPreciseMoveAlpha = 60,
    SwitchOffPreciseMoveAlpha = 61,
    SwitchOnPreciseMoveBeta = 62,
    SwitchOffPreciseMoveBeta = 63,
}

impl CommandID {
    pub fn from_u8(value: u8) -> Option<CommandID> {
        use CommandID::*;
        Some(match value {
            1 => GetId,
            2 => GetFirmwareVersion,
            3 => GetStatus,
            10 => SendNewTrajectory,
            11 => SendTrajectoryData,
            12 => TrajectoryTransmissionAbort,
            13 => StartTrajectory,
            14 => StopTrajectory,
            15 => SendTrajectoryAbort,
            20 => GoToDatums,
            21 => GoToDatumAlpha,
            22 => GoToDatumBeta,
            30 => GotoAlpha,
            31 => GotoBeta,
            32 => GotoRelativeAlpha,
            33 => GotoRelativeBeta,
            34 => GetActualPosition,
            35 => SetActualPosition,
            40 => SetSpeed,
            50 => AlphaClosedLoopCollisionDetection,
            51 => AlphaClosedLoopWithoutCollisionDetection,
            52 => BetaClosedLoopCollisionDetection,
            53 => BetaClosedLoopWithoutCollisionDetection,
            54 => AlphaOpenLoopWithoutCollisionDetection,
            55 => BetaOpenLoopWithoutCollisionDetection,
            60 => SwitchOnPreciseMoveAlpha,
            61 => SwitchOffPreciseMoveAlpha,
            62 => SwitchOnPreciseMoveBeta,
            63 => SwitchOffPreciseMoveBeta,
            _ => return None,
        })
    }

    /// Static per-command attributes (the command registry).
    pub const fn descriptor(self) -> CommandDescriptor {
        use CommandID::*;
        match self {
            GetId | GetFirmwareVersion | GetStatus | GetActualPosition => CommandDescriptor {
                safe: true,
                move_command: false,
                bootloader: true,
                broadcastable: true,
                default_timeout: DEFAULT_TIMEOUT,
            },
            StopTrajectory | SendTrajectoryAbort | TrajectoryTransmissionAbort => {
                CommandDescriptor {
                    safe: true,
                    move_command: false,
                    bootloader: false,
                    broadcastable: true,
                    default_timeout: DEFAULT_TIMEOUT,
                }
            }
            StartTrajectory => CommandDescriptor {
                safe: false,
                move_command: true,
                bootloader: false,
                broadcastable: true,
                default_timeout: MOVE_TIMEOUT,
            },
            GoToDatums | GoToDatumAlpha | GoToDatumBeta | GotoAlpha | GotoBeta
            | GotoRelativeAlpha | GotoRelativeBeta => CommandDescriptor {
                safe: false,
                move_command: true,
                bootloader: false,
                broadcastable: false,
                default_timeout: MOVE_TIMEOUT,
            },
            SendNewTrajectory | SendTrajectoryData => CommandDescriptor {
                safe: false,
                move_command: false,
                bootloader: false,
                broadcastable: false,
                default_timeout: MOVE_TIMEOUT,
            },
            SetActualPosition | SetSpeed | AlphaClosedLoopCollisionDetection
            | AlphaClosedLoopWithoutCollisionDetection | BetaClosedLoopCollisionDetection
            | BetaClosedLoopWithoutCollisionDetection | AlphaOpenLoopWithoutCollisionDetection
            | BetaOpenLoopWithoutCollisionDetection | SwitchOnPreciseMoveAlpha
            | SwitchOffPreciseMoveAlpha | SwitchOnPreciseMoveBeta | SwitchOffPreciseMoveBeta => {
                CommandDescriptor {
                    safe: false,
                    move_command: false,
                    bootloader: false,
                    broadcastable: false,
                    default_timeout: DEFAULT_TIMEOUT,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Allowed while the FPS is locked.
    pub safe: bool,
    /// Causes mechanical motion.
    pub move_command: bool,
    /// Allowed while the fleet is in bootloader mode.
    pub bootloader: bool,
    pub broadcastable: bool,
    pub default_timeout: Duration,
}

/// Firmware response codes (4 bits in the arbitration identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    CommandAccepted = 0,
    ValueOutOfRange = 1,
    InvalidTrajectory = 2,
    AlreadyInMotion = 3,
    DatumNotCalibrated = 4,
    IncorrectAmountOfData = 5,
    CalibrationModeActive = 6,
    MotorNotCalibrated = 7,
    NotInitialized = 8,
    InvalidBroadcastCommand = 9,
    InvalidBootloaderCommand = 10,
    InvalidCommand = 11,
    UnknownCommand = 12,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Option<ResponseCode> {
        use ResponseCode::*;
        Some(match value {
            0 => CommandAccepted,
            1 => ValueOutOfRange,
            2 => InvalidTrajectory,
            3 => AlreadyInMotion,
            4 => DatumNotCalibrated,
            5 => IncorrectAmountOfData,
            6 => CalibrationModeActive,
            7 => MotorNotCalibrated,
            8 => NotInitialized,
            9 => InvalidBroadcastCommand,
            10 => InvalidBootloaderCommand,
            11 => InvalidCommand,
            12 => UnknownCommand,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::CommandAccepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ready,
    Running,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl CommandStatus {
    /// Terminal states.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            CommandStatus::Done
                | CommandStatus::Failed
                | CommandStatus::TimedOut
                | CommandStatus::Cancelled
        )
    }

    pub fn succeeded(self) -> bool {
        self == CommandStatus::Done
    }

    pub fn failed(self) -> bool {
        self == CommandStatus::Failed
    }

    pub fn timed_out(self) -> bool {
        self == CommandStatus::TimedOut
    }
}

/// A decoded reply frame, tagged with the interface it arrived on.
#[derive(Debug, Clone)]
pub struct Reply {
    pub positioner_id: u16,
    pub command_id: CommandID,
    pub uid: u8,
    pub response_code: ResponseCode,
    pub data: Vec<u8>,
    pub interface: usize,
    pub bus: Option<usize>,
}

#[derive(Debug, Default)]
struct CommandInner {
    replies: Vec<Reply>,
}

/// A single in-flight request.
///
/// Created by `Fps::send_command`, serialised to frames by the dispatcher,
/// completed when its replies arrive or its timeout fires. Await `wait()`
/// for the terminal status.
#[derive(Debug)]
pub struct Command {
    command_id: CommandID,
    positioner_ids: Vec<u16>,
    data: Vec<u8>,
    timeout: Option<Duration>,
    n_positioners: Option<usize>,
    tolerant: bool,
    wire_uid: AtomicU8,
    inner: Mutex<CommandInner>,
    status_tx: watch::Sender<CommandStatus>,
    last_reply: Mutex<Option<Instant>>,
    created: Instant,
}

impl Command {
    pub fn new(command_id: CommandID, positioner_ids: Vec<u16>) -> Command {
        let (status_tx, _) = watch::channel(CommandStatus::Ready);
        Command {
            command_id,
            positioner_ids,
            data: Vec::new(),
            timeout: None,
            n_positioners: None,
            tolerant: false,
            wire_uid: AtomicU8::new(0),
            inner: Mutex::new(CommandInner::default()),
            status_tx,
            last_reply: Mutex::new(None),
            created: Instant::now(),
        }
    }

    pub fn broadcast(command_id: CommandID) -> Command {
        Command::new(command_id, vec![0])
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Command {
        self.data = data;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Command {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_n_positioners(mut self, n: usize) -> Command {
        self.n_positioners = Some(n);
        self
    }

    /// A tolerant command does not fail on non-OK response codes.
    pub fn tolerant(mut self) -> Command {
        self.tolerant = true;
        self
    }

    pub fn command_id(&self) -> CommandID {
        self.command_id
    }

    pub fn positioner_ids(&self) -> &[u16] {
        &self.positioner_ids
    }

    /// Fills in the default positioner set before dispatch.
    pub(crate) fn set_positioner_ids(&mut self, positioner_ids: Vec<u16>) {
        self.positioner_ids = positioner_ids;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn descriptor(&self) -> CommandDescriptor {
        self.command_id.descriptor()
    }

    pub fn is_broadcast(&self) -> bool {
        self.positioner_ids == [0]
    }

    pub fn n_positioners(&self) -> Option<usize> {
        self.n_positioners
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.descriptor().default_timeout)
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    /// Wire uid, assigned by the dispatcher at dispatch time.
    pub fn uid(&self) -> u8 {
        self.wire_uid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_uid(&self, uid: u8) {
        self.wire_uid.store(uid, Ordering::Relaxed);
    }

    pub(crate) fn mark_running(&self) {
        self.status_tx.send_if_modified(|status| {
            if *status == CommandStatus::Ready {
                *status = CommandStatus::Running;
                true
            } else {
                false
            }
        });
    }

    /// Frames this command occupies per addressed positioner.
    pub fn frames_per_positioner(&self) -> usize {
        codec::frame_count(self.data.len())
    }

    /// Total replies needed for completion, or `None` when the population is
    /// unknown (broadcast discovery, completed by quiescence).
    pub fn expected_replies(&self) -> Option<usize> {
        let per_positioner = self.frames_per_positioner();
        if self.is_broadcast() {
            self.n_positioners.map(|n| n * per_positioner)
        } else {
            Some(self.positioner_ids.len() * per_positioner)
        }
    }

    /// Appends a reply; returns `false` for replies from positioners this
    /// command never addressed.
    pub(crate) fn add_reply(&self, reply: Reply) -> bool {
        if !self.is_broadcast() && !self.positioner_ids.contains(&reply.positioner_id) {
            return false;
        }
        *self.last_reply.lock().unwrap() = Some(Instant::now());
        self.inner.lock().unwrap().replies.push(reply);
        true
    }

    pub(crate) fn last_reply_at(&self) -> Option<Instant> {
        *self.last_reply.lock().unwrap()
    }

    /// Evaluates the completion predicate against the replies received so
    /// far. `None` means the command is still pending.
    pub fn check_complete(&self) -> Option<CommandStatus> {
        let inner = self.inner.lock().unwrap();

        if !self.tolerant {
            if let Some(bad) = inner.replies.iter().find(|r| !r.response_code.is_ok()) {
                warn!(
                    command = ?self.command_id,
                    positioner_id = bad.positioner_id,
                    code = ?bad.response_code,
                    "command rejected by firmware"
                );
                return Some(CommandStatus::Failed);
            }
        }

        match self.expected_replies() {
            Some(expected) if inner.replies.len() >= expected => Some(CommandStatus::Done),
            _ => None,
        }
    }

    /// Moves the command to a terminal status. The first terminal status
    /// wins; returns whether this call was the one that finished it.
    pub(crate) fn finish(&self, status: CommandStatus) -> bool {
        debug_assert!(status.is_done());
        let mut finished = false;
        self.status_tx.send_if_modified(|current| {
            if current.is_done() {
                false
            } else {
                *current = status;
                finished = true;
                true
            }
        });
        finished
    }

    /// Cancels the command, completing any waiters.
    pub fn cancel(&self, silent: bool) {
        if self.finish(CommandStatus::Cancelled) && !silent {
            warn!(command = ?self.command_id, uid = self.uid(), "command cancelled");
        }
    }

    pub fn status(&self) -> CommandStatus {
        *self.status_tx.borrow()
    }

    /// Waits until the command reaches a terminal status.
    pub async fn wait(&self) -> CommandStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_done() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.inner.lock().unwrap().replies.clone()
    }

    /// Firmware versions keyed by positioner, for `GET_FIRMWARE_VERSION`.
    pub fn firmware_versions(&self) -> HashMap<u16, Version> {
        self.replies()
            .iter()
            .filter_map(|r| Some((r.positioner_id, parse_firmware_payload(&r.data)?)))
            .collect()
    }

    /// Raw status words keyed by positioner, for `GET_STATUS`.
    pub fn positioner_status(&self) -> HashMap<u16, u32> {
        self.replies()
            .iter()
            .filter_map(|r| Some((r.positioner_id, parse_status_payload(&r.data)?)))
            .collect()
    }

    /// `(alpha, beta)` keyed by positioner, for `GET_ACTUAL_POSITION`.
    pub fn positions(&self) -> HashMap<u16, (f64, f64)> {
        self.replies()
            .iter()
            .filter_map(|r| Some((r.positioner_id, parse_position_payload(&r.data)?)))
            .collect()
    }
}

/// Allocator for the 6-bit wire uid space of one command id.
///
/// A uid is only recycled once the command that owns it has left the
/// dispatcher's tracking map, so late replies cannot be misattributed.
#[derive(Debug, Default)]
pub struct UidPool {
    in_use: u64,
    next: u8,
}

impl UidPool {
    pub fn acquire(&mut self) -> Option<u8> {
        for _ in 0..UID_POOL_SIZE {
            let candidate = self.next;
            self.next = (self.next + 1) % UID_POOL_SIZE as u8;
            if self.in_use & (1 << candidate) == 0 {
                self.in_use |= 1 << candidate;
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&mut self, uid: u8) {
        self.in_use &= !(1 << uid);
    }

    pub fn available(&self) -> usize {
        UID_POOL_SIZE - self.in_use.count_ones() as usize
    }
}

/// Output degrees per second per RPM of commanded motor speed, through the
/// gearbox. Fixed by the positioner hardware.
pub const RPM_TO_DEG_PER_SEC: f64 = 0.1;

// Wire payload helpers. All scalars are big-endian; angles travel as i32
// millidegrees, times as u32 milliseconds, speeds as u32 RPM.

pub fn millidegrees(degrees: f64) -> i32 {
    (degrees * 1000.0).round() as i32
}

pub fn degrees(millidegrees: i32) -> f64 {
    f64::from(millidegrees) / 1000.0
}

pub fn angle_payload(angle: f64) -> Vec<u8> {
    millidegrees(angle).to_be_bytes().to_vec()
}

pub fn parse_angle_payload(data: &[u8]) -> Option<f64> {
    let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(degrees(i32::from_be_bytes(raw)))
}

pub fn position_payload(alpha: f64, beta: f64) -> Vec<u8> {
    let mut payload = angle_payload(alpha);
    payload.extend_from_slice(&angle_payload(beta));
    payload
}

pub fn parse_position_payload(data: &[u8]) -> Option<(f64, f64)> {
    Some((parse_angle_payload(data)?, parse_angle_payload(data.get(4..)?)?))
}

pub fn status_payload(bits: u32) -> Vec<u8> {
    bits.to_be_bytes().to_vec()
}

pub fn parse_status_payload(data: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

pub fn firmware_payload(version: &Version) -> Vec<u8> {
    vec![version.major as u8, version.minor as u8, version.patch as u8]
}

pub fn parse_firmware_payload(data: &[u8]) -> Option<Version> {
    let raw: [u8; 3] = data.get(..3)?.try_into().ok()?;
    Some(Version::new(
        u64::from(raw[0]),
        u64::from(raw[1]),
        u64::from(raw[2]),
    ))
}

pub fn speed_payload(alpha_rpm: u32, beta_rpm: u32) -> Vec<u8> {
    let mut payload = alpha_rpm.to_be_bytes().to_vec();
    payload.extend_from_slice(&beta_rpm.to_be_bytes());
    payload
}

pub fn parse_speed_payload(data: &[u8]) -> Option<(u32, u32)> {
    let alpha: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let beta: [u8; 4] = data.get(4..8)?.try_into().ok()?;
    Some((u32::from_be_bytes(alpha), u32::from_be_bytes(beta)))
}

pub fn trajectory_counts_payload(n_alpha: u32, n_beta: u32) -> Vec<u8> {
    let mut payload = n_alpha.to_be_bytes().to_vec();
    payload.extend_from_slice(&n_beta.to_be_bytes());
    payload
}

pub fn parse_trajectory_counts(data: &[u8]) -> Option<(u32, u32)> {
    let n_alpha: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let n_beta: [u8; 4] = data.get(4..8)?.try_into().ok()?;
    Some((u32::from_be_bytes(n_alpha), u32::from_be_bytes(n_beta)))
}

pub fn trajectory_point_bytes(position: f64, time_s: f64) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&millidegrees(position).to_be_bytes());
    bytes[4..].copy_from_slice(&((time_s * 1000.0).round() as u32).to_be_bytes());
    bytes
}

pub fn parse_trajectory_point(data: &[u8]) -> Option<(f64, f64)> {
    let position: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let time: [u8; 4] = data.get(4..8)?.try_into().ok()?;
    Some((
        degrees(i32::from_be_bytes(position)),
        f64::from(u32::from_be_bytes(time)) / 1000.0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(pid: u16, code: ResponseCode) -> Reply {
        Reply {
            positioner_id: pid,
            command_id: CommandID::GetStatus,
            uid: 0,
            response_code: code,
            data: Vec::new(),
            interface: 0,
            bus: None,
        }
    }

    #[test]
    fn test_registry_flags() {
        assert!(CommandID::GetStatus.descriptor().safe);
        assert!(CommandID::GetStatus.descriptor().bootloader);
        assert!(CommandID::StopTrajectory.descriptor().safe);
        assert!(!CommandID::StopTrajectory.descriptor().bootloader);
        assert!(CommandID::GotoAlpha.descriptor().move_command);
        assert!(!CommandID::GotoAlpha.descriptor().broadcastable);
        assert!(CommandID::StartTrajectory.descriptor().move_command);
        assert!(!CommandID::SendTrajectoryData.descriptor().safe);
    }

    #[test]
    fn test_command_id_round_trip() {
        for raw in 0..=255u8 {
            if let Some(id) = CommandID::from_u8(raw) {
                assert_eq!(id as u8, raw);
            }
        }
        assert_eq!(CommandID::from_u8(99), None);
    }

    #[test]
    fn test_unicast_completion() {
        let command = Command::new(CommandID::GetStatus, vec![4]);
        assert_eq!(command.expected_replies(), Some(1));
        assert!(command.check_complete().is_none());

        assert!(command.add_reply(reply(4, ResponseCode::CommandAccepted)));
        assert_eq!(command.check_complete(), Some(CommandStatus::Done));
    }

    #[test]
    fn test_foreign_reply_rejected() {
        let command = Command::new(CommandID::GetStatus, vec![4]);
        assert!(!command.add_reply(reply(7, ResponseCode::CommandAccepted)));
        assert!(command.check_complete().is_none());
    }

    #[test]
    fn test_multicast_completion_waits_for_all() {
        let command = Command::new(CommandID::GetStatus, vec![1, 2, 3]);
        command.add_reply(reply(1, ResponseCode::CommandAccepted));
        command.add_reply(reply(3, ResponseCode::CommandAccepted));
        assert!(command.check_complete().is_none());
        command.add_reply(reply(2, ResponseCode::CommandAccepted));
        assert_eq!(command.check_complete(), Some(CommandStatus::Done));
    }

    #[test]
    fn test_broadcast_with_known_population() {
        let command = Command::broadcast(CommandID::GetStatus).with_n_positioners(2);
        command.add_reply(reply(1, ResponseCode::CommandAccepted));
        assert!(command.check_complete().is_none());
        command.add_reply(reply(2, ResponseCode::CommandAccepted));
        assert_eq!(command.check_complete(), Some(CommandStatus::Done));
    }

    #[test]
    fn test_broadcast_unknown_population_never_self_completes() {
        let command = Command::broadcast(CommandID::GetFirmwareVersion);
        assert_eq!(command.expected_replies(), None);
        command.add_reply(reply(1, ResponseCode::CommandAccepted));
        assert!(command.check_complete().is_none());
    }

    #[test]
    fn test_non_ok_reply_fails_command() {
        let command = Command::new(CommandID::GotoAlpha, vec![4]);
        command.add_reply(reply(4, ResponseCode::AlreadyInMotion));
        assert_eq!(command.check_complete(), Some(CommandStatus::Failed));
    }

    #[test]
    fn test_tolerant_command_ignores_non_ok() {
        let command = Command::new(CommandID::GetStatus, vec![4]).tolerant();
        command.add_reply(reply(4, ResponseCode::NotInitialized));
        assert_eq!(command.check_complete(), Some(CommandStatus::Done));
    }

    #[test]
    fn test_chunked_command_expects_reply_per_frame() {
        // 3 trajectory points of 8 bytes each: 24 bytes, 4 chunked frames.
        let command =
            Command::new(CommandID::SendTrajectoryData, vec![4]).with_data(vec![0u8; 24]);
        assert_eq!(command.frames_per_positioner(), 4);
        assert_eq!(command.expected_replies(), Some(4));
    }

    #[test]
    fn test_finish_first_terminal_wins() {
        let command = Command::new(CommandID::GetStatus, vec![4]);
        assert!(command.finish(CommandStatus::Done));
        assert!(!command.finish(CommandStatus::TimedOut));
        assert_eq!(command.status(), CommandStatus::Done);
    }

    #[test]
    fn test_uid_pool_recycling() {
        let mut pool = UidPool::default();
        let mut uids = Vec::new();
        for _ in 0..UID_POOL_SIZE {
            uids.push(pool.acquire().expect("pool not exhausted"));
        }
        assert_eq!(pool.acquire(), None);

        pool.release(uids[10]);
        assert_eq!(pool.acquire(), Some(uids[10]));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_payload_round_trips() {
        let payload = position_payload(123.456, 17.0);
        let (alpha, beta) = parse_position_payload(&payload).unwrap();
        assert!((alpha - 123.456).abs() < 1e-3);
        assert!((beta - 17.0).abs() < 1e-3);

        let version = Version::new(4, 2, 1);
        assert_eq!(
            parse_firmware_payload(&firmware_payload(&version)).unwrap(),
            version
        );

        let (position, time) = parse_trajectory_point(&trajectory_point_bytes(90.0, 2.5)).unwrap();
        assert!((position - 90.0).abs() < 1e-3);
        assert!((time - 2.5).abs() < 1e-3);
    }
}
