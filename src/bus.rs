//! Bus interfaces.
//!
//! `BusInterface` abstracts one physical CAN channel (possibly multibus).
//! The only in-tree implementation is `VirtualBus`, a simulated fleet used
//! by the `virtual` profile and the test suite; hardware transports plug in
//! through the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use semver::Version;
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{self, CanFrame, FrameData};
use crate::commands::{self, CommandID, ResponseCode};
use crate::error::{JaegerError, Result};
use crate::maskbits::PositionerStatus;

/// Sends and receives raw CAN frames over one interface.
#[async_trait]
pub trait BusInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Number of buses behind this interface.
    fn num_buses(&self) -> usize {
        1
    }

    /// Writes a frame. `bus = None` addresses every bus of the interface.
    async fn send(&self, bus: Option<usize>, frame: CanFrame) -> Result<()>;

    /// Next incoming frame, or `None` once the interface is disconnected.
    async fn recv(&self) -> Option<(Option<usize>, CanFrame)>;
}

/// Default status word of a healthy, calibrated, idle virtual positioner.
pub fn virtual_idle_status() -> PositionerStatus {
    PositionerStatus::SYSTEM_INITIALIZED
        | PositionerStatus::DISPLACEMENT_COMPLETED
        | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
        | PositionerStatus::DISPLACEMENT_COMPLETED_BETA
        | PositionerStatus::MOTOR_CALIBRATED_ALPHA
        | PositionerStatus::MOTOR_CALIBRATED_BETA
        | PositionerStatus::DATUM_INITIALIZED_ALPHA
        | PositionerStatus::DATUM_INITIALIZED_BETA
}

#[derive(Debug, Clone)]
struct PendingTrajectory {
    n_alpha: usize,
    n_beta: usize,
    alpha: Vec<(f64, f64)>,
    beta: Vec<(f64, f64)>,
}

#[derive(Debug)]
struct VirtualPositioner {
    firmware: Version,
    status: PositionerStatus,
    alpha: f64,
    beta: f64,
    speed: (u32, u32),
    pending: Option<PendingTrajectory>,
    /// Offline simulation: the positioner never answers.
    respond: bool,
    /// Bumped on every stop so stale motion tasks give up.
    move_epoch: u64,
}

impl VirtualPositioner {
    fn new(firmware: Version) -> Self {
        Self {
            firmware,
            status: virtual_idle_status(),
            alpha: 0.0,
            beta: 0.0,
            speed: (1000, 1000),
            pending: None,
            respond: true,
            move_epoch: 0,
        }
    }
}

struct FleetState {
    positioners: Mutex<IndexMap<u16, VirtualPositioner>>,
    host_tx: mpsc::UnboundedSender<(Option<usize>, CanFrame)>,
    uploads: Mutex<HashMap<(u16, u8), Vec<FrameData>>>,
    command_log: Mutex<Vec<(u16, CommandID)>>,
    time_scale: f64,
}

/// A simulated CAN bus with a configurable population of positioners.
pub struct VirtualBus {
    name: String,
    fleet: Arc<FleetState>,
    host_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Option<usize>, CanFrame)>>,
}

impl VirtualBus {
    pub fn new(name: impl Into<String>) -> Self {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            fleet: Arc::new(FleetState {
                positioners: Mutex::new(IndexMap::new()),
                host_tx,
                uploads: Mutex::new(HashMap::new()),
                command_log: Mutex::new(Vec::new()),
                time_scale: 1.0,
            }),
            host_rx: tokio::sync::Mutex::new(host_rx),
        }
    }

    /// Speeds the simulation up (`0.1` runs moves ten times faster).
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        let fleet = Arc::get_mut(&mut self.fleet).expect("bus not started yet");
        fleet.time_scale = time_scale;
        self
    }

    /// Adds positioners `1..=n` with the default firmware.
    pub fn with_positioners(self, n: u16) -> Self {
        for pid in 1..=n {
            self.add_positioner(pid);
        }
        self
    }

    pub fn add_positioner(&self, pid: u16) {
        self.fleet
            .positioners
            .lock()
            .unwrap()
            .insert(pid, VirtualPositioner::new(Version::new(4, 1, 0)));
    }

    pub fn set_firmware(&self, pid: u16, firmware: Version) {
        if let Some(p) = self.fleet.positioners.lock().unwrap().get_mut(&pid) {
            p.firmware = firmware;
        }
    }

    pub fn set_status(&self, pid: u16, status: PositionerStatus) {
        if let Some(p) = self.fleet.positioners.lock().unwrap().get_mut(&pid) {
            p.status = status;
        }
    }

    pub fn insert_status(&self, pid: u16, bits: PositionerStatus) {
        if let Some(p) = self.fleet.positioners.lock().unwrap().get_mut(&pid) {
            p.status.insert(bits);
        }
    }

    pub fn set_position(&self, pid: u16, alpha: f64, beta: f64) {
        if let Some(p) = self.fleet.positioners.lock().unwrap().get_mut(&pid) {
            p.alpha = alpha;
            p.beta = beta;
        }
    }

    pub fn set_respond(&self, pid: u16, respond: bool) {
        if let Some(p) = self.fleet.positioners.lock().unwrap().get_mut(&pid) {
            p.respond = respond;
        }
    }

    pub fn position(&self, pid: u16) -> Option<(f64, f64)> {
        self.fleet
            .positioners
            .lock()
            .unwrap()
            .get(&pid)
            .map(|p| (p.alpha, p.beta))
    }

    /// Every `(positioner_id, command)` processed so far, in arrival order.
    pub fn command_log(&self) -> Vec<(u16, CommandID)> {
        self.fleet.command_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BusInterface for VirtualBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _bus: Option<usize>, frame: CanFrame) -> Result<()> {
        let (identifier, data) = codec::decode(&frame)
            .map_err(JaegerError::Decode)?;

        let targets: Vec<u16> = if identifier.positioner_id == 0 {
            self.fleet.positioners.lock().unwrap().keys().copied().collect()
        } else {
            vec![identifier.positioner_id]
        };

        for pid in targets {
            process_frame(&self.fleet, pid, identifier.command_id, identifier.uid, &data);
        }

        Ok(())
    }

    async fn recv(&self) -> Option<(Option<usize>, CanFrame)> {
        self.host_rx.lock().await.recv().await
    }
}

fn reply(fleet: &FleetState, pid: u16, command_id: CommandID, uid: u8, code: ResponseCode, data: &[u8]) {
    let identifier = codec::Identifier {
        positioner_id: pid,
        command_id,
        uid,
        response_code: code,
    };
    let mut payload = FrameData::new();
    payload.extend_from_slice(data).expect("reply payload fits one frame");
    let frame = CanFrame {
        arbitration_id: identifier.pack(),
        data: payload,
    };
    // The host reader may already be gone during shutdown.
    let _ = fleet.host_tx.send((None, frame));
}

fn process_frame(fleet: &Arc<FleetState>, pid: u16, command_id: CommandID, uid: u8, data: &FrameData) {
    {
        let positioners = fleet.positioners.lock().unwrap();
        match positioners.get(&pid) {
            Some(p) if p.respond => {}
            _ => return,
        }
    }

    fleet.command_log.lock().unwrap().push((pid, command_id));

    use CommandID::*;
    match command_id {
        GetId => reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]),

        GetFirmwareVersion => {
            let payload = {
                let positioners = fleet.positioners.lock().unwrap();
                commands::firmware_payload(&positioners[&pid].firmware)
            };
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &payload);
        }

        GetStatus => {
            let payload = {
                let positioners = fleet.positioners.lock().unwrap();
                commands::status_payload(positioners[&pid].status.bits())
            };
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &payload);
        }

        GetActualPosition => {
            let payload = {
                let positioners = fleet.positioners.lock().unwrap();
                let p = &positioners[&pid];
                commands::position_payload(p.alpha, p.beta)
            };
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &payload);
        }

        SetActualPosition => match commands::parse_position_payload(data) {
            Some((alpha, beta)) if (0.0..360.0).contains(&alpha) && (0.0..360.0).contains(&beta) => {
                let mut positioners = fleet.positioners.lock().unwrap();
                let p = positioners.get_mut(&pid).unwrap();
                p.alpha = alpha;
                p.beta = beta;
                drop(positioners);
                reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
            }
            Some(_) => reply(fleet, pid, command_id, uid, ResponseCode::ValueOutOfRange, &[]),
            None => reply(fleet, pid, command_id, uid, ResponseCode::IncorrectAmountOfData, &[]),
        },

        SetSpeed => match commands::parse_speed_payload(data) {
            Some(speed) => {
                fleet.positioners.lock().unwrap().get_mut(&pid).unwrap().speed = speed;
                reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
            }
            None => reply(fleet, pid, command_id, uid, ResponseCode::IncorrectAmountOfData, &[]),
        },

        GotoAlpha | GotoBeta | GotoRelativeAlpha | GotoRelativeBeta => {
            match commands::parse_angle_payload(data) {
                Some(angle) => {
                    start_axis_move(fleet, pid, command_id, angle);
                    reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
                }
                None => reply(fleet, pid, command_id, uid, ResponseCode::IncorrectAmountOfData, &[]),
            }
        }

        GoToDatums => {
            start_axis_move(fleet, pid, GotoAlpha, 0.0);
            start_axis_move(fleet, pid, GotoBeta, 0.0);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }
        GoToDatumAlpha => {
            start_axis_move(fleet, pid, GotoAlpha, 0.0);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }
        GoToDatumBeta => {
            start_axis_move(fleet, pid, GotoBeta, 0.0);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }

        SendNewTrajectory => match commands::parse_trajectory_counts(data) {
            Some((n_alpha, n_beta)) => {
                let mut positioners = fleet.positioners.lock().unwrap();
                let p = positioners.get_mut(&pid).unwrap();
                p.pending = Some(PendingTrajectory {
                    n_alpha: n_alpha as usize,
                    n_beta: n_beta as usize,
                    alpha: Vec::new(),
                    beta: Vec::new(),
                });
                p.status.insert(PositionerStatus::RECEIVING_TRAJECTORY);
                drop(positioners);
                reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
            }
            None => reply(fleet, pid, command_id, uid, ResponseCode::IncorrectAmountOfData, &[]),
        },

        SendTrajectoryData => handle_trajectory_data(fleet, pid, uid, data),

        TrajectoryTransmissionAbort => {
            let mut positioners = fleet.positioners.lock().unwrap();
            let p = positioners.get_mut(&pid).unwrap();
            p.pending = None;
            p.status.remove(
                PositionerStatus::RECEIVING_TRAJECTORY
                    | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                    | PositionerStatus::TRAJECTORY_BETA_RECEIVED,
            );
            drop(positioners);
            fleet.uploads.lock().unwrap().retain(|(p_id, _), _| *p_id != pid);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }

        StartTrajectory => {
            let trajectory = {
                let mut positioners = fleet.positioners.lock().unwrap();
                positioners.get_mut(&pid).unwrap().pending.take()
            };
            match trajectory {
                Some(t) if !t.alpha.is_empty() || !t.beta.is_empty() => {
                    start_trajectory_move(fleet, pid, t);
                    reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
                }
                _ => reply(fleet, pid, command_id, uid, ResponseCode::InvalidTrajectory, &[]),
            }
        }

        StopTrajectory => {
            halt(fleet, pid, true);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }

        SendTrajectoryAbort => {
            halt(fleet, pid, false);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }

        AlphaClosedLoopCollisionDetection
        | AlphaClosedLoopWithoutCollisionDetection
        | BetaClosedLoopCollisionDetection
        | BetaClosedLoopWithoutCollisionDetection
        | AlphaOpenLoopWithoutCollisionDetection
        | BetaOpenLoopWithoutCollisionDetection
        | SwitchOnPreciseMoveAlpha
        | SwitchOffPreciseMoveAlpha
        | SwitchOnPreciseMoveBeta
        | SwitchOffPreciseMoveBeta => {
            apply_mode(fleet, pid, command_id);
            reply(fleet, pid, command_id, uid, ResponseCode::CommandAccepted, &[]);
        }
    }
}

fn apply_mode(fleet: &FleetState, pid: u16, command_id: CommandID) {
    use CommandID::*;
    let mut positioners = fleet.positioners.lock().unwrap();
    let status = &mut positioners.get_mut(&pid).unwrap().status;
    match command_id {
        AlphaClosedLoopCollisionDetection => {
            status.insert(PositionerStatus::CLOSED_LOOP_ALPHA);
            status.remove(PositionerStatus::COLLISION_DETECT_ALPHA_DISABLE);
        }
        AlphaClosedLoopWithoutCollisionDetection => {
            status.insert(
                PositionerStatus::CLOSED_LOOP_ALPHA
                    | PositionerStatus::COLLISION_DETECT_ALPHA_DISABLE,
            );
        }
        BetaClosedLoopCollisionDetection => {
            status.insert(PositionerStatus::CLOSED_LOOP_BETA);
            status.remove(PositionerStatus::COLLISION_DETECT_BETA_DISABLE);
        }
        BetaClosedLoopWithoutCollisionDetection => {
            status.insert(
                PositionerStatus::CLOSED_LOOP_BETA
                    | PositionerStatus::COLLISION_DETECT_BETA_DISABLE,
            );
        }
        AlphaOpenLoopWithoutCollisionDetection => {
            status.remove(PositionerStatus::CLOSED_LOOP_ALPHA);
            status.insert(PositionerStatus::COLLISION_DETECT_ALPHA_DISABLE);
        }
        BetaOpenLoopWithoutCollisionDetection => {
            status.remove(PositionerStatus::CLOSED_LOOP_BETA);
            status.insert(PositionerStatus::COLLISION_DETECT_BETA_DISABLE);
        }
        SwitchOnPreciseMoveAlpha => status.insert(PositionerStatus::PRECISE_POSITIONING_ALPHA),
        SwitchOffPreciseMoveAlpha => status.remove(PositionerStatus::PRECISE_POSITIONING_ALPHA),
        SwitchOnPreciseMoveBeta => status.insert(PositionerStatus::PRECISE_POSITIONING_BETA),
        SwitchOffPreciseMoveBeta => status.remove(PositionerStatus::PRECISE_POSITIONING_BETA),
        _ => {}
    }
}

fn handle_trajectory_data(fleet: &Arc<FleetState>, pid: u16, uid: u8, data: &FrameData) {
    if data.is_empty() {
        reply(fleet, pid, CommandID::SendTrajectoryData, uid, ResponseCode::IncorrectAmountOfData, &[]);
        return;
    }

    let is_last = data[0] & codec::CHUNK_LAST != 0;
    let assembled = {
        let mut uploads = fleet.uploads.lock().unwrap();
        let buffer = uploads.entry((pid, uid)).or_default();
        buffer.push(data.clone());
        if is_last {
            let frames = uploads.remove(&(pid, uid)).unwrap();
            Some(codec::assemble_payload(&frames))
        } else {
            None
        }
    };

    let code = match assembled {
        None => ResponseCode::CommandAccepted,
        Some(Err(_)) => ResponseCode::InvalidTrajectory,
        Some(Ok(payload)) => {
            let mut positioners = fleet.positioners.lock().unwrap();
            let p = positioners.get_mut(&pid).unwrap();
            match parse_points(&payload, p.pending.as_ref()) {
                Some((alpha, beta)) => {
                    let pending = p.pending.as_mut().unwrap();
                    pending.alpha = alpha;
                    pending.beta = beta;
                    p.status.insert(
                        PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                            | PositionerStatus::TRAJECTORY_BETA_RECEIVED,
                    );
                    ResponseCode::CommandAccepted
                }
                None => ResponseCode::InvalidTrajectory,
            }
        }
    };

    reply(fleet, pid, CommandID::SendTrajectoryData, uid, code, &[]);
}

type AxisPoints = (Vec<(f64, f64)>, Vec<(f64, f64)>);

fn parse_points(payload: &[u8], pending: Option<&PendingTrajectory>) -> Option<AxisPoints> {
    let pending = pending?;
    let total = pending.n_alpha + pending.n_beta;
    if payload.len() != total * 8 {
        return None;
    }

    let mut points = payload
        .chunks(8)
        .map(commands::parse_trajectory_point)
        .collect::<Option<Vec<_>>>()?;

    let beta = points.split_off(pending.n_alpha);
    Some((points, beta))
}

fn start_axis_move(fleet: &Arc<FleetState>, pid: u16, axis_command: CommandID, angle: f64) {
    use CommandID::*;

    let (target, duration, epoch) = {
        let mut positioners = fleet.positioners.lock().unwrap();
        let p = positioners.get_mut(&pid).unwrap();

        let relative = matches!(axis_command, GotoRelativeAlpha | GotoRelativeBeta);
        let alpha_axis = matches!(axis_command, GotoAlpha | GotoRelativeAlpha);
        let current = if alpha_axis { p.alpha } else { p.beta };
        let target = if relative { current + angle } else { angle };

        let rpm = if alpha_axis { p.speed.0 } else { p.speed.1 };
        let deg_per_sec = f64::from(rpm.max(1)) * commands::RPM_TO_DEG_PER_SEC;
        let duration = ((target - current).abs() / deg_per_sec * fleet.time_scale).max(0.02);

        p.status.remove(PositionerStatus::DISPLACEMENT_COMPLETED);
        if alpha_axis {
            p.status.remove(PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA);
        } else {
            p.status.remove(PositionerStatus::DISPLACEMENT_COMPLETED_BETA);
        }

        (target, duration, p.move_epoch)
    };

    let fleet = Arc::clone(fleet);
    let alpha_axis = matches!(axis_command, GotoAlpha | GotoRelativeAlpha);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs_f64(duration)).await;
        let mut positioners = fleet.positioners.lock().unwrap();
        let Some(p) = positioners.get_mut(&pid) else { return };
        if p.move_epoch != epoch {
            return;
        }
        if alpha_axis {
            p.alpha = target;
            p.status.insert(PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA);
        } else {
            p.beta = target;
            p.status.insert(PositionerStatus::DISPLACEMENT_COMPLETED_BETA);
        }
        if p.status.contains(
            PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                | PositionerStatus::DISPLACEMENT_COMPLETED_BETA,
        ) {
            p.status.insert(PositionerStatus::DISPLACEMENT_COMPLETED);
        }
        debug!(pid, alpha_axis, target, "virtual move completed");
    });
}

fn start_trajectory_move(fleet: &Arc<FleetState>, pid: u16, trajectory: PendingTrajectory) {
    let (duration, alpha_target, beta_target, epoch) = {
        let mut positioners = fleet.positioners.lock().unwrap();
        let p = positioners.get_mut(&pid).unwrap();

        let last_time = trajectory
            .alpha
            .last()
            .map(|(_, t)| *t)
            .into_iter()
            .chain(trajectory.beta.last().map(|(_, t)| *t))
            .fold(0.0f64, f64::max);

        let alpha_target = trajectory.alpha.last().map(|(a, _)| *a).unwrap_or(p.alpha);
        let beta_target = trajectory.beta.last().map(|(b, _)| *b).unwrap_or(p.beta);

        p.status.remove(
            PositionerStatus::DISPLACEMENT_COMPLETED
                | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                | PositionerStatus::DISPLACEMENT_COMPLETED_BETA
                | PositionerStatus::RECEIVING_TRAJECTORY
                | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
                | PositionerStatus::TRAJECTORY_BETA_RECEIVED,
        );

        ((last_time * fleet.time_scale).max(0.02), alpha_target, beta_target, p.move_epoch)
    };

    let fleet = Arc::clone(fleet);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs_f64(duration)).await;
        let mut positioners = fleet.positioners.lock().unwrap();
        let Some(p) = positioners.get_mut(&pid) else { return };
        if p.move_epoch != epoch {
            return;
        }
        p.alpha = alpha_target;
        p.beta = beta_target;
        p.status.insert(
            PositionerStatus::DISPLACEMENT_COMPLETED
                | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
                | PositionerStatus::DISPLACEMENT_COMPLETED_BETA,
        );
    });
}

/// Halts motion. `clear_collisions` distinguishes `STOP_TRAJECTORY` from
/// `SEND_TRAJECTORY_ABORT`.
fn halt(fleet: &FleetState, pid: u16, clear_collisions: bool) {
    let mut positioners = fleet.positioners.lock().unwrap();
    let p = positioners.get_mut(&pid).unwrap();
    p.move_epoch += 1;
    p.pending = None;
    p.status.insert(
        PositionerStatus::DISPLACEMENT_COMPLETED
            | PositionerStatus::DISPLACEMENT_COMPLETED_ALPHA
            | PositionerStatus::DISPLACEMENT_COMPLETED_BETA,
    );
    p.status.remove(
        PositionerStatus::RECEIVING_TRAJECTORY
            | PositionerStatus::TRAJECTORY_ALPHA_RECEIVED
            | PositionerStatus::TRAJECTORY_BETA_RECEIVED,
    );
    if clear_collisions {
        p.status.remove(PositionerStatus::COLLISION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_for(command_id: CommandID, pid: u16, uid: u8, payload: &[u8]) -> CanFrame {
        codec::encode(command_id, pid, uid, payload).remove(0)
    }

    #[tokio::test]
    async fn test_get_status_replies_with_status_word() {
        let bus = VirtualBus::new("virt").with_positioners(1);
        bus.send(None, frame_for(CommandID::GetStatus, 1, 7, &[])).await.unwrap();

        let (_, frame) = bus.recv().await.unwrap();
        let (identifier, data) = codec::decode(&frame).unwrap();
        assert_eq!(identifier.positioner_id, 1);
        assert_eq!(identifier.uid, 7);
        assert_eq!(identifier.response_code, ResponseCode::CommandAccepted);

        let bits = commands::parse_status_payload(&data).unwrap();
        let status = PositionerStatus::from_bits_truncate(bits);
        assert!(status.contains(PositionerStatus::DISPLACEMENT_COMPLETED));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_positioners() {
        let bus = VirtualBus::new("virt").with_positioners(3);
        bus.send(None, frame_for(CommandID::GetFirmwareVersion, 0, 1, &[])).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (_, frame) = bus.recv().await.unwrap();
            let (identifier, _) = codec::decode(&frame).unwrap();
            seen.push(identifier.positioner_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_silent_positioner_does_not_reply() {
        let bus = VirtualBus::new("virt").with_positioners(2);
        bus.set_respond(2, false);
        bus.send(None, frame_for(CommandID::GetId, 0, 0, &[])).await.unwrap();

        let (_, frame) = bus.recv().await.unwrap();
        let (identifier, _) = codec::decode(&frame).unwrap();
        assert_eq!(identifier.positioner_id, 1);

        // No second reply should be pending.
        let pending =
            tokio::time::timeout(Duration::from_millis(50), bus.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_stop_trajectory_clears_collision_bits() {
        let bus = VirtualBus::new("virt").with_positioners(1);
        bus.insert_status(1, PositionerStatus::COLLISION_BETA);

        bus.send(None, frame_for(CommandID::SendTrajectoryAbort, 1, 0, &[])).await.unwrap();
        let _ = bus.recv().await.unwrap();
        let log = bus.command_log();
        assert_eq!(log.last(), Some(&(1, CommandID::SendTrajectoryAbort)));

        // Abort keeps the collided flag; stop clears it.
        bus.send(None, frame_for(CommandID::GetStatus, 1, 1, &[])).await.unwrap();
        let (_, frame) = bus.recv().await.unwrap();
        let (_, data) = codec::decode(&frame).unwrap();
        let bits = commands::parse_status_payload(&data).unwrap();
        assert!(PositionerStatus::from_bits_truncate(bits).collided());

        bus.send(None, frame_for(CommandID::StopTrajectory, 1, 2, &[])).await.unwrap();
        let _ = bus.recv().await.unwrap();

        bus.send(None, frame_for(CommandID::GetStatus, 1, 3, &[])).await.unwrap();
        let (_, frame) = bus.recv().await.unwrap();
        let (_, data) = codec::decode(&frame).unwrap();
        let bits = commands::parse_status_payload(&data).unwrap();
        assert!(!PositionerStatus::from_bits_truncate(bits).collided());
    }
}
