//! Coordinated moves: `goto` and the chunked trajectory upload primitive.
//!
//! A trajectory is a time-parameterised multi-point path per positioner and
//! axis, uploaded in chunks (`SEND_NEW_TRAJECTORY`, `SEND_TRAJECTORY_DATA`)
//! and triggered atomically with `START_TRAJECTORY`. `goto` is the simpler
//! per-positioner form built on `SET_SPEED` + `GOTO_{ALPHA,BETA}` commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::commands::{self, Command, CommandID, RPM_TO_DEG_PER_SEC};
use crate::error::{JaegerError, Result};
use crate::fps::{Fps, DEFAULT_STATUS_TIMEOUT};

/// Valid motor speed range in RPM.
pub const SPEED_RANGE: (f64, f64) = (100.0, 4000.0);

/// One positioner's path: `(degrees, seconds)` points per axis.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryPath {
    pub alpha: Vec<(f64, f64)>,
    pub beta: Vec<(f64, f64)>,
}

pub type TrajectoryData = HashMap<u16, TrajectoryPath>;

/// Handle describing an upload, kept for diagnostics when it fails.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub data: TrajectoryData,
    /// Seconds until the slowest positioner finishes.
    pub move_time: f64,
    /// Positioners whose upload completed.
    pub uploaded: Vec<u16>,
    pub started: bool,
}

fn trajectory_move_time(data: &TrajectoryData) -> f64 {
    data.values()
        .flat_map(|path| {
            path.alpha
                .last()
                .map(|&(_, t)| t)
                .into_iter()
                .chain(path.beta.last().map(|&(_, t)| t))
        })
        .fold(0.0f64, f64::max)
}

fn validate_axis(pid: u16, axis: &str, points: &[(f64, f64)]) -> Result<()> {
    if points.is_empty() {
        return Err(JaegerError::Trajectory {
            reason: format!("positioner {pid}: empty {axis} trajectory"),
            partial: None,
        });
    }

    for window in points.windows(2) {
        if window[1].1 <= window[0].1 {
            return Err(JaegerError::Trajectory {
                reason: format!("positioner {pid}: {axis} times are not strictly increasing"),
                partial: None,
            });
        }
    }

    if points.iter().any(|&(position, time)| {
        !(0.0..360.0).contains(&position) || time < 0.0
    }) {
        return Err(JaegerError::Usage(format!(
            "positioner {pid}: {axis} trajectory points out of range"
        )));
    }

    Ok(())
}

async fn validate(fps: &Arc<Fps>, data: &TrajectoryData) -> Result<()> {
    let min_beta = fps.config().safe_mode.min_beta();

    for (&pid, path) in data {
        let positioner = fps
            .positioner(pid)
            .await
            .ok_or(JaegerError::UnknownPositioner { id: pid })?;
        if positioner.disabled || positioner.offline {
            return Err(JaegerError::DisabledInvolved { ids: vec![pid] });
        }

        validate_axis(pid, "alpha", &path.alpha)?;
        validate_axis(pid, "beta", &path.beta)?;

        if let Some(min_beta) = min_beta {
            if path.beta.iter().any(|&(position, _)| position < min_beta) {
                return Err(JaegerError::Usage(format!(
                    "positioner {pid}: beta below the safe-mode minimum of {min_beta} degrees"
                )));
            }
        }
    }

    Ok(())
}

pub(crate) async fn send_trajectory(fps: &Arc<Fps>, data: TrajectoryData) -> Result<Trajectory> {
    if fps.locked() {
        return Err(JaegerError::FpsLocked);
    }
    if fps.moving() {
        return Err(JaegerError::FpsMoving);
    }
    if data.is_empty() {
        return Err(JaegerError::Usage("empty trajectory".into()));
    }

    validate(fps, &data).await?;

    let move_time = trajectory_move_time(&data);
    let mut trajectory = Trajectory {
        data,
        move_time,
        uploaded: Vec::new(),
        started: false,
    };

    // The pollers would race the upload with status broadcasts.
    let pollers_running = fps.pollers().running();
    if pollers_running {
        fps.pollers().stop().await;
    }

    let result = upload_and_start(fps, &mut trajectory).await;

    if pollers_running {
        fps.pollers().start();
    }

    match result {
        Ok(()) => Ok(trajectory),
        Err(err) => Err(JaegerError::Trajectory {
            reason: err.to_string(),
            partial: Some(Box::new(trajectory)),
        }),
    }
}

async fn upload_and_start(fps: &Arc<Fps>, trajectory: &mut Trajectory) -> Result<()> {
    let pids: Vec<u16> = trajectory.data.keys().copied().collect();

    for &pid in &pids {
        let path = trajectory.data[&pid].clone();

        let new_command = fps
            .send_command(
                Command::new(CommandID::SendNewTrajectory, vec![pid]).with_data(
                    commands::trajectory_counts_payload(
                        path.alpha.len() as u32,
                        path.beta.len() as u32,
                    ),
                ),
            )
            .await?;
        if !new_command.wait().await.succeeded() {
            return Err(JaegerError::Internal(format!(
                "positioner {pid} rejected the new trajectory"
            )));
        }

        let mut payload = Vec::with_capacity((path.alpha.len() + path.beta.len()) * 8);
        for &(position, time) in path.alpha.iter().chain(path.beta.iter()) {
            payload.extend_from_slice(&commands::trajectory_point_bytes(position, time));
        }
        let data_command = fps
            .send_command(
                Command::new(CommandID::SendTrajectoryData, vec![pid]).with_data(payload),
            )
            .await?;
        if !data_command.wait().await.succeeded() {
            return Err(JaegerError::Internal(format!(
                "positioner {pid} rejected the trajectory data"
            )));
        }

        trajectory.uploaded.push(pid);
    }

    info!(
        "trajectory uploaded to {} positioners; move time {:.1}s",
        trajectory.uploaded.len(),
        trajectory.move_time
    );

    let start_command = fps
        .send_command(Command::new(CommandID::StartTrajectory, pids))
        .await?;
    if !start_command.wait().await.succeeded() {
        return Err(JaegerError::Internal("failed starting the trajectory".into()));
    }
    trajectory.started = true;

    let deadline = Duration::from_secs_f64(trajectory.move_time * 1.5 + 3.0);
    fps.wait_until_idle(deadline).await
}

pub(crate) async fn goto(
    fps: &Arc<Fps>,
    new_positions: &HashMap<u16, (f64, f64)>,
    speed: Option<f64>,
    relative: bool,
) -> Result<()> {
    if fps.locked() {
        return Err(JaegerError::FpsLocked);
    }
    if fps.moving() {
        return Err(JaegerError::FpsMoving);
    }

    if !relative
        && new_positions
            .values()
            .any(|&(alpha, beta)| alpha < 0.0 || beta < 0.0)
    {
        return Err(JaegerError::Usage(
            "negative angles are only allowed in relative mode".into(),
        ));
    }

    let speed = speed.unwrap_or(fps.config().positioner.motor_speed);
    if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&speed) {
        return Err(JaegerError::Usage(format!(
            "speed must be between {} and {} RPM",
            SPEED_RANGE.0, SPEED_RANGE.1
        )));
    }

    if let Some(min_beta) = fps.config().safe_mode.min_beta() {
        if !relative && new_positions.values().any(|&(_, beta)| beta < min_beta) {
            return Err(JaegerError::Usage(format!(
                "beta below the safe-mode minimum of {min_beta} degrees"
            )));
        }
    }

    let mut targets: Vec<(u16, f64, f64)> = Vec::new();
    for (&pid, &(alpha, beta)) in new_positions {
        let positioner = fps
            .positioner(pid)
            .await
            .ok_or(JaegerError::UnknownPositioner { id: pid })?;
        if positioner.disabled || positioner.offline {
            continue;
        }
        targets.push((pid, alpha, beta));
    }
    if targets.is_empty() {
        return Ok(());
    }

    let pids: Vec<u16> = targets.iter().map(|&(pid, _, _)| pid).collect();
    fps.update_position(Some(pids), DEFAULT_STATUS_TIMEOUT).await?;

    let pollers_running = fps.pollers().running();
    if pollers_running {
        fps.pollers().stop().await;
    }

    let result = dispatch_goto(fps, &targets, speed, relative).await;

    if pollers_running {
        fps.pollers().start();
    }

    result
}

async fn dispatch_goto(
    fps: &Arc<Fps>,
    targets: &[(u16, f64, f64)],
    speed: f64,
    relative: bool,
) -> Result<()> {
    let rpm = speed.round() as u32;

    let mut speed_commands = Vec::new();
    for &(pid, _, _) in targets {
        let command = fps
            .send_command(
                Command::new(CommandID::SetSpeed, vec![pid])
                    .with_data(commands::speed_payload(rpm, rpm)),
            )
            .await?;
        speed_commands.push(command);
    }
    for command in &speed_commands {
        if !command.wait().await.succeeded() {
            return Err(JaegerError::Internal("failed setting motor speed".into()));
        }
    }

    let (alpha_id, beta_id) = if relative {
        (CommandID::GotoRelativeAlpha, CommandID::GotoRelativeBeta)
    } else {
        (CommandID::GotoAlpha, CommandID::GotoBeta)
    };

    // Estimate the move before dispatch while positions are current.
    let deg_per_sec = speed * RPM_TO_DEG_PER_SEC;
    let mut longest = 0.0f64;
    for &(pid, alpha, beta) in targets {
        let positioner = fps
            .positioner(pid)
            .await
            .ok_or(JaegerError::UnknownPositioner { id: pid })?;
        let (delta_alpha, delta_beta) = if relative {
            (alpha.abs(), beta.abs())
        } else {
            (
                (alpha - positioner.alpha.unwrap_or(0.0)).abs(),
                (beta - positioner.beta.unwrap_or(0.0)).abs(),
            )
        };
        longest = longest.max(delta_alpha).max(delta_beta);
    }

    // Queue every axis command before awaiting any so no status refresh can
    // flip the fleet to MOVING mid-dispatch.
    let mut move_commands = Vec::new();
    for &(pid, alpha, beta) in targets {
        move_commands.push(
            fps.send_command(
                Command::new(alpha_id, vec![pid]).with_data(commands::angle_payload(alpha)),
            )
            .await?,
        );
        move_commands.push(
            fps.send_command(
                Command::new(beta_id, vec![pid]).with_data(commands::angle_payload(beta)),
            )
            .await?,
        );
    }
    for command in &move_commands {
        if !command.wait().await.succeeded() {
            return Err(JaegerError::Internal("goto command rejected".into()));
        }
    }

    let deadline = Duration::from_secs_f64(longest / deg_per_sec * 1.5 + 3.0);
    fps.wait_until_idle(deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(alpha: &[(f64, f64)], beta: &[(f64, f64)]) -> TrajectoryPath {
        TrajectoryPath {
            alpha: alpha.to_vec(),
            beta: beta.to_vec(),
        }
    }

    #[test]
    fn test_move_time_is_slowest_axis() {
        let mut data = TrajectoryData::new();
        data.insert(1, path(&[(10.0, 0.5), (20.0, 2.0)], &[(170.0, 0.5), (180.0, 4.0)]));
        data.insert(2, path(&[(0.0, 0.5), (5.0, 1.0)], &[(160.0, 0.5), (165.0, 1.5)]));
        assert_eq!(trajectory_move_time(&data), 4.0);
    }

    #[test]
    fn test_validate_axis_rejects_empty() {
        assert!(validate_axis(1, "alpha", &[]).is_err());
    }

    #[test]
    fn test_validate_axis_rejects_non_monotonic_times() {
        let points = [(10.0, 1.0), (20.0, 1.0)];
        assert!(validate_axis(1, "alpha", &points).is_err());
    }

    #[test]
    fn test_validate_axis_rejects_out_of_range_angles() {
        let points = [(10.0, 0.5), (380.0, 1.0)];
        assert!(matches!(
            validate_axis(1, "alpha", &points),
            Err(JaegerError::Usage(_))
        ));
    }

    #[test]
    fn test_validate_axis_accepts_well_formed_path() {
        let points = [(10.0, 0.5), (90.0, 1.5), (180.0, 3.0)];
        assert!(validate_axis(1, "alpha", &points).is_ok());
    }
}
