//! The Focal Plane System: the fleet aggregate.
//!
//! `Fps` owns the positioner table, the positioner-to-bus map (through the
//! dispatcher), the lock discipline and the pollers, and exposes the
//! high-level operations: `initialise`, `update_status`, `update_position`,
//! `goto`, `send_trajectory`, `stop_trajectory`, `lock`, `unlock` and
//! `shutdown`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::BusInterface;
use crate::commands::{self, Command, CommandID};
use crate::config::Config;
use crate::dispatcher::CanDispatcher;
use crate::error::{JaegerError, Result};
use crate::logging;
use crate::maskbits::{FPSStatus, PositionerStatus};
use crate::poller::{Poller, PollerList};
use crate::positioner::Positioner;
use crate::trajectory::{self, Trajectory, TrajectoryData};

pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Settle time after an emergency stop before new commands go out.
const STOP_SETTLE: Duration = Duration::from_millis(500);

/// Explicit singleton registry: at most one live `Fps` per registry. The
/// runtime (CLI or test) owns the registry value.
#[derive(Default)]
pub struct FpsRegistry {
    inner: Mutex<Option<Weak<Fps>>>,
}

impl FpsRegistry {
    pub fn new() -> Arc<FpsRegistry> {
        Arc::new(FpsRegistry::default())
    }

    /// The running instance, if any.
    pub fn instance(&self) -> Option<Arc<Fps>> {
        self.inner.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn register(&self, fps: &Arc<Fps>) -> Result<()> {
        let mut slot = self.inner.lock().unwrap();
        if slot.as_ref().and_then(Weak::upgrade).is_some() {
            return Err(JaegerError::AlreadyRunning);
        }
        *slot = Some(Arc::downgrade(fps));
        Ok(())
    }

    pub fn discard(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

/// Event published to the external actor on lock-state changes.
#[derive(Debug, Clone, Serialize)]
pub struct LockEvent {
    pub locked: bool,
    pub locked_by: Vec<u16>,
    pub locked_axes: String,
    pub locked_alpha: f64,
    pub locked_beta: f64,
}

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    locked_by: Vec<u16>,
}

impl std::fmt::Debug for Fps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fps").finish_non_exhaustive()
    }
}

pub struct Fps {
    registry: Arc<FpsRegistry>,
    config: Config,
    interfaces: Vec<Arc<dyn BusInterface>>,
    can: Mutex<Option<Arc<CanDispatcher>>>,
    positioners: RwLock<IndexMap<u16, Positioner>>,
    disabled: Mutex<HashSet<u16>>,
    lock_state: Mutex<LockState>,
    status: Mutex<FPSStatus>,
    status_tx: broadcast::Sender<FPSStatus>,
    event_tx: broadcast::Sender<LockEvent>,
    pollers: PollerList,
    initialised: AtomicBool,
}

impl Fps {
    /// Builds an FPS over the given interfaces and registers it. Does not
    /// start the CAN layer; call `start_can` and `initialise`, or use
    /// `create` for the whole sequence.
    pub fn new(
        registry: &Arc<FpsRegistry>,
        config: Config,
        interfaces: Vec<Arc<dyn BusInterface>>,
    ) -> Result<Arc<Fps>> {
        logging::start_file_loggers(&config);

        if registry.instance().is_some() {
            return Err(JaegerError::AlreadyRunning);
        }

        if config.fps.use_lock {
            let path = &config.files.lock_file;
            if path.exists() {
                return Err(JaegerError::LockFilePresent(path.clone()));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path)?;
        }

        let (status_tx, _) = broadcast::channel(64);
        let (event_tx, _) = broadcast::channel(16);

        let fps = Arc::new(Fps {
            registry: Arc::clone(registry),
            config,
            interfaces,
            can: Mutex::new(None),
            positioners: RwLock::new(IndexMap::new()),
            disabled: Mutex::new(HashSet::new()),
            lock_state: Mutex::new(LockState::default()),
            status: Mutex::new(FPSStatus::default()),
            status_tx,
            event_tx,
            pollers: PollerList::default(),
            initialised: AtomicBool::new(false),
        });

        if let Err(err) = registry.register(&fps) {
            fps.remove_lock_file();
            return Err(err);
        }

        Ok(fps)
    }

    /// Builds, starts and initialises an FPS in one call. Replaces a stale
    /// registry entry if one exists.
    pub async fn create(
        registry: &Arc<FpsRegistry>,
        config: Config,
        interfaces: Vec<Arc<dyn BusInterface>>,
    ) -> Result<Arc<Fps>> {
        registry.discard();
        let fps = Fps::new(registry, config, interfaces)?;
        fps.start_can()?;
        fps.initialise(None, true).await?;
        Ok(fps)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FpsRegistry> {
        &self.registry
    }

    /// Starts the dispatcher over the configured interfaces. Idempotent.
    pub fn start_can(&self) -> Result<()> {
        let mut can = self.can.lock().unwrap();
        if can.is_none() {
            *can = Some(CanDispatcher::start(self.interfaces.clone()));
        }
        Ok(())
    }

    fn can(&self) -> Result<Arc<CanDispatcher>> {
        self.can.lock().unwrap().clone().ok_or(JaegerError::CanNotStarted)
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Relaxed)
    }

    pub fn locked(&self) -> bool {
        self.lock_state.lock().unwrap().locked
    }

    pub fn locked_by(&self) -> Vec<u16> {
        self.lock_state.lock().unwrap().locked_by.clone()
    }

    pub fn status(&self) -> FPSStatus {
        *self.status.lock().unwrap()
    }

    pub fn moving(&self) -> bool {
        self.status().intersects(FPSStatus::MOVING)
    }

    /// Updates the fleet status, emitting one event per change.
    pub fn set_status(&self, new: FPSStatus) {
        let mut current = self.status.lock().unwrap();
        if *current != new {
            *current = new;
            let _ = self.status_tx.send(new);
        }
    }

    /// Every status transition is observable through this channel.
    pub fn subscribe_status(&self) -> broadcast::Receiver<FPSStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LockEvent> {
        self.event_tx.subscribe()
    }

    pub fn pollers(&self) -> &PollerList {
        &self.pollers
    }

    pub async fn is_bootloader(&self) -> bool {
        self.positioners.read().await.values().any(Positioner::is_bootloader)
    }

    pub async fn contains(&self, pid: u16) -> bool {
        self.positioners.read().await.contains_key(&pid)
    }

    pub async fn positioner(&self, pid: u16) -> Option<Positioner> {
        self.positioners.read().await.get(&pid).cloned()
    }

    pub async fn positioner_ids(&self) -> Vec<u16> {
        self.positioners.read().await.keys().copied().collect()
    }

    pub async fn n_positioners(&self) -> usize {
        self.positioners.read().await.len()
    }

    /// Position snapshot as `(id, alpha, beta)` tuples.
    pub async fn get_positions(&self, ignore_disabled: bool) -> Vec<(u16, Option<f64>, Option<f64>)> {
        self.positioners
            .read()
            .await
            .values()
            .filter(|p| !ignore_disabled || !p.disabled)
            .map(|p| (p.id, p.alpha, p.beta))
            .collect()
    }

    pub async fn add_positioner(&self, positioner: Positioner) -> Result<()> {
        let mut positioners = self.positioners.write().await;
        if positioners.contains_key(&positioner.id) {
            return Err(JaegerError::Internal(format!(
                "positioner {} is already in the table",
                positioner.id
            )));
        }
        positioners.insert(positioner.id, positioner);
        Ok(())
    }

    /// Validates and queues a command. The returned handle must be awaited
    /// (`wait()`) for completion.
    ///
    /// An empty positioner list selects every non-disabled known positioner.
    pub async fn send_command(&self, mut command: Command) -> Result<Arc<Command>> {
        let can = self.can()?;

        if command.positioner_ids().is_empty() {
            let default: Vec<u16> = self
                .positioners
                .read()
                .await
                .values()
                .filter(|p| !p.disabled)
                .map(|p| p.id)
                .collect();
            command.set_positioner_ids(default);
            if command.positioner_ids().is_empty() {
                // Nothing to address; complete trivially.
                let command = Arc::new(command);
                command.finish(commands::CommandStatus::Done);
                return Ok(command);
            }
        }

        let descriptor = command.descriptor();
        let broadcast = command.is_broadcast();

        if broadcast && !descriptor.broadcastable {
            return Err(JaegerError::Usage(format!(
                "{:?} cannot be broadcast",
                command.command_id()
            )));
        }

        if self.locked() && !descriptor.safe {
            command.cancel(true);
            return Err(JaegerError::FpsLocked);
        }

        if self.moving() && descriptor.move_command {
            command.cancel(true);
            return Err(JaegerError::FpsMoving);
        }

        {
            let positioners = self.positioners.read().await;

            if !broadcast {
                if let Some(missing) = command
                    .positioner_ids()
                    .iter()
                    .copied()
                    .find(|pid| !positioners.contains_key(pid))
                {
                    return Err(JaegerError::UnknownPositioner { id: missing });
                }
            }

            if !descriptor.safe {
                let involved: Vec<u16> = if broadcast {
                    positioners.values().filter(|p| p.disabled).map(|p| p.id).collect()
                } else {
                    command
                        .positioner_ids()
                        .iter()
                        .copied()
                        .filter(|pid| positioners[pid].disabled)
                        .collect()
                };
                if !involved.is_empty() {
                    return Err(JaegerError::DisabledInvolved { ids: involved });
                }
            }

            let in_bootloader = if broadcast {
                positioners.values().any(Positioner::is_bootloader)
            } else {
                command
                    .positioner_ids()
                    .iter()
                    .any(|pid| positioners[pid].is_bootloader())
            };
            if in_bootloader && !descriptor.bootloader {
                return Err(JaegerError::InBootloader);
            }
        }

        let command = Arc::new(command);
        can.enqueue(Arc::clone(&command)).await?;
        Ok(command)
    }

    /// Fire-and-forget emergency send, bypassing the queue and tracking.
    pub async fn send_now(&self, command: Command) -> Result<()> {
        let can = self.can()?;
        can.send_now(&command).await;
        Ok(())
    }

    /// Brings the fleet up: discovers positioners, initialises each one,
    /// applies loop-mode policy and starts the pollers.
    pub async fn initialise(
        self: &Arc<Self>,
        start_pollers: Option<bool>,
        keep_disabled: bool,
    ) -> Result<()> {
        let fps_config = self.config.fps.clone();
        let start_pollers = start_pollers.unwrap_or(fps_config.start_pollers);
        let discovery_timeout = Duration::from_secs_f64(fps_config.initialise_timeouts);

        if keep_disabled {
            let positioners = self.positioners.read().await;
            let mut disabled = self.disabled.lock().unwrap();
            for p in positioners.values() {
                if p.offline || p.disabled {
                    disabled.insert(p.id);
                } else {
                    disabled.remove(&p.id);
                }
            }
        } else {
            self.disabled.lock().unwrap().clear();
        }

        self.positioners.write().await.clear();
        self.pollers.stop().await;

        self.start_can()?;
        if self.interfaces.is_empty() {
            warn!("CAN interfaces not found");
            return Ok(());
        }
        let can = self.can()?;
        can.clear_routes();

        self.refresh_positioner_bus_map().await?;

        let fw_command = self
            .send_command(
                Command::broadcast(CommandID::GetFirmwareVersion).with_timeout(discovery_timeout),
            )
            .await?;
        if !fw_command.wait().await.succeeded() {
            return Err(JaegerError::Internal(
                "failed retrieving firmware versions".into(),
            ));
        }

        {
            let mut positioners = self.positioners.write().await;
            let mut disabled = self.disabled.lock().unwrap();
            for reply in fw_command.replies() {
                let Some(version) = commands::parse_firmware_payload(&reply.data) else {
                    continue;
                };
                let entry = positioners
                    .entry(reply.positioner_id)
                    .or_insert_with(|| Positioner::new(reply.positioner_id));
                entry.firmware = Some(version);
                entry.interface = Some(reply.interface);
                entry.bus = reply.bus;
                can.set_route(reply.positioner_id, reply.interface, reply.bus);

                if fps_config.disabled_positioners.contains(&entry.id)
                    || disabled.contains(&entry.id)
                {
                    entry.disabled = true;
                    disabled.insert(entry.id);
                }
            }

            for (&pid, &(alpha, beta)) in &fps_config.offline_positioners {
                positioners
                    .entry(pid)
                    .and_modify(|p| {
                        p.disabled = true;
                        p.offline = true;
                        p.update_position(alpha, beta);
                    })
                    .or_insert_with(|| Positioner::offline_at(pid, alpha, beta));
                disabled.insert(pid);
            }
        }

        self.initialised.store(true, Ordering::Relaxed);

        let connected: Vec<u16> = {
            let positioners = self.positioners.read().await;
            let mut ids: Vec<u16> = positioners
                .values()
                .filter(|p| !p.offline)
                .map(|p| p.id)
                .collect();
            ids.sort_unstable();
            ids
        };

        if connected.is_empty() {
            warn!("no positioners found");
            return Ok(());
        }
        info!("found {} connected positioners: {:?}", connected.len(), connected);

        {
            let positioners = self.positioners.read().await;
            let versions: HashSet<String> = positioners
                .values()
                .filter(|p| !p.offline)
                .filter_map(|p| p.firmware.as_ref().map(ToString::to_string))
                .collect();
            if versions.len() > 1 {
                warn!("found positioners with different firmware versions");
            }
        }

        if self.is_bootloader().await {
            let in_boot: Vec<u16> = {
                let positioners = self.positioners.read().await;
                positioners
                    .values()
                    .filter(|p| p.is_bootloader())
                    .map(|p| p.id)
                    .collect()
            };
            warn!("positioners in bootloader mode: {in_boot:?}");
            return Ok(());
        }

        // Stop all positioners just in case. This does not clear collided
        // flags.
        self.stop_trajectory(false).await?;

        let disable_precise = self.config.positioner.disable_precise_moves;
        let online: Vec<u16> = {
            let positioners = self.positioners.read().await;
            positioners
                .values()
                .filter(|p| !p.offline)
                .map(|p| p.id)
                .collect()
        };
        try_join_all(
            online
                .iter()
                .map(|&pid| self.initialise_positioner(pid, disable_precise)),
        )
        .await?;

        let locked_by: Vec<u16> = {
            let positioners = self.positioners.read().await;
            positioners
                .values()
                .filter(|p| p.collision())
                .map(|p| p.id)
                .collect()
        };
        if !locked_by.is_empty() {
            self.lock(true, Some(locked_by), false, false).await?;
            warn!("the FPS was collided and has been locked");
        }

        if let Some(min_beta) = self.config.safe_mode.min_beta() {
            warn!("safe mode enabled; minimum beta is {min_beta} degrees");
        }

        self.apply_loop_modes(&fps_config).await?;

        self.update_status(None, DEFAULT_STATUS_TIMEOUT).await?;

        if start_pollers && !self.is_bootloader().await {
            self.start_pollers();
        }

        Ok(())
    }

    /// Loop-mode policy: collision detection disabled or open loop for the
    /// configured lists, closed loop with collision detection for the rest.
    async fn apply_loop_modes(&self, fps_config: &crate::config::FpsConfig) -> Result<()> {
        let known_enabled: Vec<u16> = {
            let positioners = self.positioners.read().await;
            positioners
                .values()
                .filter(|p| !p.disabled)
                .map(|p| p.id)
                .collect()
        };

        let no_collision: Vec<u16> = fps_config
            .disable_collision_detection_positioners
            .iter()
            .copied()
            .filter(|pid| known_enabled.contains(pid))
            .collect();
        if !no_collision.is_empty() {
            if self.locked() {
                warn!("the FPS is locked; cannot disable collision detection");
            } else {
                warn!("disabling collision detection for positioners: {no_collision:?}");
                for command_id in [
                    CommandID::AlphaClosedLoopWithoutCollisionDetection,
                    CommandID::BetaClosedLoopWithoutCollisionDetection,
                ] {
                    let command = self
                        .send_command(Command::new(command_id, no_collision.clone()))
                        .await?;
                    command.wait().await;
                }
            }
        }

        let open_loop: Vec<u16> = fps_config
            .open_loop_positioners
            .iter()
            .copied()
            .filter(|pid| known_enabled.contains(pid))
            .collect();
        if !open_loop.is_empty() {
            if self.locked() {
                warn!("the FPS is locked; cannot set open loop mode");
            } else {
                warn!("setting open loop mode for positioners: {open_loop:?}");
                for command_id in [
                    CommandID::AlphaOpenLoopWithoutCollisionDetection,
                    CommandID::BetaOpenLoopWithoutCollisionDetection,
                ] {
                    let command = self
                        .send_command(Command::new(command_id, open_loop.clone()))
                        .await?;
                    command.wait().await;
                }
            }
        }

        if !self.locked() {
            let closed_loop: Vec<u16> = known_enabled
                .iter()
                .copied()
                .filter(|pid| !no_collision.contains(pid) && !open_loop.contains(pid))
                .collect();
            if !closed_loop.is_empty() {
                for command_id in [
                    CommandID::AlphaClosedLoopCollisionDetection,
                    CommandID::BetaClosedLoopCollisionDetection,
                ] {
                    let command = self
                        .send_command(Command::new(command_id, closed_loop.clone()))
                        .await?;
                    command.wait().await;
                }
            }
        }

        Ok(())
    }

    /// Discovers which interface and bus each positioner answers on. Skipped
    /// for a single-interface, single-bus setup.
    async fn refresh_positioner_bus_map(&self) -> Result<()> {
        let can = self.can()?;
        if can.num_interfaces() == 1 && !can.multibus() {
            return Ok(());
        }

        let timeout = Duration::from_secs_f64(self.config.fps.initialise_timeouts);
        let command = self
            .send_command(Command::broadcast(CommandID::GetId).with_timeout(timeout))
            .await?;
        command.wait().await;

        for reply in command.replies() {
            can.set_route(reply.positioner_id, reply.interface, reply.bus);
        }
        Ok(())
    }

    /// Configures one positioner after discovery: refreshes its status and
    /// applies the precise-move policy.
    async fn initialise_positioner(&self, pid: u16, disable_precise_moves: bool) -> Result<()> {
        let (firmware, disabled) = {
            let positioners = self.positioners.read().await;
            let p = positioners
                .get(&pid)
                .ok_or(JaegerError::UnknownPositioner { id: pid })?;
            (p.firmware.clone(), p.disabled)
        };

        if firmware.is_none() {
            return Err(JaegerError::PositionerInitFailed {
                id: pid,
                cause: "no firmware version".into(),
            });
        }

        let status_command = self
            .send_command(
                Command::new(CommandID::GetStatus, vec![pid]).with_timeout(DEFAULT_STATUS_TIMEOUT),
            )
            .await?;
        if !status_command.wait().await.succeeded() {
            return Err(JaegerError::PositionerInitFailed {
                id: pid,
                cause: "failed retrieving status".into(),
            });
        }

        let raw = status_command.positioner_status().get(&pid).copied();
        {
            let mut positioners = self.positioners.write().await;
            if let Some(p) = positioners.get_mut(&pid) {
                if let Some(raw) = raw {
                    p.update_status(raw);
                }
                if p.is_bootloader() {
                    p.initialised = true;
                    return Ok(());
                }
            }
        }

        if disable_precise_moves && !disabled {
            let mut refused = false;
            for command_id in [
                CommandID::SwitchOffPreciseMoveAlpha,
                CommandID::SwitchOffPreciseMoveBeta,
            ] {
                let command = self
                    .send_command(Command::new(command_id, vec![pid]))
                    .await?;
                if !command.wait().await.succeeded() {
                    // Refusal is logged but not escalated; precise_moves
                    // stays true so the condition remains visible.
                    warn!(pid, "unable to disable precise moves");
                    refused = true;
                }
            }
            if !refused {
                if let Some(p) = self.positioners.write().await.get_mut(&pid) {
                    p.precise_moves = false;
                }
            }
        }

        if let Some(p) = self.positioners.write().await.get_mut(&pid) {
            p.initialised = true;
        }
        Ok(())
    }

    /// Refreshes positioner statuses and re-derives the fleet status.
    pub async fn update_status(
        &self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
    ) -> Result<bool> {
        self.update_status_inner(positioner_ids, timeout, false).await
    }

    fn update_status_inner<'a>(
        &'a self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
        is_retry: bool,
    ) -> futures::future::BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.positioners.read().await.is_empty() {
                return Ok(true);
            }

            let pids = positioner_ids.unwrap_or_else(|| vec![0]);

            let n_positioners = if pids == [0] {
                let positioners = self.positioners.read().await;
                let valid = positioners.values().filter(|p| !p.offline).count();
                (valid > 0).then_some(valid)
            } else {
                None
            };

            let _ = self.update_firmware_version(timeout).await;

            let mut command = Command::new(CommandID::GetStatus, pids.clone()).with_timeout(timeout);
            if let Some(n) = n_positioners {
                command = command.with_n_positioners(n);
            }
            let command = self.send_command(command).await?;
            let status = command.wait().await;

            if status.failed() {
                warn!("GET_STATUS failed during update status");
                return Ok(false);
            }
            if status.timed_out() {
                if !is_retry && n_positioners.is_some() {
                    warn!("GET_STATUS timed out; retrying");
                    return self.update_status_inner(Some(pids), timeout, true).await;
                }
                return Ok(false);
            }

            if command.replies().is_empty() {
                return Ok(true);
            }

            {
                let mut positioners = self.positioners.write().await;
                for (pid, raw) in command.positioner_status() {
                    if let Some(p) = positioners.get_mut(&pid) {
                        p.update_status(raw);
                    }
                }
            }

            self.rederive_status().await;
            Ok(true)
        })
    }

    /// Reduces per-positioner bits into the fleet status, preserving the
    /// non-motion bits.
    async fn rederive_status(&self) {
        let (any_collided, all_complete) = {
            let positioners = self.positioners.read().await;
            let enabled: Vec<&Positioner> =
                positioners.values().filter(|p| !p.disabled).collect();
            let any_collided = enabled.iter().any(|p| p.collision());
            let all_complete = enabled
                .iter()
                .all(|p| p.status.contains(PositionerStatus::DISPLACEMENT_COMPLETED));
            (any_collided, all_complete)
        };

        let motion = if any_collided {
            FPSStatus::COLLIDED
        } else if all_complete {
            FPSStatus::IDLE
        } else {
            FPSStatus::MOVING
        };

        self.set_status(self.status().with_motion(motion));
    }

    /// Refreshes firmware versions fleet-wide; retries once on timeout.
    pub async fn update_firmware_version(&self, timeout: Duration) -> Result<bool> {
        self.update_firmware_inner(timeout, false).await
    }

    fn update_firmware_inner<'a>(
        &'a self,
        timeout: Duration,
        is_retry: bool,
    ) -> futures::future::BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.positioners.read().await.is_empty() {
                return Ok(true);
            }

            let n_positioners = {
                let positioners = self.positioners.read().await;
                let valid = positioners.values().filter(|p| !p.offline).count();
                (valid > 0).then_some(valid)
            };

            let mut command =
                Command::broadcast(CommandID::GetFirmwareVersion).with_timeout(timeout);
            if let Some(n) = n_positioners {
                command = command.with_n_positioners(n);
            }
            let command = self.send_command(command).await?;
            let status = command.wait().await;

            if status.failed() {
                warn!("failed retrieving firmware versions");
                return Ok(false);
            }
            if status.timed_out() {
                if !is_retry && n_positioners.is_some() {
                    warn!("GET_FIRMWARE_VERSION timed out; retrying");
                    return self.update_firmware_inner(timeout, true).await;
                }
                return Ok(false);
            }

            let mut positioners = self.positioners.write().await;
            for (pid, version) in command.firmware_versions() {
                if let Some(p) = positioners.get_mut(&pid) {
                    p.firmware = Some(version);
                }
            }
            Ok(true)
        })
    }

    /// Refreshes positions for the given (or all initialised) positioners.
    /// Returns the position snapshot; empty when nothing was addressable.
    pub async fn update_position(
        &self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
    ) -> Result<Vec<(u16, Option<f64>, Option<f64>)>> {
        self.update_position_inner(positioner_ids, timeout, false).await
    }

    fn update_position_inner<'a>(
        &'a self,
        positioner_ids: Option<Vec<u16>>,
        timeout: Duration,
        is_retry: bool,
    ) -> futures::future::BoxFuture<'a, Result<Vec<(u16, Option<f64>, Option<f64>)>>> {
        Box::pin(async move {
            let pids: Vec<u16> = {
                let positioners = self.positioners.read().await;
                if positioners.is_empty() || positioners.values().all(|p| p.offline) {
                    return Ok(Vec::new());
                }

                let candidates: Vec<u16> = match &positioner_ids {
                    Some(pids) => pids.clone(),
                    None => positioners
                        .values()
                        .filter(|p| p.initialised && !p.is_bootloader())
                        .map(|p| p.id)
                        .collect(),
                };

                candidates
                    .into_iter()
                    .filter(|pid| {
                        positioners
                            .get(pid)
                            .map(|p| !p.disabled && !p.offline)
                            .unwrap_or(false)
                    })
                    .collect()
            };

            if pids.is_empty() {
                return Ok(Vec::new());
            }

            let command = self
                .send_command(
                    Command::new(CommandID::GetActualPosition, pids.clone()).with_timeout(timeout),
                )
                .await?;
            let status = command.wait().await;

            if status.failed() {
                return Err(JaegerError::Internal(
                    "GET_ACTUAL_POSITION failed during update position".into(),
                ));
            }
            if status.timed_out() {
                if !is_retry {
                    warn!("GET_ACTUAL_POSITION timed out; retrying");
                    return self.update_position_inner(Some(pids), timeout, true).await;
                }
                return Err(JaegerError::TimedOut {
                    command_id: CommandID::GetActualPosition,
                    pids,
                    elapsed: command.elapsed(),
                });
            }

            {
                let mut positioners = self.positioners.write().await;
                for (pid, (alpha, beta)) in command.positions() {
                    if let Some(p) = positioners.get_mut(&pid) {
                        p.update_position(alpha, beta);
                    }
                }
            }

            Ok(self.get_positions(false).await)
        })
    }

    /// Stops all positioners. Soft mode (`clear_flags = false`) sends
    /// `SEND_TRAJECTORY_ABORT` and keeps collided flags; hard mode sends
    /// `STOP_TRAJECTORY`, which clears them. Both bypass the queue.
    pub async fn stop_trajectory(&self, clear_flags: bool) -> Result<()> {
        let can = self.can()?;

        let command = if clear_flags {
            Command::broadcast(CommandID::StopTrajectory)
        } else {
            let pids: Vec<u16> = {
                let positioners = self.positioners.read().await;
                positioners.values().filter(|p| !p.disabled).map(|p| p.id).collect()
            };
            if pids.is_empty() {
                Command::broadcast(CommandID::SendTrajectoryAbort)
            } else {
                Command::new(CommandID::SendTrajectoryAbort, pids)
            }
        };
        can.send_now(&command).await;

        for running in can.running_commands() {
            if running.descriptor().move_command && !running.status().is_done() {
                running.cancel(true);
            }
        }
        can.refresh_running_commands();

        // The stop was fire-and-forget; give the positioners time to settle
        // before anything else hits the bus.
        tokio::time::sleep(STOP_SETTLE).await;
        Ok(())
    }

    /// Locks the fleet: only safe commands are accepted until `unlock`.
    pub async fn lock(
        &self,
        stop_trajectories: bool,
        by: Option<Vec<u16>>,
        do_warn: bool,
        snapshot: bool,
    ) -> Result<()> {
        self.lock_state.lock().unwrap().locked = true;
        if do_warn {
            warn!("locking the FPS");
        }

        if stop_trajectories {
            self.stop_trajectory(false).await?;
        }

        self.update_status(None, DEFAULT_STATUS_TIMEOUT).await?;

        let mut axes = "?".to_string();
        let mut alpha = -999.0;
        let mut beta = -999.0;

        if let Some(by) = by.filter(|by| !by.is_empty()) {
            {
                let mut state = self.lock_state.lock().unwrap();
                for pid in &by {
                    if !state.locked_by.contains(pid) {
                        state.locked_by.push(*pid);
                    }
                }
            }

            if let Some(first) = self.positioner(by[0]).await {
                let collided_alpha = first.status.contains(PositionerStatus::COLLISION_ALPHA);
                let collided_beta = first.status.contains(PositionerStatus::COLLISION_BETA);
                axes = match (collided_alpha, collided_beta) {
                    (true, true) => "both",
                    (true, false) => "alpha",
                    (false, true) => "beta",
                    (false, false) => "?",
                }
                .to_string();
                alpha = first.alpha.unwrap_or(-999.0);
                beta = first.beta.unwrap_or(-999.0);
            }
        }

        let event = LockEvent {
            locked: true,
            locked_by: self.locked_by(),
            locked_axes: axes,
            locked_alpha: alpha,
            locked_beta: beta,
        };
        let _ = self.event_tx.send(event);

        if snapshot {
            debug!("lock snapshot requested for {:?}", self.locked_by());
        }

        Ok(())
    }

    /// Unlocks the fleet after clearing collided flags. Fails and re-locks
    /// if any positioner still reports a collision (unless `force`).
    pub async fn unlock(&self, force: bool) -> Result<()> {
        self.stop_trajectory(true).await?;
        self.update_status(None, DEFAULT_STATUS_TIMEOUT).await?;

        if !force {
            let still: Vec<u16> = {
                let positioners = self.positioners.read().await;
                positioners
                    .values()
                    .filter(|p| p.collision())
                    .map(|p| p.id)
                    .collect()
            };
            if !still.is_empty() {
                self.lock_state.lock().unwrap().locked = true;
                return Err(JaegerError::StillCollided { ids: still });
            }
        }

        {
            let mut state = self.lock_state.lock().unwrap();
            state.locked = false;
            state.locked_by.clear();
        }
        self.remove_lock_file();
        Ok(())
    }

    /// Moves positioners to absolute or relative `(alpha, beta)` targets,
    /// waits for the motion to finish, and always refreshes status and
    /// position afterwards.
    pub async fn goto(
        self: &Arc<Self>,
        new_positions: std::collections::HashMap<u16, (f64, f64)>,
        speed: Option<f64>,
        relative: bool,
    ) -> Result<()> {
        let result = trajectory::goto(self, &new_positions, speed, relative).await;

        let status_refresh = self.update_status(None, DEFAULT_STATUS_TIMEOUT).await;
        let position_refresh = self.update_position(None, DEFAULT_STATUS_TIMEOUT).await;

        result?;
        status_refresh?;
        position_refresh?;
        Ok(())
    }

    /// Uploads and runs a multi-point trajectory.
    pub async fn send_trajectory(self: &Arc<Self>, data: TrajectoryData) -> Result<Trajectory> {
        trajectory::send_trajectory(self, data).await
    }

    /// Fire-and-forget trajectory abort.
    pub fn abort(self: &Arc<Self>) -> JoinHandle<()> {
        let fps = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = fps.stop_trajectory(false).await {
                warn!("abort failed: {err}");
            }
        })
    }

    /// Homes one positioner by sending it to its datums.
    pub async fn home(&self, pid: u16, alpha: bool, beta: bool) -> Result<()> {
        {
            let positioners = self.positioners.read().await;
            let p = positioners
                .get(&pid)
                .ok_or(JaegerError::UnknownPositioner { id: pid })?;
            if !p.initialised {
                return Err(JaegerError::Usage(format!("positioner {pid} is not initialised")));
            }
            if p.disabled || p.offline {
                return Err(JaegerError::DisabledInvolved { ids: vec![pid] });
            }
        }

        let command_id = match (alpha, beta) {
            (true, true) => CommandID::GoToDatums,
            (true, false) => CommandID::GoToDatumAlpha,
            (false, true) => CommandID::GoToDatumBeta,
            (false, false) => return Ok(()),
        };

        let command = self.send_command(Command::new(command_id, vec![pid])).await?;
        if !command.wait().await.succeeded() {
            return Err(JaegerError::Internal(format!(
                "homing command failed for positioner {pid}"
            )));
        }

        self.wait_until_idle(Duration::from_secs(120)).await?;
        self.update_position(Some(vec![pid]), DEFAULT_STATUS_TIMEOUT).await?;
        Ok(())
    }

    /// Overwrites the firmware's idea of the current angles.
    pub async fn set_position(&self, pid: u16, alpha: f64, beta: f64) -> Result<()> {
        if !(0.0..360.0).contains(&alpha) || !(0.0..360.0).contains(&beta) {
            return Err(JaegerError::Usage(
                "alpha and beta must be in the range [0, 360)".into(),
            ));
        }

        let command = self
            .send_command(
                Command::new(CommandID::SetActualPosition, vec![pid])
                    .with_data(commands::position_payload(alpha, beta)),
            )
            .await?;
        if !command.wait().await.succeeded() {
            return Err(JaegerError::Internal(format!(
                "failed setting position for positioner {pid}"
            )));
        }

        if let Some(p) = self.positioners.write().await.get_mut(&pid) {
            p.update_position(alpha, beta);
        }
        Ok(())
    }

    /// Polls the fleet status until it leaves `MOVING`. Locks and fails on
    /// a collision.
    pub(crate) async fn wait_until_idle(&self, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.update_status(None, DEFAULT_STATUS_TIMEOUT).await?;

            let status = self.status();
            if status.intersects(FPSStatus::COLLIDED) {
                let ids: Vec<u16> = {
                    let positioners = self.positioners.read().await;
                    positioners
                        .values()
                        .filter(|p| p.collision())
                        .map(|p| p.id)
                        .collect()
                };
                self.lock(true, Some(ids.clone()), true, true).await?;
                return Err(JaegerError::CollisionDetected { ids });
            }
            if status.intersects(FPSStatus::IDLE) {
                return Ok(());
            }
            if start.elapsed() > deadline {
                return Err(JaegerError::Trajectory {
                    reason: "timed out waiting for the fleet to stop moving".into(),
                    partial: None,
                });
            }
        }
    }

    /// Per-positioner report used by the CLI and the actor surface.
    pub async fn report_status(&self) -> serde_json::Value {
        let positioners = self.positioners.read().await;
        let mut report = serde_json::Map::new();
        for p in positioners.values() {
            report.insert(
                p.id.to_string(),
                serde_json::json!({
                    "position": [p.alpha, p.beta],
                    "status": p.status.bits(),
                    "status_bits": p.status.active_bits(),
                    "firmware": p.firmware.as_ref().map(ToString::to_string),
                    "disabled": p.disabled,
                    "offline": p.offline,
                    "initialised": p.initialised,
                }),
            );
        }
        serde_json::json!({
            "positioners": report,
            "locked": self.locked(),
            "locked_by": self.locked_by(),
            "status": self.status().bits(),
        })
    }

    /// Starts the status and position pollers.
    pub fn start_pollers(self: &Arc<Self>) {
        let status_delay = Duration::from_secs_f64(self.config.fps.status_poller_delay);
        let position_delay = Duration::from_secs_f64(self.config.fps.position_poller_delay);

        let weak = Arc::downgrade(self);
        let status_poller = Poller::new("status", status_delay, move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(fps) = weak.upgrade() {
                    fps.update_status(None, DEFAULT_STATUS_TIMEOUT).await?;
                }
                Ok(())
            })
        });

        let weak = Arc::downgrade(self);
        let position_poller = Poller::new("position", position_delay, move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(fps) = weak.upgrade() {
                    fps.update_position(None, DEFAULT_STATUS_TIMEOUT).await?;
                }
                Ok(())
            })
        });

        self.pollers.set(vec![status_poller, position_poller]);
        self.pollers.start();
    }

    /// Stops the fleet, the pollers and the dispatcher, removes the lock
    /// sentinel and deregisters the instance.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_bootloader().await {
            info!("stopping positioners and shutting down");
            let _ = self.stop_trajectory(false).await;
        }

        debug!("stopping all pollers");
        self.pollers.stop().await;

        debug!("cancelling pending commands and stopping the dispatcher");
        if let Some(can) = self.can.lock().unwrap().take() {
            can.stop();
        }

        self.remove_lock_file();
        self.registry.discard();
        Ok(())
    }

    fn remove_lock_file(&self) {
        if self.config.fps.use_lock {
            let _ = std::fs::remove_file(&self.config.files.lock_file);
        }
    }
}
